use std::sync::{Arc, Mutex};

use blendrig_core::synthetic::{add_blended_poses, bump_rig, mirrored_target};
use blendrig_core::{Gradients, Rig, Weights};
use blendrig_pipeline::{RigSolver, SolveConfig, SolveError, SolverState, Stage};

fn known_weights() -> Vec<Weights> {
    vec![vec![1.0, 0.0], vec![1.0, 0.5], vec![1.0, 1.0]]
}

fn source_rig() -> Rig {
    let mut rig = bump_rig(6, 6, &[1.0]);
    add_blended_poses(&mut rig, &known_weights()).unwrap();
    rig
}

/// No regularization anywhere except the fixed-vertex anchors, which pin the
/// translation of the reconstructed blendshape.
fn anchored_unregularized(num_iterations: usize) -> SolveConfig {
    let mut config = SolveConfig::unregularized();
    config.num_iterations = num_iterations;
    config.vertex.fixed_weight = 0.5;
    config.weights.max_iterations = 30;
    config
}

fn max_vertex_error(a: &Rig, b: &Rig, bs: usize) -> f64 {
    a.blendshape(bs)
        .mesh()
        .offsets_from(b.blendshape(bs).mesh())
        .iter()
        .map(|d| d.norm())
        .fold(0.0, f64::max)
}

#[test]
fn single_round_recovers_blendshape_and_weights() {
    let source = source_rig();
    let target = mirrored_target(&source).unwrap();

    let mut solver = RigSolver::new(anchored_unregularized(1));
    solver.set_source(source.clone()).unwrap();
    solver.set_target(target).unwrap();
    solver.solve().unwrap();
    assert_eq!(solver.state(), SolverState::Done);

    let target = solver.target().unwrap();
    let err = max_vertex_error(target, &source, 1);
    assert!(err < 1e-5, "blendshape 1 off by {err}");

    for (pose, expected) in known_weights().iter().enumerate() {
        let got = target.weights(pose);
        assert_eq!(got[0], 1.0, "neutral weight of pose {pose} changed");
        assert!(
            (got[1] - expected[1]).abs() < 1e-4,
            "pose {pose}: expected {}, got {}",
            expected[1],
            got[1]
        );
    }
}

#[test]
fn alternation_corrects_perturbed_weights() {
    let source = source_rig();
    let mut target = mirrored_target(&source).unwrap();
    target.pose_mut(1).set_weights(vec![1.0, 0.6]);
    target.pose_mut(2).set_weights(vec![1.0, 0.9]);

    let mut solver = RigSolver::new(anchored_unregularized(3));
    solver.set_source(source.clone()).unwrap();
    solver.set_target(target).unwrap();
    solver.solve().unwrap();

    // The scale of the blendshape is not identifiable from the poses alone;
    // what must hold is that blending reproduces every pose.
    let target = solver.target().unwrap();
    for pose in 0..target.num_poses() {
        let blended = target.generate_pose(target.weights(pose));
        let err = blended
            .offsets_from(target.pose(pose).mesh())
            .iter()
            .map(|d| d.norm())
            .fold(0.0, f64::max);
        assert!(err < 1e-3, "pose {pose} reproduced with error {err}");
    }
}

#[test]
fn neutral_gradients_and_weight_box_hold_every_round() {
    let source = source_rig();
    let target = mirrored_target(&source).unwrap();
    let initial = Gradients::target(&target);

    let mut config = SolveConfig::default();
    config.num_iterations = 3;
    let (min_w, max_w) = (config.weights.min_weight, config.weights.max_weight);

    let mut solver = RigSolver::new(config);
    solver.set_source(source).unwrap();
    solver.set_target(target).unwrap();

    let rounds = Arc::new(Mutex::new(0usize));
    let seen = Arc::clone(&rounds);
    solver.set_step_callback(
        Stage::Weights,
        Box::new(move |_: usize, rig: &Rig, _: &str| {
            for w in rig.all_weights() {
                assert!(
                    w[1..].iter().all(|v| (min_w..=max_w).contains(v)),
                    "weights left the box: {w:?}"
                );
            }
            *seen.lock().unwrap() += 1;
        }),
    );
    solver.solve().unwrap();
    assert_eq!(*rounds.lock().unwrap(), 3);

    let solved = solver.target_gradients().unwrap();
    for face in 0..solved.num_faces() {
        assert_eq!(solved.neutral(face), initial.neutral(face));
        assert_eq!(solved.affine_map(0, face), blendrig_core::Mat3::identity());
    }
}

#[test]
fn undetermined_gradients_abort_the_run() {
    let source = source_rig();
    let mut target = mirrored_target(&source).unwrap();
    // no pose uses blendshape 1, so with beta = 0 every face is singular
    for pose in 0..target.num_poses() {
        target.pose_mut(pose).set_weights(vec![1.0, 0.0]);
    }

    let mut solver = RigSolver::new(anchored_unregularized(2));
    solver.set_source(source).unwrap();
    solver.set_target(target).unwrap();

    let fired = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&fired);
    solver.set_step_callback(
        Stage::Vertex,
        Box::new(move |_: usize, _: &Rig, _: &str| *flag.lock().unwrap() = true),
    );

    let err = solver.solve().unwrap_err();
    assert!(matches!(err, SolveError::Gradient(_)), "got {err:?}");
    assert_eq!(solver.state(), SolverState::Failed);
    assert!(!*fired.lock().unwrap(), "later stages ran after a failure");

    let last = solver.log().last().unwrap();
    assert_eq!(last.operation, "gradient");
    assert!(!last.success);
}

#[test]
fn config_file_drives_the_run() {
    let dir = std::env::temp_dir().join(format!("blendrig-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("solve.json");
    let config = anchored_unregularized(1);
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

    let loaded = SolveConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded, config);

    let source = source_rig();
    let mut solver = RigSolver::new(loaded);
    solver.set_source(source.clone()).unwrap();
    solver.set_target(mirrored_target(&source).unwrap()).unwrap();
    solver.solve().unwrap();
    assert!(max_vertex_error(solver.target().unwrap(), &source, 1) < 1e-5);

    std::fs::remove_dir_all(&dir).ok();
}

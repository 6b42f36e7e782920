use blendrig_core::synthetic::{add_blended_poses, bump_rig, UniformVertexNoise};
use blendrig_core::{Rig, Schedule};
use blendrig_optim::{WeightsSolveOptions, WeightsSolver};

fn known_weights() -> Vec<Vec<f64>> {
    vec![
        vec![1.0, 0.8, 0.0],
        vec![1.0, 0.3, 0.6],
        vec![1.0, 0.0, 1.0],
        vec![1.0, 0.5, 0.5],
    ]
}

fn posed_rig() -> Rig {
    let mut rig = bump_rig(6, 6, &[1.0, 0.8]);
    add_blended_poses(&mut rig, &known_weights()).unwrap();
    rig
}

fn unregularized() -> WeightsSolveOptions {
    WeightsSolveOptions {
        lambda: Schedule::constant(0.0),
        max_iterations: 30,
        ..WeightsSolveOptions::default()
    }
}

#[test]
fn recovers_known_weights_without_regularization() {
    let mut rig = posed_rig();
    for pose in 0..rig.num_poses() {
        rig.pose_mut(pose).set_weights(vec![1.0, 0.5, 0.5]);
    }

    let mut solver = WeightsSolver::new(unregularized());
    solver.init(&rig).unwrap();
    let reports = solver.solve(0, &mut rig).unwrap();
    assert_eq!(reports.len(), 4);

    for (pose, expected) in known_weights().iter().enumerate() {
        let got = rig.weights(pose);
        assert_eq!(got[0], 1.0, "neutral weight changed for pose {pose}");
        for bs in 1..3 {
            assert!(
                (got[bs] - expected[bs]).abs() < 1e-4,
                "pose {pose} bs {bs}: expected {}, got {}",
                expected[bs],
                got[bs]
            );
        }
    }
}

#[test]
fn weights_stay_in_the_box() {
    let mut rig = bump_rig(6, 6, &[1.0, 0.8]);
    // outside the box on purpose: 1.6 and -0.4
    add_blended_poses(&mut rig, &[vec![1.0, 1.6, -0.4], vec![1.0, 0.2, 0.4]]).unwrap();
    for pose in 0..rig.num_poses() {
        rig.pose_mut(pose).set_weights(vec![1.0, 0.5, 0.5]);
    }

    let mut solver = WeightsSolver::new(WeightsSolveOptions {
        multithreaded: false,
        ..unregularized()
    });
    solver.init(&rig).unwrap();
    solver.solve(0, &mut rig).unwrap();

    for pose in 0..rig.num_poses() {
        for &w in rig.weights(pose) {
            assert!((0.0..=1.0).contains(&w), "pose {pose}: weight {w} escaped the box");
        }
    }
}

#[test]
fn strong_regularization_keeps_initial_weights() {
    let mut rig = posed_rig();
    let initial = vec![1.0, 0.4, 0.4];
    for pose in 0..rig.num_poses() {
        rig.pose_mut(pose).set_weights(initial.clone());
    }

    let mut solver = WeightsSolver::new(WeightsSolveOptions {
        lambda: Schedule::constant(1e8),
        ..WeightsSolveOptions::default()
    });
    solver.init(&rig).unwrap();
    solver.solve(0, &mut rig).unwrap();

    for pose in 0..rig.num_poses() {
        for bs in 1..3 {
            let w = rig.weight(pose, bs);
            assert!((w - 0.4).abs() < 1e-2, "pose {pose} bs {bs}: {w}");
        }
    }
}

#[test]
fn noisy_poses_still_land_close() {
    let mut rig = posed_rig();
    let noise = UniformVertexNoise {
        seed: 7,
        max_abs: 1e-3,
    };
    let mut noisy = Rig::new(rig.neutral().clone());
    for bs in 1..rig.num_blendshapes() {
        noisy
            .add_blendshape(rig.blendshape(bs).mesh().clone(), 1e-9)
            .unwrap();
    }
    for pose in 0..rig.num_poses() {
        let mut mesh = rig.pose(pose).mesh().clone();
        noise.apply(pose, &mut mesh);
        noisy.add_pose(mesh, vec![1.0, 0.5, 0.5]).unwrap();
    }
    rig = noisy;

    let mut solver = WeightsSolver::new(unregularized());
    solver.init(&rig).unwrap();
    solver.solve(0, &mut rig).unwrap();

    for (pose, expected) in known_weights().iter().enumerate() {
        for bs in 1..3 {
            let got = rig.weight(pose, bs);
            assert!(
                (got - expected[bs]).abs() < 0.05,
                "pose {pose} bs {bs}: expected {}, got {got}",
                expected[bs]
            );
        }
    }
}

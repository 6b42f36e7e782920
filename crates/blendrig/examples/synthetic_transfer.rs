//! Blendshape transfer on a synthetic rig.
//!
//! 1. Build a source rig with two bump blendshapes and four example poses
//! 2. Build a target that only knows the neutral, the poses and noisy weights
//! 3. Alternate gradient fit, vertex reconstruction and weight refit
//! 4. Compare the estimated blendshapes and weights with the ground truth
//!
//! Run with: `cargo run -p blendrig --example synthetic_transfer`

use anyhow::Result;
use blendrig::prelude::*;
use blendrig::synthetic::{add_blended_poses, bump_rig, mirrored_target};

fn max_offset_error(estimated: &Mesh, truth: &Mesh) -> Real {
    estimated
        .offsets_from(truth)
        .iter()
        .map(|d| d.norm())
        .fold(0.0, Real::max)
}

fn main() -> Result<()> {
    println!("=== Blendshape Transfer (Synthetic Rig) ===\n");

    let weights = vec![
        vec![1.0, 1.0, 0.0],
        vec![1.0, 0.0, 1.0],
        vec![1.0, 0.4, 0.7],
        vec![1.0, 0.8, 0.3],
    ];
    let mut source = bump_rig(10, 10, &[1.0, 0.7]);
    add_blended_poses(&mut source, &weights)?;
    println!(
        "Source rig: {} vertices, {} faces, {} blendshapes, {} poses\n",
        source.num_vertices(),
        source.num_faces(),
        source.num_blendshapes(),
        source.num_poses()
    );

    let mut target = mirrored_target(&source)?;
    target.randomize_weights(7);
    println!("Initial target weights:");
    for (pose, w) in target.all_weights().iter().enumerate() {
        println!("  pose {pose}: {:.3?}", &w[1..]);
    }

    let mut config = SolveConfig::default();
    config.num_iterations = 6;
    config.weights.lambda = Schedule::continuous([(0, 10.0), (5, 0.0)])?;

    let mut solver = RigSolver::new(config);
    solver.set_source(source.clone())?;
    solver.set_target(target)?;
    solver.set_step_callback(
        Stage::Weights,
        Box::new(|iteration: usize, rig: &Rig, _: &str| {
            let w: Vec<_> = rig.all_weights().iter().map(|w| w[1..].to_vec()).collect();
            println!("  round {iteration}: {w:.3?}");
        }),
    );

    println!("\n--- Solving ---");
    solver.solve()?;

    let Some(estimated) = solver.target() else {
        anyhow::bail!("target rig was unbound during the solve");
    };
    println!("\n--- Results ---");
    for bs in 1..estimated.num_blendshapes() {
        let err = max_offset_error(estimated.blendshape(bs).mesh(), source.blendshape(bs).mesh());
        println!("  blendshape {bs}: max vertex error {err:.2e}");
    }
    for (pose, (est, truth)) in estimated.all_weights().iter().zip(&weights).enumerate() {
        println!("  pose {pose}: estimated {:.3?}, truth {:.3?}", &est[1..], &truth[1..]);
    }

    println!("\nSession log:");
    for entry in solver.log() {
        let status = if entry.success { "ok" } else { "FAILED" };
        println!(
            "  [{status}] {} {}",
            entry.operation,
            entry.iteration.map(|i| i.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

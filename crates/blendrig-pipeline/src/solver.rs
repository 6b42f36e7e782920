//! Alternating optimization of a target rig against a source rig.
//!
//! One round runs the three stages in strict sequence:
//!
//! 1. **Gradient** (Stage A): per-face deformation gradients of the unknown
//!    target blendshapes.
//! 2. **Vertex** (Stage T): blendshape meshes reconstructed from those
//!    gradients.
//! 3. **Weights** (Stage B): per-pose blend weights refit against the new
//!    blendshapes.
//!
//! Every stage is keyed by the round index so the schedules in
//! [`SolveConfig`] resolve per round. A failing stage aborts the run and
//! leaves the solver in [`SolverState::Failed`].

use std::fmt;

use blendrig_core::{Gradients, Real, Rig};
use blendrig_linear::{GradientSolver, VertexSolver};
use blendrig_optim::WeightsSolver;
use log::{debug, error, info, warn};

use crate::session::{LogEntry, Stage};
use crate::{SolveConfig, SolveError};

/// Called after a stage completes with the round index, the target rig and
/// the configured debug path (empty when unset).
pub type StepCallback = Box<dyn FnMut(usize, &Rig, &str) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Idle,
    GradientInit,
    VertexInit,
    WeightsInit,
    Iterating,
    Done,
    Failed,
}

pub struct RigSolver {
    config: SolveConfig,
    source: Option<Rig>,
    target: Option<Rig>,
    source_gradients: Option<Gradients>,
    target_gradients: Option<Gradients>,
    gradient: GradientSolver,
    vertex: VertexSolver,
    weights: WeightsSolver,
    callbacks: [Option<StepCallback>; 3],
    state: SolverState,
    log: Vec<LogEntry>,
}

impl fmt::Debug for RigSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RigSolver")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("source_bound", &self.source.is_some())
            .field("target_bound", &self.target.is_some())
            .field(
                "callbacks",
                &Stage::ALL
                    .iter()
                    .filter(|s| self.callbacks[s.index()].is_some())
                    .map(|s| s.name())
                    .collect::<Vec<_>>(),
            )
            .field("log_entries", &self.log.len())
            .finish()
    }
}

impl Default for RigSolver {
    fn default() -> Self {
        Self::new(SolveConfig::default())
    }
}

fn require<'a, T>(slot: &'a Option<T>, what: &str) -> Result<&'a T, SolveError> {
    slot.as_ref()
        .ok_or_else(|| SolveError::Binding(format!("{what} is not bound")))
}

fn require_mut<'a, T>(slot: &'a mut Option<T>, what: &str) -> Result<&'a mut T, SolveError> {
    slot.as_mut()
        .ok_or_else(|| SolveError::Binding(format!("{what} is not bound")))
}

/// Source and target must share the neutral topology and blendshape count.
fn check_compatible(source: &Rig, target: &Rig) -> Result<(), SolveError> {
    if !source.neutral().same_topology(target.neutral()) {
        return Err(SolveError::Binding(format!(
            "neutral topologies differ: source {} vertices / {} faces, target {} vertices / {} faces",
            source.num_vertices(),
            source.num_faces(),
            target.num_vertices(),
            target.num_faces()
        )));
    }
    if source.num_blendshapes() != target.num_blendshapes() {
        return Err(SolveError::Binding(format!(
            "source has {} blendshapes, target has {}",
            source.num_blendshapes(),
            target.num_blendshapes()
        )));
    }
    Ok(())
}

impl RigSolver {
    pub fn new(config: SolveConfig) -> Self {
        Self {
            gradient: GradientSolver::new(config.gradient_options()),
            vertex: VertexSolver::new(config.vertex.clone()),
            weights: WeightsSolver::new(config.weights_options()),
            config,
            source: None,
            target: None,
            source_gradients: None,
            target_gradients: None,
            callbacks: [None, None, None],
            state: SolverState::Idle,
            log: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Binding
    // ─────────────────────────────────────────────────────────────────────

    /// Bind the rig whose blendshapes are known.
    ///
    /// # Errors
    ///
    /// [`SolveError::Binding`] if the rig is invalid, has no non-neutral
    /// blendshape or does not match an already bound target.
    pub fn set_source(&mut self, source: Rig) -> Result<(), SolveError> {
        let result = self.bind_source(source);
        self.record("bind_source", &result);
        result
    }

    fn bind_source(&mut self, mut source: Rig) -> Result<(), SolveError> {
        source
            .validate()
            .map_err(|e| SolveError::Binding(format!("source rig: {e}")))?;
        if source.num_blendshapes() < 2 {
            return Err(SolveError::Binding(
                "source rig has no blendshape besides the neutral".to_string(),
            ));
        }
        if let Some(target) = &self.target {
            check_compatible(&source, target)?;
            // the target's region drives every stage
            source.set_region(target.region().cloned());
        }
        self.source_gradients = Some(Gradients::source(&source));
        self.source = Some(source);
        self.reset_stages();
        Ok(())
    }

    /// Bind the rig whose blendshapes are estimated.
    ///
    /// Non-neutral blendshape meshes are starting guesses only; their
    /// gradients are treated as unknown.
    ///
    /// # Errors
    ///
    /// [`SolveError::Binding`] if the rig is invalid or does not match an
    /// already bound source.
    pub fn set_target(&mut self, target: Rig) -> Result<(), SolveError> {
        let result = self.bind_target(target);
        self.record("bind_target", &result);
        result
    }

    fn bind_target(&mut self, target: Rig) -> Result<(), SolveError> {
        target
            .validate()
            .map_err(|e| SolveError::Binding(format!("target rig: {e}")))?;
        if let Some(source) = self.source.as_mut() {
            check_compatible(source, &target)?;
            source.set_region(target.region().cloned());
        }
        self.target_gradients = Some(Gradients::target(&target));
        self.target = Some(target);
        self.reset_stages();
        Ok(())
    }

    /// Restrict solving to the faces around `vertices` on both rigs.
    ///
    /// Cached stage state is dropped since it depends on the active region.
    pub fn set_vertex_mask(&mut self, vertices: &[usize]) -> Result<(), SolveError> {
        let target = require_mut(&mut self.target, "target rig")?;
        target.set_vertex_mask(vertices)?;
        let region = target.region().cloned();
        if let Some(source) = self.source.as_mut() {
            source.set_region(region);
        }
        self.reset_stages();
        Ok(())
    }

    /// Derive the active region from the target poses: every vertex moved by
    /// more than `eps` in some pose.
    pub fn detect_active_region(&mut self, eps: Real) -> Result<usize, SolveError> {
        let target = require_mut(&mut self.target, "target rig")?;
        target.find_modified(eps);
        let region = target.region().cloned();
        let active = target.num_active_vertices();
        if let Some(source) = self.source.as_mut() {
            source.set_region(region);
        }
        info!("active region: {} vertices", active);
        self.reset_stages();
        Ok(active)
    }

    /// Replace the configuration; stage state is rebuilt on the next run.
    pub fn set_config(&mut self, config: SolveConfig) -> Result<(), SolveError> {
        config.validate()?;
        self.config = config;
        self.reset_stages();
        Ok(())
    }

    pub fn set_step_callback(&mut self, stage: Stage, callback: StepCallback) {
        self.callbacks[stage.index()] = Some(callback);
    }

    pub fn clear_step_callback(&mut self, stage: Stage) {
        self.callbacks[stage.index()] = None;
    }

    fn reset_stages(&mut self) {
        self.gradient = GradientSolver::new(self.config.gradient_options());
        self.vertex = VertexSolver::new(self.config.vertex.clone());
        self.weights = WeightsSolver::new(self.config.weights_options());
        self.state = SolverState::Idle;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Running
    // ─────────────────────────────────────────────────────────────────────

    /// Initialize all stages and run `num_iterations` rounds.
    ///
    /// # Errors
    ///
    /// The first failing stage aborts the run. Its error is returned and the
    /// state becomes [`SolverState::Failed`]; the target keeps whatever the
    /// completed work wrote.
    pub fn solve(&mut self) -> Result<(), SolveError> {
        let rounds = self.config.num_iterations;
        info!("solving rig: {} iterations", rounds);

        if let Err(e) = self.config.validate().and_then(|_| self.initialize()) {
            error!("initialization failed: {}", e);
            self.record("init", &Err(e.clone()));
            self.state = SolverState::Failed;
            return Err(e);
        }
        self.log.push(LogEntry::success("init"));

        self.state = SolverState::Iterating;
        for iteration in 0..rounds {
            self.run_stage(Stage::Gradient, iteration, None)?;
            self.run_stage(Stage::Vertex, iteration, None)?;
            self.run_stage(Stage::Weights, iteration, None)?;
        }

        self.state = SolverState::Done;
        info!("rig solved");
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), SolveError> {
        let source = require(&self.source, "source rig")?;
        let target = require(&self.target, "target rig")?;
        let source_g = require(&self.source_gradients, "source gradients")?;
        let target_g = require(&self.target_gradients, "target gradients")?;
        check_compatible(source, target)?;

        self.state = SolverState::GradientInit;
        self.gradient.init(source_g, target_g)?;
        self.state = SolverState::VertexInit;
        self.vertex.init(source, target)?;
        self.state = SolverState::WeightsInit;
        self.weights.init(target)?;
        Ok(())
    }

    /// Run Stage A once, initializing it first if needed.
    pub fn step_gradient(&mut self, iteration: usize) -> Result<(), SolveError> {
        self.run_stage(Stage::Gradient, iteration, None)
    }

    /// Run Stage T once for one blendshape or (with `None`) every one.
    pub fn step_vertex(
        &mut self,
        iteration: usize,
        blendshape: Option<usize>,
    ) -> Result<(), SolveError> {
        self.run_stage(Stage::Vertex, iteration, blendshape)
    }

    /// Run Stage B once.
    pub fn step_weights(&mut self, iteration: usize) -> Result<(), SolveError> {
        self.run_stage(Stage::Weights, iteration, None)
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        iteration: usize,
        blendshape: Option<usize>,
    ) -> Result<(), SolveError> {
        let result = self.execute(stage, iteration, blendshape);
        match &result {
            Ok(notes) => {
                let entry = match notes {
                    Some(n) => LogEntry::success_with_notes(stage.name(), n.as_str()),
                    None => LogEntry::success(stage.name()),
                };
                self.log.push(entry.at_iteration(iteration));
                self.notify(stage, iteration);
            }
            Err(e) => {
                error!("{} stage [{}] failed: {}", stage.name(), iteration, e);
                self.log
                    .push(LogEntry::failure(stage.name(), e.to_string()).at_iteration(iteration));
                self.state = SolverState::Failed;
            }
        }
        result.map(|_| ())
    }

    fn execute(
        &mut self,
        stage: Stage,
        iteration: usize,
        blendshape: Option<usize>,
    ) -> Result<Option<String>, SolveError> {
        match stage {
            Stage::Gradient => {
                if !self.gradient.is_initialized() {
                    let source_g = require(&self.source_gradients, "source gradients")?;
                    let target_g = require(&self.target_gradients, "target gradients")?;
                    self.gradient.init(source_g, target_g)?;
                }
                let target = require(&self.target, "target rig")?;
                let target_g = require_mut(&mut self.target_gradients, "target gradients")?;
                self.gradient.solve(iteration, target, target_g)?;
                Ok(None)
            }
            Stage::Vertex => {
                if !self.vertex.is_initialized() {
                    let source = require(&self.source, "source rig")?;
                    let target = require(&self.target, "target rig")?;
                    self.vertex.init(source, target)?;
                }
                let target_g = require(&self.target_gradients, "target gradients")?;
                let target = require_mut(&mut self.target, "target rig")?;
                self.vertex.solve(iteration, blendshape, target, target_g)?;
                Ok(None)
            }
            Stage::Weights => {
                if !self.weights.is_initialized() {
                    self.weights.init(require(&self.target, "target rig")?)?;
                }
                let target = require_mut(&mut self.target, "target rig")?;
                let reports = self.weights.solve(iteration, target)?;
                let unconverged = reports.iter().filter(|r| !r.converged).count();
                if unconverged > 0 {
                    warn!(
                        "weights stage [{}]: {} of {} poses did not converge",
                        iteration,
                        unconverged,
                        reports.len()
                    );
                }
                let cost: Real = reports.iter().map(|r| r.final_cost).sum();
                debug!("weights stage [{}]: total cost {:e}", iteration, cost);
                Ok(Some(format!("total cost {cost:e}")))
            }
        }
    }

    fn notify(&mut self, stage: Stage, iteration: usize) {
        let (Some(callback), Some(target)) =
            (self.callbacks[stage.index()].as_mut(), self.target.as_ref())
        else {
            return;
        };
        let path = self.config.debug_path.as_deref().unwrap_or("");
        callback(iteration, target, path);
    }

    fn record(&mut self, operation: &str, result: &Result<(), SolveError>) {
        let entry = match result {
            Ok(()) => LogEntry::success(operation),
            Err(e) => LogEntry::failure(operation, e.to_string()),
        };
        self.log.push(entry);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SolveConfig {
        &self.config
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn source(&self) -> Option<&Rig> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&Rig> {
        self.target.as_ref()
    }

    /// Unbind and return the target rig.
    pub fn take_target(&mut self) -> Option<Rig> {
        self.target_gradients = None;
        self.reset_stages();
        self.target.take()
    }

    pub fn source_gradients(&self) -> Option<&Gradients> {
        self.source_gradients.as_ref()
    }

    pub fn target_gradients(&self) -> Option<&Gradients> {
        self.target_gradients.as_ref()
    }

    pub fn gradient_solver(&self) -> &GradientSolver {
        &self.gradient
    }

    pub fn vertex_solver(&self) -> &VertexSolver {
        &self.vertex
    }

    pub fn weights_solver(&self) -> &WeightsSolver {
        &self.weights
    }

    /// Operation log, oldest first.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }
}

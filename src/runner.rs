//! Orchestration of a simulation: validation, the adaptive step loop,
//! recording, progress reporting and termination.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, SolverOptions};
use crate::discretization::geometry::Polygon;
use crate::discretization::mesh::Mesh;
use crate::numerics::stepper::{FatalReason, RejectReason, StepOutcome, TimeStepper};
use crate::numerics::timing::{finalize_and_print, reset_timing};
use crate::physics::bc::{BoundaryConditions, BoundaryError};
use crate::physics::operators::DiscreteOperators;
use crate::physics::state::FieldState;
use crate::physics::tdgl::TdglModel;
use crate::physics::{NoField, TdglParameters, VectorPotential};
use crate::processing::observables::{polygon_fluxoid, Fluxoid, MeasurementPath};
use crate::processing::recorder::{closest_to_time, SolutionRecord, SolutionRecorder};
use crate::processing::storage::{SolutionHeader, SolutionWriter, StorageError, FORMAT_VERSION};

/// Samples of the current protocols checked for balance before a run.
const CURRENT_BALANCE_SAMPLES: usize = 64;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    TimeLimitReached,
    SteadyState,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AbortReason {
    #[error("{0}")]
    Fatal(FatalReason),
    #[error("{attempts} consecutive failed attempts, last: {last}")]
    RetriesExhausted { attempts: usize, last: RejectReason },
    #[error("step size {dt:.3e} fell below dt_min = {dt_min:.3e}")]
    StepTooSmall { dt: f64, dt_min: f64 },
    #[error("invalid initial state: {0}")]
    InitialState(ConfigError),
    #[error("boundary conditions: {0}")]
    Boundary(BoundaryError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// A run that stopped early. `solution` holds every record accepted before the abort.
#[derive(Debug, Error)]
#[error("run aborted at t = {time:.4e}: {reason}")]
pub struct RunAbortedError {
    pub reason: AbortReason,
    pub time: f64,
    /// Failure of the solution writer when the run stopped for another reason.
    pub writer_error: Option<StorageError>,
    pub solution: Box<Solution>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub linear_iterations: usize,
    pub min_dt: f64,
    pub max_dt: f64,
    pub final_time: f64,
    pub wall_time: Duration,
}

impl RunStats {
    fn accept(&mut self, dt: f64, iterations: usize, time: f64) {
        if self.accepted_steps == 0 {
            self.min_dt = dt;
            self.max_dt = dt;
        } else {
            self.min_dt = self.min_dt.min(dt);
            self.max_dt = self.max_dt.max(dt);
        }
        self.accepted_steps += 1;
        self.linear_iterations += iterations;
        self.final_time = time;
    }

    pub fn acceptance_rate(&self) -> f64 {
        let attempts = self.accepted_steps + self.rejected_steps;
        if attempts == 0 {
            1.0
        } else {
            self.accepted_steps as f64 / attempts as f64
        }
    }
}

/// Time series produced by a run.
#[derive(Clone, Debug)]
pub struct Solution {
    mesh: Arc<Mesh>,
    records: Vec<SolutionRecord>,
    stats: RunStats,
    termination: Option<Termination>,
}

impl Solution {
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn records(&self) -> &[SolutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SolutionRecord> {
        self.records.get(index)
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }

    pub fn closest_to_time(&self, time: f64) -> Option<&SolutionRecord> {
        closest_to_time(&self.records, time)
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// `None` when the run was aborted.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Fields of the last record, usable as the initial state of a follow-up run.
    pub fn final_state(&self) -> Option<FieldState> {
        self.records.last().map(|r| r.snapshot.to_state(r.time))
    }

    /// Fluxoid around `polygon` in the record closest to `time`.
    pub fn polygon_fluxoid(&self, time: f64, polygon: &Polygon) -> Option<Fluxoid> {
        self.closest_to_time(time)
            .map(|r| polygon_fluxoid(&self.mesh, &r.snapshot.to_state(r.time), polygon))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttemptResult {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub time: f64,
    /// Size of the attempted step.
    pub dt: f64,
    pub result: AttemptResult,
    pub accepted: usize,
    pub rejected: usize,
    pub acceptance_rate: f64,
    pub last_error: Option<f64>,
}

pub trait ProgressObserver {
    fn on_attempt(&mut self, report: &ProgressReport);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressReport),
{
    fn on_attempt(&mut self, report: &ProgressReport) {
        self(report)
    }
}

/// Logs a progress line every `interval` accepted steps.
pub struct LogObserver {
    interval: usize,
}

impl LogObserver {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
        }
    }
}

impl ProgressObserver for LogObserver {
    fn on_attempt(&mut self, report: &ProgressReport) {
        if report.result == AttemptResult::Accepted && report.accepted % self.interval == 0 {
            info!(
                "step {}: t = {:.4e}, dt = {:.3e}, err = {:.2e}, acceptance {:.1}%",
                report.accepted,
                report.time,
                report.dt,
                report.last_error.unwrap_or(0.0),
                100.0 * report.acceptance_rate
            );
        }
    }
}

/// Shared flag to stop a run at the next step boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sliding window of `|ψ|` used to detect a steady state.
struct SteadyStateMonitor {
    window: f64,
    tolerance: f64,
    history: VecDeque<(f64, DVector<f64>)>,
}

impl SteadyStateMonitor {
    fn new(window: f64, tolerance: f64) -> Self {
        Self {
            window,
            tolerance,
            history: VecDeque::new(),
        }
    }

    /// Push the latest state; true once `|ψ|` changed by at most the tolerance
    /// over a full window.
    fn push(&mut self, state: &FieldState) -> bool {
        let now = state.time;
        let magnitude = state.psi_magnitude();
        while self.history.len() > 1 && self.history[1].0 <= now - self.window {
            self.history.pop_front();
        }
        let steady = match self.history.front() {
            Some((then, before)) if *then <= now - self.window => {
                (&magnitude - before).amax() <= self.tolerance
            }
            _ => false,
        };
        self.history.push_back((now, magnitude));
        steady
    }
}

pub struct Runner {
    mesh: Arc<Mesh>,
    operators: Arc<DiscreteOperators>,
    params: TdglParameters,
    bcs: BoundaryConditions,
    options: SolverOptions,
    potential: Arc<dyn VectorPotential>,
    paths: Vec<MeasurementPath>,
    output: Option<PathBuf>,
    observers: Vec<Box<dyn ProgressObserver>>,
    cancel: CancelToken,
}

impl Runner {
    /// Validate the configuration against the mesh and build the operators.
    pub fn new(
        mesh: Arc<Mesh>,
        params: TdglParameters,
        bcs: BoundaryConditions,
        options: SolverOptions,
    ) -> Result<Self, SetupError> {
        options.validate()?;
        params.validate_on(&mesh)?;
        bcs.resolve(&mesh)?;

        let operators = Arc::new(DiscreteOperators::new(&mesh));
        let observers: Vec<Box<dyn ProgressObserver>> =
            vec![Box::new(LogObserver::new(options.progress_interval))];
        Ok(Self {
            mesh,
            operators,
            params,
            bcs,
            options,
            potential: Arc::new(NoField),
            paths: Vec::new(),
            output: None,
            observers,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_vector_potential(mut self, potential: Arc<dyn VectorPotential>) -> Self {
        self.potential = potential;
        self
    }

    pub fn with_paths(mut self, paths: Vec<MeasurementPath>) -> Self {
        self.paths = paths;
        self
    }

    /// Stream records to a JSON Lines file at `path`.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn header(&self) -> SolutionHeader {
        SolutionHeader {
            format_version: FORMAT_VERSION,
            mesh: self.mesh.to_data(),
            terminals: self.mesh.terminals.iter().map(|t| t.name.clone()).collect(),
            probes: self.mesh.probes.clone(),
            paths: self.paths.clone(),
            options: self.options.clone(),
            parameters: self.params.summary(),
        }
    }

    fn notify(&mut self, report: &ProgressReport) {
        for observer in &mut self.observers {
            observer.on_attempt(report);
        }
    }

    /// Integrate from `initial` for `solve_time`.
    pub fn run(&mut self, initial: FieldState) -> Result<Solution, RunAbortedError> {
        let start = Instant::now();
        reset_timing();

        let empty = |mesh: &Arc<Mesh>, time: f64, reason: AbortReason| RunAbortedError {
            reason,
            time,
            writer_error: None,
            solution: Box::new(Solution {
                mesh: mesh.clone(),
                records: Vec::new(),
                stats: RunStats::default(),
                termination: None,
            }),
        };

        if let Err(e) = initial.check_dimensions(&self.mesh) {
            return Err(empty(&self.mesh, initial.time, AbortReason::InitialState(e)));
        }
        if let Err(e) =
            self.bcs
                .check_currents(initial.time, self.options.solve_time, CURRENT_BALANCE_SAMPLES)
        {
            return Err(empty(&self.mesh, initial.time, AbortReason::Boundary(e)));
        }
        let model = match TdglModel::new(
            self.mesh.clone(),
            self.operators.clone(),
            self.params.clone(),
            self.bcs.clone(),
            self.potential.clone(),
            self.options.terminal_psi,
        ) {
            Ok(model) => model,
            Err(e) => return Err(empty(&self.mesh, initial.time, AbortReason::Boundary(e))),
        };

        let mut recorder =
            SolutionRecorder::new(self.mesh.clone(), self.options.save_cadence, self.paths.clone());
        if let Some(path) = &self.output {
            match SolutionWriter::create(path, &self.header()) {
                Ok(writer) => recorder = recorder.with_writer(writer),
                Err(e) => return Err(empty(&self.mesh, initial.time, e.into())),
            }
        }

        let stepper = TimeStepper::new(model, &self.options);
        let mut state = stepper.model().prepare(initial);
        let end_time = state.time + self.options.solve_time;
        let mut stats = RunStats {
            final_time: state.time,
            ..RunStats::default()
        };
        let mut steady = self
            .options
            .steady_state
            .map(|c| SteadyStateMonitor::new(c.window, c.tolerance));
        if let Some(monitor) = steady.as_mut() {
            monitor.push(&state);
        }

        info!(
            "starting run: {} vertices, t = {:.4e} to {:.4e}, dt_init = {:.3e}",
            self.mesh.num_vertices(),
            state.time,
            end_time,
            self.options.dt_init
        );

        let mut step = 0;
        let mut dt = self.options.dt_init;
        let mut failures = 0;
        let mut last_error = None;

        let outcome = (|| -> Result<Termination, AbortReason> {
            recorder.record(&state, step)?;
            loop {
                if self.cancel.is_cancelled() {
                    return Ok(Termination::Cancelled);
                }
                let remaining = end_time - state.time;
                if remaining <= 1e-12 * end_time.abs().max(1.0) {
                    return Ok(Termination::TimeLimitReached);
                }

                let dt_try = dt.min(remaining);
                let result = match stepper.attempt(&state, dt_try) {
                    StepOutcome::Accepted(success) => {
                        failures = 0;
                        step += 1;
                        stats.accept(success.dt_taken, success.linear_iterations, success.state.time);
                        last_error = Some(success.error_estimate);
                        // A step shortened to hit the end time keeps the previous size.
                        if dt_try >= dt {
                            dt = success.dt_next;
                        }
                        state = success.state;
                        recorder.offer(step, &state)?;
                        if steady.as_mut().is_some_and(|m| m.push(&state)) {
                            info!("steady state reached at t = {:.4e}", state.time);
                            return Ok(Termination::SteadyState);
                        }
                        AttemptResult::Accepted
                    }
                    StepOutcome::Rejected(reason) => {
                        stats.rejected_steps += 1;
                        if matches!(
                            reason,
                            RejectReason::LinearSolve(_) | RejectReason::Unstable { .. }
                        ) {
                            failures += 1;
                            if failures >= self.options.max_solve_retries {
                                return Err(AbortReason::RetriesExhausted {
                                    attempts: failures,
                                    last: reason,
                                });
                            }
                        }
                        dt = 0.5 * dt_try;
                        if dt < self.options.dt_min {
                            return Err(AbortReason::StepTooSmall {
                                dt,
                                dt_min: self.options.dt_min,
                            });
                        }
                        AttemptResult::Rejected
                    }
                    StepOutcome::Fatal(reason) => return Err(AbortReason::Fatal(reason)),
                };

                let report = ProgressReport {
                    time: state.time,
                    dt: dt_try,
                    result,
                    accepted: stats.accepted_steps,
                    rejected: stats.rejected_steps,
                    acceptance_rate: stats.acceptance_rate(),
                    last_error,
                };
                self.notify(&report);
            }
        })();

        // The last accepted state is always part of the series.
        let final_record = match &outcome {
            Err(AbortReason::Storage(_)) => Ok(false),
            _ => recorder.record(&state, step),
        };
        let (records, flushed) = recorder.finish();
        stats.final_time = state.time;
        stats.wall_time = start.elapsed();
        finalize_and_print(stats.wall_time);

        let (outcome, writer_error) = settle_storage(outcome, final_record, flushed);
        match outcome {
            Ok(termination) => {
                info!(
                    "run finished ({termination:?}) at t = {:.4e}: {} accepted, {} rejected steps, {} records",
                    state.time,
                    stats.accepted_steps,
                    stats.rejected_steps,
                    records.len()
                );
                Ok(Solution {
                    mesh: self.mesh.clone(),
                    records,
                    stats,
                    termination: Some(termination),
                })
            }
            Err(reason) => {
                error!("run aborted at t = {:.4e}: {reason}", state.time);
                if stats.accepted_steps == 0 {
                    warn!("no step was accepted");
                }
                if let Some(cause) = &writer_error {
                    error!("solution writer failed as well: {cause}");
                }
                Err(RunAbortedError {
                    reason,
                    time: state.time,
                    writer_error,
                    solution: Box::new(Solution {
                        mesh: self.mesh.clone(),
                        records,
                        stats,
                        termination: None,
                    }),
                })
            }
        }
    }
}

/// Merge the run outcome with the writer thread's result. A closed channel is
/// only the symptom of a failed writer, so the writer's own error replaces it.
fn settle_storage(
    outcome: Result<Termination, AbortReason>,
    final_record: Result<bool, StorageError>,
    flushed: Result<(), StorageError>,
) -> (Result<Termination, AbortReason>, Option<StorageError>) {
    match (outcome, flushed) {
        (Ok(termination), Ok(())) => (
            final_record.map(|_| termination).map_err(AbortReason::from),
            None,
        ),
        (Ok(_), Err(cause)) | (Err(AbortReason::Storage(_)), Err(cause)) => {
            (Err(AbortReason::Storage(cause)), None)
        }
        (Err(reason), Err(cause)) => (Err(reason), Some(cause)),
        (Err(reason), Ok(())) => (Err(reason), None),
    }
}

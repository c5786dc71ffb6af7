//! Append-only time series of field snapshots and their observables.

use std::sync::Arc;

use log::debug;
use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::observables::{MeasurementPath, Observables};
use super::storage::{SolutionWriter, StorageError};
use crate::config::SaveCadence;
use crate::discretization::mesh::Mesh;
use crate::numerics::timing::{timed, Phase};
use crate::physics::state::FieldState;

/// Serializable copy of the fields of a [`FieldState`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub psi: Vec<Complex64>,
    pub mu: Vec<f64>,
    pub a_edge: Vec<f64>,
    pub a_rate: Vec<f64>,
    pub terminal_currents: Vec<f64>,
}

impl FieldSnapshot {
    pub fn from_state(state: &FieldState) -> Self {
        Self {
            psi: state.psi.iter().copied().collect(),
            mu: state.mu.iter().copied().collect(),
            a_edge: state.a_edge.iter().copied().collect(),
            a_rate: state.a_rate.iter().copied().collect(),
            terminal_currents: state.terminal_currents.clone(),
        }
    }

    /// Field state at `time`. The `|ψ|²` rate is not stored and restarts at zero.
    pub fn to_state(&self, time: f64) -> FieldState {
        FieldState {
            time,
            psi: DVector::from_vec(self.psi.clone()),
            mu: DVector::from_vec(self.mu.clone()),
            a_edge: DVector::from_vec(self.a_edge.clone()),
            a_rate: DVector::from_vec(self.a_rate.clone()),
            terminal_currents: self.terminal_currents.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub index: usize,
    /// Accepted step count at which the record was taken.
    pub step: usize,
    pub time: f64,
    pub snapshot: FieldSnapshot,
    pub observables: Observables,
}

pub struct SolutionRecorder {
    mesh: Arc<Mesh>,
    cadence: SaveCadence,
    paths: Vec<MeasurementPath>,
    records: Vec<SolutionRecord>,
    writer: Option<SolutionWriter>,
}

impl SolutionRecorder {
    pub fn new(mesh: Arc<Mesh>, cadence: SaveCadence, paths: Vec<MeasurementPath>) -> Self {
        Self {
            mesh,
            cadence,
            paths,
            records: Vec::new(),
            writer: None,
        }
    }

    /// Stream every record to `writer` as it is taken.
    pub fn with_writer(mut self, writer: SolutionWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn paths(&self) -> &[MeasurementPath] {
        &self.paths
    }

    fn last_time(&self) -> Option<f64> {
        self.records.last().map(|r| r.time)
    }

    fn is_due(&self, step: usize, time: f64) -> bool {
        match (self.cadence, self.last_time()) {
            (_, None) => true,
            (SaveCadence::EverySteps(n), Some(_)) => step % n == 0,
            // Relative slack absorbs the round-off of accumulated step sizes.
            (SaveCadence::EveryTime(interval), Some(last)) => {
                time - last >= interval * (1.0 - 1e-9)
            }
        }
    }

    /// Record `state` if the cadence says so. Returns whether a record was taken.
    pub fn offer(&mut self, step: usize, state: &FieldState) -> Result<bool, StorageError> {
        if self.is_due(step, state.time) {
            self.record(state, step)
        } else {
            Ok(false)
        }
    }

    /// Record `state` unconditionally unless its time does not advance past the last record.
    pub fn record(&mut self, state: &FieldState, step: usize) -> Result<bool, StorageError> {
        if self.last_time().is_some_and(|last| state.time <= last) {
            return Ok(false);
        }
        let record = SolutionRecord {
            index: self.records.len(),
            step,
            time: state.time,
            snapshot: FieldSnapshot::from_state(state),
            observables: timed(Phase::Observables, || {
                Observables::compute(&self.mesh, state, &self.paths)
            }),
        };
        debug!("record {} at t = {:.4e} (step {step})", record.index, record.time);
        if let Some(writer) = &self.writer {
            writer.send(record.clone())?;
        }
        self.records.push(record);
        Ok(true)
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

    pub fn records(&self) -> &[SolutionRecord] {
        &self.records
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }

    pub fn closest_to_time(&self, time: f64) -> Option<&SolutionRecord> {
        closest_to_time(&self.records, time)
    }

    /// Close the attached writer, if any, and hand back the records.
    pub fn finish(mut self) -> (Vec<SolutionRecord>, Result<(), StorageError>) {
        let flushed = match self.writer.take() {
            Some(writer) => writer.finish().map(|_| ()),
            None => Ok(()),
        };
        (self.records, flushed)
    }
}

/// Record whose time is nearest to `time`; ties go to the earlier record.
pub fn closest_to_time(records: &[SolutionRecord], time: f64) -> Option<&SolutionRecord> {
    records
        .iter()
        .min_by(|a, b| (a.time - time).abs().total_cmp(&(b.time - time).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::geometry::{Domain, Polygon};
    use crate::discretization::{generate_mesh, MeshOptions};

    fn mesh() -> Arc<Mesh> {
        let domain = Domain::new(Polygon::rectangle("film", 2.0, 2.0, [0.0, 0.0]), 0.5);
        Arc::new(generate_mesh(&domain, &MeshOptions::default()).unwrap())
    }

    fn at(mesh: &Mesh, time: f64) -> FieldState {
        FieldState {
            time,
            ..FieldState::uniform(mesh, Complex64::new(1.0, 0.0))
        }
    }

    #[test]
    fn time_cadence_and_monotonic_times() {
        let mesh = mesh();
        let mut recorder = SolutionRecorder::new(mesh.clone(), SaveCadence::EveryTime(0.5), vec![]);
        assert!(recorder.offer(0, &at(&mesh, 0.0)).unwrap());
        assert!(!recorder.offer(1, &at(&mesh, 0.3)).unwrap());
        assert!(recorder.offer(2, &at(&mesh, 0.6)).unwrap());
        assert!(!recorder.offer(3, &at(&mesh, 0.9)).unwrap());
        // Forced records still refuse to go back in time.
        assert!(!recorder.record(&at(&mesh, 0.6), 3).unwrap());
        assert!(recorder.record(&at(&mesh, 0.95), 4).unwrap());

        assert_eq!(recorder.times(), vec![0.0, 0.6, 0.95]);
        assert_eq!(recorder.get(1).map(|r| r.step), Some(2));
        assert_eq!(recorder.closest_to_time(0.8).map(|r| r.index), Some(2));
        assert_eq!(recorder.closest_to_time(-1.0).map(|r| r.index), Some(0));
    }

    #[test]
    fn step_cadence() {
        let mesh = mesh();
        let mut recorder = SolutionRecorder::new(mesh.clone(), SaveCadence::EverySteps(3), vec![]);
        for step in 0..10 {
            recorder.offer(step, &at(&mesh, step as f64 * 0.1)).unwrap();
        }
        let steps: Vec<usize> = recorder.records().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![0, 3, 6, 9]);
    }

    /// Accepts the header, then fails every write.
    struct FullDisk {
        header_done: bool,
    }

    impl std::io::Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.header_done {
                Err(std::io::Error::other("no space left on device"))
            } else {
                Ok(buf.len())
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.header_done = true;
            Ok(())
        }
    }

    #[test]
    fn writer_failure_is_reported_with_its_cause() {
        use super::super::storage::{SolutionHeader, CHANNEL_CAPACITY, FORMAT_VERSION};
        use crate::config::SolverOptions;
        use crate::physics::TdglParameters;

        let mesh = mesh();
        let header = SolutionHeader {
            format_version: FORMAT_VERSION,
            mesh: mesh.to_data(),
            terminals: vec![],
            probes: vec![],
            paths: vec![],
            options: SolverOptions::default(),
            parameters: TdglParameters::default().summary(),
        };
        let writer =
            SolutionWriter::from_sink("full.jsonl", FullDisk { header_done: false }, &header).unwrap();
        let mut recorder = SolutionRecorder::new(mesh.clone(), SaveCadence::EverySteps(1), vec![])
            .with_writer(writer);

        let closed = (0..CHANNEL_CAPACITY + 4)
            .map(|step| recorder.record(&at(&mesh, step as f64), step))
            .find_map(Result::err);
        assert!(matches!(closed, Some(StorageError::WriterClosed(_))));

        let (records, flushed) = recorder.finish();
        assert!(!records.is_empty());
        match flushed {
            Err(StorageError::Io { source, .. }) => {
                assert_eq!(source.to_string(), "no space left on device")
            }
            other => panic!("expected the writer's I/O error, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_restores_fields() {
        let mesh = mesh();
        let mut state = at(&mesh, 1.5);
        state.mu[0] = 0.25;
        let restored = FieldSnapshot::from_state(&state).to_state(1.5);
        assert_eq!(restored.psi, state.psi);
        assert_eq!(restored.mu, state.mu);
        assert_eq!(restored.time, 1.5);
    }
}

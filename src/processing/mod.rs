pub mod csv_writer;
pub mod observables;
pub mod recorder;
pub mod storage;
pub mod summary;

pub use observables::{Fluxoid, MeasurementPath, Observables};
pub use recorder::{FieldSnapshot, SolutionRecord, SolutionRecorder};
pub use storage::{SolutionFile, SolutionHeader, SolutionWriter, StorageError};

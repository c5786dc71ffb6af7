//! JSON Lines solution files.
//!
//! Line 1 holds a [`SolutionHeader`]; every following line holds one
//! [`SolutionRecord`]. Records are written by a background thread and flushed
//! one by one, so a file can be read while the run that produces it is still
//! going.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::{self, JoinHandle};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::observables::MeasurementPath;
use super::recorder::{closest_to_time, SolutionRecord};
use crate::config::SolverOptions;
use crate::discretization::mesh::MeshData;
use crate::physics::ParameterSummary;

pub const FORMAT_VERSION: u32 = 1;

/// Records buffered between the step loop and the writer thread.
pub(crate) const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line} of {path} is not valid: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode a line of {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} has no header line")]
    MissingHeader(PathBuf),
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("the writer thread for {0} stopped early")]
    WriterClosed(PathBuf),
    #[error("the writer thread for {0} panicked")]
    WriterPanicked(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolutionHeader {
    pub format_version: u32,
    pub mesh: MeshData,
    pub terminals: Vec<String>,
    pub probes: Vec<(usize, usize)>,
    pub paths: Vec<MeasurementPath>,
    pub options: SolverOptions,
    pub parameters: ParameterSummary,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_line<T: Serialize>(out: &mut impl Write, value: &T, path: &Path) -> Result<(), StorageError> {
    serde_json::to_writer(&mut *out, value).map_err(|source| StorageError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    out.write_all(b"\n").map_err(io_error(path))?;
    out.flush().map_err(io_error(path))
}

/// Streams records to disk from a dedicated thread.
pub struct SolutionWriter {
    path: PathBuf,
    sender: Option<SyncSender<SolutionRecord>>,
    handle: Option<JoinHandle<Result<usize, StorageError>>>,
}

impl SolutionWriter {
    /// Create `path`, write the header synchronously and start the writer thread.
    pub fn create(path: impl AsRef<Path>, header: &SolutionHeader) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(io_error(&path))?;
        Self::from_sink(path, BufWriter::new(file), header)
    }

    /// Like [`SolutionWriter::create`] for an already open sink; `path` only labels errors.
    pub fn from_sink<W>(path: impl Into<PathBuf>, mut out: W, header: &SolutionHeader) -> Result<Self, StorageError>
    where
        W: Write + Send + 'static,
    {
        let path = path.into();
        write_line(&mut out, header, &path)?;

        let (sender, receiver) = sync_channel::<SolutionRecord>(CHANNEL_CAPACITY);
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("solution-writer".into())
            .spawn(move || -> Result<usize, StorageError> {
                let mut written = 0;
                for record in receiver {
                    write_line(&mut out, &record, &thread_path)?;
                    written += 1;
                }
                debug!("{written} records written to {}", thread_path.display());
                Ok(written)
            })
            .map_err(io_error(&path))?;

        info!("writing solution to {}", path.display());
        Ok(Self {
            path,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record. Blocks while the channel is full. Once the writer thread
    /// has failed this returns [`StorageError::WriterClosed`]; the thread's own
    /// error comes from [`SolutionWriter::finish`].
    pub fn send(&self, record: SolutionRecord) -> Result<(), StorageError> {
        match &self.sender {
            Some(sender) => sender
                .send(record)
                .map_err(|_| StorageError::WriterClosed(self.path.clone())),
            None => Err(StorageError::WriterClosed(self.path.clone())),
        }
    }

    /// Close the channel and wait for every queued record to reach the disk.
    /// Returns the number of records written.
    pub fn finish(mut self) -> Result<usize, StorageError> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| StorageError::WriterPanicked(self.path.clone()))?,
            None => Ok(0),
        }
    }
}

impl Drop for SolutionWriter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Read-only view of a solution file.
#[derive(Debug)]
pub struct SolutionFile {
    header: SolutionHeader,
    records: Vec<SolutionRecord>,
}

impl SolutionFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).map_err(io_error(path))?);
        let mut lines = reader.lines().enumerate();

        let header_line = match lines.next() {
            Some((_, line)) => line.map_err(io_error(path))?,
            None => return Err(StorageError::MissingHeader(path.to_path_buf())),
        };
        let header: SolutionHeader =
            serde_json::from_str(&header_line).map_err(|source| StorageError::Malformed {
                path: path.to_path_buf(),
                line: 1,
                source,
            })?;
        if header.format_version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let mut records = Vec::new();
        for (i, line) in lines {
            let line = line.map_err(io_error(path))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| StorageError::Malformed {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(Self { header, records })
    }

    pub fn header(&self) -> &SolutionHeader {
        &self.header
    }

    pub fn mesh_data(&self) -> &MeshData {
        &self.header.mesh
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }

    pub fn record(&self, index: usize) -> Option<&SolutionRecord> {
        self.records.get(index)
    }

    pub fn record_at_time(&self, time: f64) -> Option<&SolutionRecord> {
        closest_to_time(&self.records, time)
    }

    pub fn records(&self) -> &[SolutionRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_and_foreign_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.jsonl");
        File::create(&empty).unwrap();
        assert!(matches!(
            SolutionFile::open(&empty),
            Err(StorageError::MissingHeader(_))
        ));

        let garbage = dir.path().join("garbage.jsonl");
        writeln!(File::create(&garbage).unwrap(), "not json").unwrap();
        assert!(matches!(
            SolutionFile::open(&garbage),
            Err(StorageError::Malformed { line: 1, .. })
        ));

        assert!(matches!(
            SolutionFile::open(dir.path().join("absent.jsonl")),
            Err(StorageError::Io { .. })
        ));
    }
}

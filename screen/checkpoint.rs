//! Append-only JSON-lines checkpoint for batch results.
//!
//! The first line is a header naming the run that produced the records; every
//! later line is one record. The writer is owned by the single aggregator of a
//! batch, never by a worker, so lines are never interleaved. A final line without
//! its newline was torn by an interrupted write: it is skipped on load and cut
//! off before the next append.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Checkpoint '{path}' line {line} is not a valid record: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize checkpoint record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct HeaderOut<'a, H> {
    header: &'a H,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderIn<H> {
    header: H,
}

/// Everything recovered from a checkpoint file.
#[derive(Debug)]
pub struct Checkpoint<H, T> {
    /// `None` for a file written without a header.
    pub header: Option<H>,
    pub records: Vec<T>,
}

pub struct CheckpointWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl CheckpointWriter {
    /// Starts a new checkpoint at `path`, replacing any existing file.
    pub fn create<H: Serialize>(
        path: &Path,
        header: &H,
        flush_every: usize,
    ) -> Result<Self, CheckpointError> {
        let file = File::create(path).map_err(|source| io_error(path, source))?;
        let mut writer = Self::wrap(path, file, flush_every);
        let line = serde_json::to_string(&HeaderOut { header })?;
        writeln!(writer.writer, "{line}").map_err(|source| writer.io_error(source))?;
        writer.flush()?;
        Ok(writer)
    }

    /// Opens `path` for appending, creating it if needed. A torn final line is
    /// truncated away first so the next record starts on a fresh line.
    pub fn open(path: &Path, flush_every: usize) -> Result<Self, CheckpointError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| io_error(path, source))?;
        repair_tail(path, &file)?;
        Ok(Self::wrap(path, file, flush_every))
    }

    fn wrap(path: &Path, file: File, flush_every: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            unflushed: 0,
        }
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), CheckpointError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}").map_err(|source| self.io_error(source))?;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.writer.flush().map_err(|source| self.io_error(source))?;
        log::debug!(
            "Flushed {} checkpoint records to {}",
            self.unflushed,
            self.path.display()
        );
        self.unflushed = 0;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        io_error(&self.path, source)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Length of the prefix of `bytes` that ends on a newline.
fn complete_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |last| last + 1)
}

fn repair_tail(path: &Path, file: &File) -> Result<(), CheckpointError> {
    let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
    let keep = complete_len(&bytes);
    if keep < bytes.len() {
        log::warn!(
            "Truncating {} torn bytes at the end of checkpoint {}",
            bytes.len() - keep,
            path.display()
        );
        file.set_len(keep as u64)
            .map_err(|source| io_error(path, source))?;
    }
    Ok(())
}

/// Reads the header and every complete record of a checkpoint.
/// A missing file yields `None`.
pub fn load_checkpoint<H, T>(path: &Path) -> Result<Option<Checkpoint<H, T>>, CheckpointError>
where
    H: DeserializeOwned,
    T: DeserializeOwned,
{
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
    let keep = complete_len(&bytes);
    if keep < bytes.len() {
        log::warn!(
            "Ignoring torn final record in checkpoint {}",
            path.display()
        );
    }
    let text = String::from_utf8_lossy(&bytes[..keep]);

    let mut header = None;
    let mut records = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if header.is_none() && records.is_empty() {
            if let Ok(HeaderIn { header: h }) = serde_json::from_str::<HeaderIn<H>>(line) {
                header = Some(h);
                continue;
            }
        }
        let record = serde_json::from_str(line).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            line: number + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(Some(Checkpoint { header, records }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        value: Option<f64>,
    }

    fn records(path: &Path) -> Vec<Record> {
        load_checkpoint::<String, Record>(path)
            .unwrap()
            .unwrap()
            .records
    }

    #[test]
    fn appended_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");
        {
            let header = "run-a".to_string();
            let mut writer = CheckpointWriter::create(&path, &header, 2).unwrap();
            writer.append(&Record { id: 1, value: Some(0.5) }).unwrap();
            writer.append(&Record { id: 2, value: None }).unwrap();
            writer.flush().unwrap();
        }
        {
            let mut writer = CheckpointWriter::open(&path, 2).unwrap();
            writer.append(&Record { id: 3, value: Some(-1.0) }).unwrap();
            writer.flush().unwrap();
        }
        let loaded = load_checkpoint::<String, Record>(&path).unwrap().unwrap();
        assert_eq!(loaded.header.as_deref(), Some("run-a"));
        assert_eq!(loaded.records.len(), 3);
        assert_eq!(loaded.records[1], Record { id: 2, value: None });
    }

    #[test]
    fn torn_tail_is_skipped_but_corrupt_middle_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");
        std::fs::write(&path, "{\"id\":1,\"value\":1.0}\n{\"id\":2,\"va").unwrap();
        assert_eq!(records(&path), vec![Record { id: 1, value: Some(1.0) }]);

        std::fs::write(&path, "garbage\n{\"id\":2,\"value\":null}\n").unwrap();
        let err = load_checkpoint::<String, Record>(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn resume_after_torn_write_survives_a_second_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");
        std::fs::write(&path, "{\"id\":1,\"value\":1.0}\n{\"id\":2").unwrap();

        // First resume: the torn record is redone.
        assert_eq!(records(&path).len(), 1);
        {
            let mut writer = CheckpointWriter::open(&path, 1).unwrap();
            writer.append(&Record { id: 2, value: None }).unwrap();
            writer.append(&Record { id: 3, value: Some(3.0) }).unwrap();
        }

        // Second resume reads a clean file.
        let ids: Vec<u64> = records(&path).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn create_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");
        std::fs::write(&path, "{\"id\":9,\"value\":null}\n").unwrap();
        CheckpointWriter::create(&path, &"run-b".to_string(), 1).unwrap();
        let loaded = load_checkpoint::<String, Record>(&path).unwrap().unwrap();
        assert_eq!(loaded.header.as_deref(), Some("run-b"));
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        let loaded = load_checkpoint::<String, Record>(&dir.path().join("absent.jsonl")).unwrap();
        assert!(loaded.is_none());
    }
}

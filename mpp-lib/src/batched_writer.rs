use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::SimulationError;

/// Writes csv records to a file in batches, so that a busy payment run doesn't hit the disk for every attempt.
pub struct BatchedWriter {
    path: PathBuf,
    batch_size: u32,
    /// Records queued since the last flush.
    pending: u32,
    /// Records flushed to disk so far.
    written: u64,
    writer: Writer<File>,
}

impl BatchedWriter {
    /// Creates the file `file_name` in the directory provided, failing for a zero batch size.
    pub fn new(
        directory: PathBuf,
        file_name: String,
        batch_size: u32,
    ) -> Result<BatchedWriter, SimulationError> {
        Self::from_path(&directory.join(file_name), batch_size)
    }

    pub fn from_path(path: &Path, batch_size: u32) -> Result<BatchedWriter, SimulationError> {
        if batch_size == 0 {
            return Err(SimulationError::FileError);
        }

        let writer = WriterBuilder::new()
            .from_path(path)
            .map_err(SimulationError::CsvError)?;

        log::debug!("Writing records to {} in batches of {batch_size}.", path.display());

        Ok(BatchedWriter {
            path: path.to_path_buf(),
            batch_size,
            pending: 0,
            written: 0,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records that have been flushed to disk.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Queues a record, flushing the batch once it is full. A record that can't be serialized is dropped, and
    /// whatever was queued before it is flushed.
    pub fn queue<S: Serialize>(&mut self, record: S) -> Result<(), SimulationError> {
        if let Err(e) = self.writer.serialize(record) {
            if let Err(flush_err) = self.write(true) {
                log::error!("Error flushing {}: {flush_err}", self.path.display());
            }

            return Err(SimulationError::CsvError(e));
        }

        self.pending += 1;
        self.write(false)
    }

    /// Flushes queued records to disk if the batch is full, or unconditionally if force is set.
    pub fn write(&mut self, force: bool) -> Result<(), SimulationError> {
        if !force && self.pending < self.batch_size {
            return Ok(());
        }

        self.writer
            .flush()
            .map_err(|e| SimulationError::CsvError(e.into()))?;

        self.written += u64::from(self.pending);
        self.pending = 0;

        Ok(())
    }
}

//! Record sort buffer.

use std::io;
use std::io::prelude::*;

use rayon::prelude::*;

use crate::record::{RecordReader, RecordWriter};

/// In-memory buffer holding up to `capacity` records.
///
/// One buffer is allocated per producer call and reused across its chunk
/// iterations, so a worker never holds more than `capacity` records at once.
pub struct RecordBuffer {
    capacity: usize,
    records: Vec<i64>,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        RecordBuffer {
            capacity,
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks if the buffer reached its capacity.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Clears the buffer and refills it with up to `capacity` records.
    /// Returns the number of records read.
    pub fn fill<R: Read>(&mut self, reader: &mut RecordReader<R>) -> io::Result<usize> {
        self.records.clear();
        while !self.is_full() {
            match reader.read_record()? {
                Some(value) => self.records.push(value),
                None => break,
            }
        }
        Ok(self.records.len())
    }

    /// Sorts the buffered records ascending, in place.
    pub fn sort(&mut self) {
        self.records.par_sort_unstable();
    }

    /// Writes the buffered records out in order.
    pub fn write_to<W: Write>(&self, writer: &mut RecordWriter<W>) -> io::Result<()> {
        for &value in &self.records {
            writer.write_record(value)?;
        }
        Ok(())
    }
}

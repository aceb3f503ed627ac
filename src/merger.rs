//! K-way file merger.

use log;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::record::{RecordReader, RecordWriter, RECORD_SIZE};
use crate::sort::SortError;

/// Merges sorted record files into a single sorted file at `output`.
///
/// Inputs must be sorted ascending, otherwise the result is undefined. The
/// merge is a streaming min-heap walk holding one record per input stream, so
/// memory stays flat regardless of file sizes. Time complexity is
/// *m* \* log(*n*) in the worst case where *m* is the number of records and
/// *n* the number of inputs.
///
/// Returns the number of records written. With no inputs the output is an
/// empty file; with a single input the bytes are copied verbatim.
pub fn merge_files(inputs: &[PathBuf], output: &Path, io_buf_size: usize) -> Result<u64, SortError> {
    if inputs.is_empty() {
        fs::File::create(output).map_err(|err| SortError::io(output, err))?;
        return Ok(0);
    }

    if inputs.len() == 1 {
        let copied = fs::copy(&inputs[0], output).map_err(|err| SortError::io(output, err))?;
        return Ok(copied / RECORD_SIZE as u64);
    }

    log::debug!("merging {} files into {}", inputs.len(), output.display());

    // readers already opened are closed on drop if a later open fails
    let mut readers = Vec::with_capacity(inputs.len());
    for path in inputs {
        let reader = RecordReader::open(path, io_buf_size).map_err(|err| SortError::io(path, err))?;
        readers.push(reader);
    }

    let mut writer = RecordWriter::create(output, io_buf_size).map_err(|err| SortError::io(output, err))?;

    // binary heap is a max-heap by default so values are reversed into a min-heap
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (stream, reader) in readers.iter_mut().enumerate() {
        let first = reader.read_record().map_err(|err| SortError::io(&inputs[stream], err))?;
        if let Some(value) = first {
            heap.push((Reverse(value), stream));
        }
    }

    let mut written = 0u64;
    while let Some((Reverse(value), stream)) = heap.pop() {
        writer.write_record(value).map_err(|err| SortError::io(output, err))?;
        written += 1;

        let next = readers[stream].read_record().map_err(|err| SortError::io(&inputs[stream], err))?;
        if let Some(value) = next {
            heap.push((Reverse(value), stream));
        }
    }

    writer.flush().map_err(|err| SortError::io(output, err))?;

    Ok(written)
}

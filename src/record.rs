//! Record codec.
//!
//! On disk a record is a signed 64-bit integer encoded as 8 little-endian
//! bytes. A file is a flat concatenation of records with no header, footer or
//! separators, so its length must be a multiple of [`RECORD_SIZE`].

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// On-disk record width in bytes.
pub const RECORD_SIZE: usize = 8;

/// Default per-stream read/write buffer size.
pub const DEFAULT_IO_BUF_SIZE: usize = 64 * 1024;

/// Buffered reader decoding a stream of little-endian records.
pub struct RecordReader<R: Read> {
    inner: io::BufReader<R>,
}

impl RecordReader<fs::File> {
    /// Opens a file for buffered record reading.
    pub fn open(path: &Path, buf_size: usize) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        Ok(RecordReader::new(file, buf_size))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, buf_size: usize) -> Self {
        RecordReader {
            inner: io::BufReader::with_capacity(buf_size, inner),
        }
    }

    /// Reads the next record, or [`None`] at end of stream.
    ///
    /// Callers validate the stream length up front, so a short trailing read
    /// can only be a clean end of stream and is reported as [`None`].
    pub fn read_record(&mut self) -> io::Result<Option<i64>> {
        let mut buf = [0u8; RECORD_SIZE];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => Ok(Some(LittleEndian::read_i64(&buf))),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Buffered writer encoding records as little-endian bytes.
pub struct RecordWriter<W: Write> {
    inner: io::BufWriter<W>,
}

impl RecordWriter<fs::File> {
    /// Creates (or truncates) a file for buffered record writing.
    pub fn create(path: &Path, buf_size: usize) -> io::Result<Self> {
        let file = fs::File::create(path)?;
        Ok(RecordWriter::new(file, buf_size))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, buf_size: usize) -> Self {
        RecordWriter {
            inner: io::BufWriter::with_capacity(buf_size, inner),
        }
    }

    /// Appends one record to the stream.
    pub fn write_record(&mut self, value: i64) -> io::Result<()> {
        self.inner.write_i64::<LittleEndian>(value)
    }

    /// Flushes buffered records to the underlying stream.
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Flushes and unwraps the inner writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|err| err.into_error())
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::{RecordReader, RecordWriter, DEFAULT_IO_BUF_SIZE};

    #[test]
    fn test_write_read_roundtrip() {
        let values = [i64::MIN, -1, 0, 42, i64::MAX];

        let mut writer = RecordWriter::new(Vec::new(), DEFAULT_IO_BUF_SIZE);
        for &value in &values {
            writer.write_record(value).unwrap();
        }

        let encoded = writer.into_inner().unwrap();
        assert_eq!(encoded.len(), values.len() * 8);

        let mut reader = RecordReader::new(io::Cursor::new(encoded), DEFAULT_IO_BUF_SIZE);
        let mut decoded = Vec::new();
        while let Some(value) = reader.read_record().unwrap() {
            decoded.push(value);
        }
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = RecordWriter::new(Vec::new(), DEFAULT_IO_BUF_SIZE);
        writer.write_record(1).unwrap();

        let encoded = writer.into_inner().unwrap();
        assert_eq!(encoded, vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_stream_is_end_of_records() {
        let mut reader = RecordReader::new(io::Cursor::new(Vec::new()), DEFAULT_IO_BUF_SIZE);
        assert_eq!(reader.read_record().unwrap(), None);
        assert_eq!(reader.read_record().unwrap(), None);
    }
}

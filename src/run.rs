//! Run producer.

use log;
use std::fs;
use std::path::{Path, PathBuf};

use crate::buffer::RecordBuffer;
use crate::merger;
use crate::record::{RecordReader, RecordWriter, RECORD_SIZE};
use crate::sort::SortError;

/// A sorted file handed to the merge scheduler. Immutable until deletion.
#[derive(Debug, Clone)]
pub struct Run {
    /// Path of the sorted file.
    pub path: PathBuf,
    /// Number of records in the file.
    pub records: u64,
}

/// Transforms one input file into a single sorted run at `<input>.sorted`.
///
/// The input is streamed through a buffer of at most `capacity` records; each
/// fill is sorted and spilled to `<input>.sorted.chunk<k>`, and the chunks are
/// merged into the run before returning. An empty input yields an empty run.
///
/// With `cleanup_on_failure` set, chunk files written before an error are
/// removed; otherwise they are left in place for diagnosis.
pub fn produce_run(
    input: &Path,
    capacity: usize,
    io_buf_size: usize,
    cleanup_on_failure: bool,
) -> Result<Run, SortError> {
    let mut chunks = Vec::new();
    let result = write_run(input, capacity, io_buf_size, &mut chunks);

    if result.is_err() && cleanup_on_failure {
        for chunk in &chunks {
            if let Err(err) = fs::remove_file(chunk) {
                log::warn!("chunk file {} not removed: {}", chunk.display(), err);
            }
        }
    }

    result
}

fn write_run(
    input: &Path,
    capacity: usize,
    io_buf_size: usize,
    chunks: &mut Vec<PathBuf>,
) -> Result<Run, SortError> {
    debug_assert!(capacity > 0);

    let len = fs::metadata(input).map_err(|err| SortError::io(input, err))?.len();
    if len % RECORD_SIZE as u64 != 0 {
        return Err(SortError::CorruptInput {
            path: input.to_path_buf(),
            len,
        });
    }

    let run_path = run_path(input);
    let mut reader = RecordReader::open(input, io_buf_size).map_err(|err| SortError::io(input, err))?;

    // small inputs do not need the full per-worker buffer allocation
    let capacity = capacity.min((len / RECORD_SIZE as u64).max(1) as usize);
    let mut buffer = RecordBuffer::new(capacity);
    let mut records = 0u64;

    loop {
        let filled = buffer.fill(&mut reader).map_err(|err| SortError::io(input, err))?;
        if filled == 0 {
            break;
        }
        records += filled as u64;

        buffer.sort();

        let chunk_path = chunk_path(&run_path, chunks.len());
        log::debug!("spilling {} sorted records to {}", filled, chunk_path.display());
        let mut writer =
            RecordWriter::create(&chunk_path, io_buf_size).map_err(|err| SortError::io(&chunk_path, err))?;
        chunks.push(chunk_path.clone());
        buffer.write_to(&mut writer).map_err(|err| SortError::io(&chunk_path, err))?;
        writer.flush().map_err(|err| SortError::io(&chunk_path, err))?;
    }

    match chunks.len() {
        // empty input, the run is an empty file
        0 => {
            fs::File::create(&run_path).map_err(|err| SortError::io(&run_path, err))?;
        }
        1 => {
            fs::rename(&chunks[0], &run_path).map_err(|err| SortError::io(&run_path, err))?;
        }
        _ => {
            merger::merge_files(chunks, &run_path, io_buf_size)?;
            for chunk in chunks.iter() {
                fs::remove_file(chunk).map_err(|err| SortError::io(chunk, err))?;
            }
        }
    }

    Ok(Run {
        path: run_path,
        records,
    })
}

fn run_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".sorted");
    PathBuf::from(name)
}

fn chunk_path(run_path: &Path, index: usize) -> PathBuf {
    let mut name = run_path.as_os_str().to_os_string();
    name.push(format!(".chunk{}", index));
    PathBuf::from(name)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rstest::*;

    use crate::record::{RecordWriter, DEFAULT_IO_BUF_SIZE};
    use crate::sort::SortError;

    use super::{chunk_path, produce_run, run_path};

    fn write_input(dir: &tempfile::TempDir, name: &str, values: &[i64]) -> PathBuf {
        let path = dir.path().join(name);
        let mut writer = RecordWriter::create(&path, DEFAULT_IO_BUF_SIZE).unwrap();
        for &value in values {
            writer.write_record(value).unwrap();
        }
        writer.flush().unwrap();
        path
    }

    fn read_run(path: &Path) -> Vec<i64> {
        let bytes = fs::read(path).unwrap();
        bytes
            .chunks_exact(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    fn leftover_chunks(dir: &tempfile::TempDir) -> Vec<PathBuf> {
        fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.to_string_lossy().contains(".chunk"))
            .collect()
    }

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_temp_path_naming() {
        let run = run_path(Path::new("/data/input.dat"));
        assert_eq!(run, PathBuf::from("/data/input.dat.sorted"));
        assert_eq!(chunk_path(&run, 3), PathBuf::from("/data/input.dat.sorted.chunk3"));
    }

    #[rstest]
    fn test_single_chunk_run(tmp_dir: tempfile::TempDir) {
        let input = write_input(&tmp_dir, "input.dat", &[3, 1, 2]);

        let run = produce_run(&input, 16, DEFAULT_IO_BUF_SIZE, false).unwrap();

        assert_eq!(run.records, 3);
        assert_eq!(run.path, run_path(&input));
        assert_eq!(read_run(&run.path), vec![1, 2, 3]);
        assert!(leftover_chunks(&tmp_dir).is_empty());
    }

    #[rstest]
    fn test_multi_chunk_run(tmp_dir: tempfile::TempDir) {
        let values: Vec<i64> = (0..100).rev().collect();
        let input = write_input(&tmp_dir, "input.dat", &values);

        // 7-record buffer forces 15 chunks and an internal merge
        let run = produce_run(&input, 7, DEFAULT_IO_BUF_SIZE, false).unwrap();

        assert_eq!(run.records, 100);
        assert_eq!(read_run(&run.path), (0..100).collect::<Vec<i64>>());
        assert!(leftover_chunks(&tmp_dir).is_empty());
    }

    #[rstest]
    fn test_empty_input_yields_empty_run(tmp_dir: tempfile::TempDir) {
        let input = write_input(&tmp_dir, "empty.dat", &[]);

        let run = produce_run(&input, 16, DEFAULT_IO_BUF_SIZE, false).unwrap();

        assert_eq!(run.records, 0);
        assert_eq!(fs::metadata(&run.path).unwrap().len(), 0);
    }

    #[rstest]
    fn test_truncated_input_is_corrupt(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("corrupt.dat");
        fs::write(&input, [0u8; 11]).unwrap();

        let err = produce_run(&input, 16, DEFAULT_IO_BUF_SIZE, false).unwrap_err();

        match err {
            SortError::CorruptInput { path, len } => {
                assert_eq!(path, input);
                assert_eq!(len, 11);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!run_path(&input).exists());
    }

    #[rstest]
    fn test_missing_input_fails(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("missing.dat");

        let result = produce_run(&input, 16, DEFAULT_IO_BUF_SIZE, false);

        assert!(matches!(result, Err(SortError::Io { .. })));
    }
}

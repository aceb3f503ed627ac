//! External sorter engine and merge scheduler.

use log;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::merger;
use crate::pool::{PoolError, WorkerPool};
use crate::record::{DEFAULT_IO_BUF_SIZE, RECORD_SIZE};
use crate::run::{self, Run};

/// Default memory budget for sort buffers (64 MiB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 64 * 1024 * 1024;

/// Default merge fan-in: the maximum number of runs one merger combines.
pub const DEFAULT_FAN_IN: usize = 128;

/// Worker count used when hardware parallelism cannot be determined.
const FALLBACK_WORKERS: usize = 32;

/// File descriptors reserved for everything that is not a merger stream.
const RESERVED_FDS: usize = 32;

/// Open-file limit assumed when the platform does not report one.
const FALLBACK_FD_LIMIT: usize = 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Filesystem operation failure.
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// Input file size is not a multiple of the record size.
    CorruptInput {
        path: PathBuf,
        len: u64,
    },
    /// Worker pool failure.
    Pool(PoolError),
    /// Not enough file descriptors to run a single merge job.
    ResourceLimit {
        needed: usize,
        available: usize,
    },
}

impl SortError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SortError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Io { source, .. } => Some(source),
            SortError::Pool(err) => Some(err),
            SortError::CorruptInput { .. } | SortError::ResourceLimit { .. } => None,
        }
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Io { path, source } => {
                write!(f, "I/O operation failed on {}: {}", path.display(), source)
            }
            SortError::CorruptInput { path, len } => write!(
                f,
                "{} is corrupt: length {} is not a multiple of {}",
                path.display(),
                len,
                RECORD_SIZE
            ),
            SortError::Pool(err) => write!(f, "worker pool failure: {}", err),
            SortError::ResourceLimit { needed, available } => write!(
                f,
                "merging needs {} open files but only {} are available",
                needed, available
            ),
        }
    }
}

impl From<PoolError> for SortError {
    fn from(err: PoolError) -> Self {
        SortError::Pool(err)
    }
}

/// Summary of a completed sort.
#[derive(Debug, Clone, Copy)]
pub struct SortStats {
    /// Total records written to the output file.
    pub records: u64,
    /// Runs produced by the split-and-presort phase.
    pub runs: usize,
    /// Cascading merge rounds executed (0 when the runs fit a single merge).
    pub merge_rounds: usize,
    /// Split-and-presort phase duration.
    pub split_time: Duration,
    /// Merge phase duration.
    pub merge_time: Duration,
}

/// External sorter builder. Provides methods for [`DirSorter`] initialization.
#[derive(Debug, Clone)]
pub struct DirSorterBuilder {
    /// Upper bound on aggregate sort-buffer residency, in bytes.
    memory_budget: u64,
    /// Number of worker threads. Defaults to the hardware parallelism.
    workers: Option<usize>,
    /// Maximum number of runs one merger combines.
    fan_in: usize,
    /// Per-stream read/write buffer size.
    io_buf_size: usize,
    /// Whether temporary files are removed when a sort fails.
    cleanup_on_failure: bool,
}

impl DirSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        DirSorterBuilder::default()
    }

    /// Sets the memory budget for sort buffers, in bytes.
    pub fn with_memory_budget(mut self, bytes: u64) -> DirSorterBuilder {
        self.memory_budget = bytes;
        return self;
    }

    /// Sets the number of worker threads.
    pub fn with_workers(mut self, workers: usize) -> DirSorterBuilder {
        self.workers = Some(workers);
        return self;
    }

    /// Sets the merge fan-in. Values below 2 are raised to 2 when the sorter
    /// is built.
    pub fn with_fan_in(mut self, fan_in: usize) -> DirSorterBuilder {
        self.fan_in = fan_in;
        return self;
    }

    /// Sets the per-stream read/write buffer size.
    pub fn with_io_buf_size(mut self, buf_size: usize) -> DirSorterBuilder {
        self.io_buf_size = buf_size;
        return self;
    }

    /// Removes temporary files when a sort fails instead of leaving them in
    /// place for diagnosis.
    pub fn with_cleanup_on_failure(mut self, cleanup: bool) -> DirSorterBuilder {
        self.cleanup_on_failure = cleanup;
        return self;
    }

    /// Builds a [`DirSorter`] instance using the provided configuration.
    pub fn build(self) -> Result<DirSorter, SortError> {
        DirSorter::new(
            self.memory_budget,
            self.workers,
            self.fan_in,
            self.io_buf_size,
            self.cleanup_on_failure,
        )
    }
}

impl Default for DirSorterBuilder {
    fn default() -> Self {
        DirSorterBuilder {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            workers: None,
            fan_in: DEFAULT_FAN_IN,
            io_buf_size: DEFAULT_IO_BUF_SIZE,
            cleanup_on_failure: false,
        }
    }
}

/// External sorter for directories of binary record files.
pub struct DirSorter {
    /// Pool executing producer and merger jobs.
    pool: WorkerPool,
    /// Per-worker sort buffer capacity, in records.
    buffer_capacity: usize,
    /// Merge fan-in, clamped once against the open-file budget so the
    /// direct-merge shortcut and the cascade use the same value.
    fan_in: usize,
    /// Per-stream read/write buffer size.
    io_buf_size: usize,
    /// Whether temporary files are removed when a sort fails.
    cleanup_on_failure: bool,
}

impl DirSorter {
    /// Creates a new sorter instance.
    ///
    /// # Arguments
    /// * `memory_budget` - Upper bound on aggregate sort-buffer residency, in bytes.
    /// * `workers` - Number of worker threads. If [`None`], the hardware
    ///   parallelism is used, falling back to 32 when it cannot be determined.
    /// * `fan_in` - Maximum number of runs one merger combines.
    /// * `io_buf_size` - Per-stream read/write buffer size.
    /// * `cleanup_on_failure` - Remove temporary files when a sort fails.
    pub fn new(
        memory_budget: u64,
        workers: Option<usize>,
        fan_in: usize,
        io_buf_size: usize,
        cleanup_on_failure: bool,
    ) -> Result<Self, SortError> {
        let workers = workers.unwrap_or_else(default_workers).max(1);
        let fan_in = clamp_fan_in(fan_in, max_open_files())?;
        let buffer_capacity = buffer_capacity(memory_budget, workers);

        log::info!(
            "initializing sorter (workers: {}, fan-in: {}, buffer: {} records per worker)",
            workers,
            fan_in,
            buffer_capacity
        );

        return Ok(DirSorter {
            pool: WorkerPool::new(workers),
            buffer_capacity,
            fan_in,
            io_buf_size,
            cleanup_on_failure,
        });
    }

    /// Sorts every record file under `input_dir` into a single file at
    /// `output`, overwriting it if present.
    ///
    /// The sort runs in two phases: every input file is turned into a sorted
    /// run on the worker pool, then the runs are merged in cascading rounds of
    /// up to fan-in files each until one file remains. On failure the output
    /// is not created and temporary files are left in place unless the sorter
    /// was configured with cleanup on failure.
    pub fn sort(&self, input_dir: &Path, output: &Path) -> Result<SortStats, SortError> {
        let mut temp_files = Vec::new();
        let result = self.sort_tracked(input_dir, output, &mut temp_files);

        if result.is_err() && self.cleanup_on_failure {
            for path in &temp_files {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => log::warn!("temporary file {} not removed: {}", path.display(), err),
                }
            }
        }

        result
    }

    fn sort_tracked(
        &self,
        input_dir: &Path,
        output: &Path,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<SortStats, SortError> {
        let inputs = collect_input_files(input_dir);
        log::info!("sorting {} input files from {}", inputs.len(), input_dir.display());

        let split_start = Instant::now();
        let runs = self.produce_runs(&inputs, temp_files)?;
        let split_time = split_start.elapsed();

        let records: u64 = runs.iter().map(|run| run.records).sum();
        log::info!(
            "split and presort done ({} runs, {} records, {} ms)",
            runs.len(),
            records,
            split_time.as_millis()
        );

        let merge_start = Instant::now();
        let merge_rounds = self.merge_runs(&runs, output, temp_files)?;
        let merge_time = merge_start.elapsed();

        log::info!(
            "merge done ({} rounds, {} ms), result saved to {}",
            merge_rounds,
            merge_time.as_millis(),
            output.display()
        );

        return Ok(SortStats {
            records,
            runs: runs.len(),
            merge_rounds,
            split_time,
            merge_time,
        });
    }

    /// Phase one: one producer task per input file, dispatched on the pool.
    fn produce_runs(
        &self,
        inputs: &[PathBuf],
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<Vec<Run>, SortError> {
        let mut handles = Vec::with_capacity(inputs.len());
        for input in inputs {
            let input = input.clone();
            let capacity = self.buffer_capacity;
            let io_buf_size = self.io_buf_size;
            let cleanup = self.cleanup_on_failure;
            let handle =
                self.pool.submit(move || run::produce_run(&input, capacity, io_buf_size, cleanup))?;
            handles.push(handle);
        }

        // every handle is joined before the first failure surfaces, so no
        // producer is still touching the input directory on return
        let mut runs = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.wait() {
                Ok(Ok(run)) => {
                    temp_files.push(run.path.clone());
                    runs.push(run);
                }
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    first_error.get_or_insert(SortError::Pool(err));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(runs),
        }
    }

    /// Phase two: cascading merge rounds until one file remains.
    fn merge_runs(
        &self,
        runs: &[Run],
        output: &Path,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<usize, SortError> {
        if runs.is_empty() {
            // no input records at all, the result is an empty file
            fs::File::create(output).map_err(|err| SortError::io(output, err))?;
            return Ok(0);
        }

        if runs.len() == 1 {
            move_file(&runs[0].path, output)?;
            return Ok(0);
        }

        let mut current: Vec<PathBuf> = runs.iter().map(|run| run.path.clone()).collect();

        if current.len() <= self.fan_in {
            merger::merge_files(&current, output, self.io_buf_size)?;
            remove_files(&current)?;
            return Ok(0);
        }

        let mut round = 0;
        while current.len() > 1 {
            log::debug!("merge round {} over {} files", round, current.len());

            let mut forwarded: Vec<PathBuf> = Vec::new();
            let mut groups: Vec<Vec<PathBuf>> = Vec::new();
            let mut intermediates: Vec<PathBuf> = Vec::new();

            for start in (0..current.len()).step_by(self.fan_in) {
                let end = (start + self.fan_in).min(current.len());
                let group = current[start..end].to_vec();
                if group.len() == 1 {
                    // nothing to merge, the file moves to the next round as is
                    forwarded.extend(group);
                } else {
                    let intermediate = intermediate_path(output, round, start);
                    temp_files.push(intermediate.clone());
                    intermediates.push(intermediate);
                    groups.push(group);
                }
            }

            self.dispatch_merges(&groups, &intermediates)?;

            // the round is complete, its consumed inputs can go
            for group in &groups {
                remove_files(group)?;
            }

            current = intermediates;
            current.extend(forwarded);
            round += 1;
        }

        // the survivor of the cascade becomes the output
        let survivor = current.into_iter().next().expect("cascade left one file");
        move_file(&survivor, output)?;

        return Ok(round);
    }

    /// Submits one merger job per group, in waves sized so that concurrent
    /// mergers stay within the open-file budget.
    fn dispatch_merges(&self, groups: &[Vec<PathBuf>], outputs: &[PathBuf]) -> Result<(), SortError> {
        let max_inflight = self.max_parallel_merges();
        if max_inflight < self.pool.size() {
            log::debug!(
                "open-file budget limits the round to {} concurrent mergers",
                max_inflight
            );
        }

        for wave_start in (0..groups.len()).step_by(max_inflight) {
            let wave_end = (wave_start + max_inflight).min(groups.len());

            let mut handles = Vec::with_capacity(wave_end - wave_start);
            for idx in wave_start..wave_end {
                let group = groups[idx].clone();
                let destination = outputs[idx].clone();
                let io_buf_size = self.io_buf_size;
                let handle = self
                    .pool
                    .submit(move || merger::merge_files(&group, &destination, io_buf_size))?;
                handles.push(handle);
            }

            let mut first_error = None;
            for handle in handles {
                match handle.wait() {
                    Ok(Ok(_records)) => {}
                    Ok(Err(err)) => {
                        first_error.get_or_insert(err);
                    }
                    Err(err) => {
                        first_error.get_or_insert(SortError::Pool(err));
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Concurrent mergers allowed by the open-file budget: each holds one
    /// stream per merged run plus the output file.
    fn max_parallel_merges(&self) -> usize {
        let available = max_open_files().saturating_sub(RESERVED_FDS);
        (available / (self.fan_in + 1)).max(1).min(self.pool.size())
    }
}

/// Recursively enumerates regular files under `dir`, following symlinks.
/// Enumeration errors are logged and skipped; the sort proceeds with the
/// files found.
fn collect_input_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => log::warn!("directory entry skipped: {}", err),
        }
    }
    files
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(FALLBACK_WORKERS)
}

/// Per-worker sort buffer capacity in records, dividing the budget evenly so
/// aggregate residency stays within it even with every worker in its sort
/// phase at once.
fn buffer_capacity(memory_budget: u64, workers: usize) -> usize {
    let capacity = memory_budget as usize / (workers.max(1) * RECORD_SIZE);
    if capacity == 0 {
        // a budget below 8 bytes per worker still needs room for one record,
        // overshooting the nominal budget by at most 8 bytes per worker
        log::warn!(
            "memory budget {} is too small for {} workers, using 1-record buffers",
            memory_budget,
            workers
        );
        return 1;
    }
    capacity
}

/// Raises fan-in values below 2 and lowers values the open-file limit cannot
/// host. Fails when even a 2-way merge would exceed the limit.
fn clamp_fan_in(fan_in: usize, open_file_limit: usize) -> Result<usize, SortError> {
    let fan_in = fan_in.max(2);

    let available = open_file_limit.saturating_sub(RESERVED_FDS);
    if available < 3 {
        return Err(SortError::ResourceLimit {
            needed: 3,
            available,
        });
    }

    let hosted = available - 1;
    if fan_in > hosted {
        log::warn!("fan-in {} exceeds the open-file budget, clamped to {}", fan_in, hosted);
        return Ok(hosted);
    }

    Ok(fan_in)
}

#[cfg(unix)]
fn max_open_files() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
        limit.rlim_cur as usize
    } else {
        FALLBACK_FD_LIMIT
    }
}

#[cfg(not(unix))]
fn max_open_files() -> usize {
    FALLBACK_FD_LIMIT
}

/// Renames `from` to `to`, falling back to copy-and-remove across
/// filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), SortError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    fs::copy(from, to).map_err(|err| SortError::io(to, err))?;
    fs::remove_file(from).map_err(|err| SortError::io(from, err))?;
    Ok(())
}

fn remove_files(paths: &[PathBuf]) -> Result<(), SortError> {
    for path in paths {
        fs::remove_file(path).map_err(|err| SortError::io(path, err))?;
    }
    Ok(())
}

fn intermediate_path(output: &Path, round: usize, offset: usize) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(format!(".intermediate_r{}_g{}", round, offset));
    PathBuf::from(name)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rstest::*;

    use super::{
        buffer_capacity, clamp_fan_in, collect_input_files, intermediate_path, move_file,
        DirSorterBuilder, SortError, DEFAULT_FAN_IN, DEFAULT_MEMORY_BUDGET, FALLBACK_FD_LIMIT,
    };

    #[rstest]
    #[case(64 * 1024 * 1024, 8, 1024 * 1024)]
    #[case(1024, 4, 32)]
    #[case(1024, 1, 128)]
    // degenerate budgets round up to one record per worker
    #[case(7, 1, 1)]
    #[case(0, 32, 1)]
    fn test_buffer_capacity(#[case] budget: u64, #[case] workers: usize, #[case] expected: usize) {
        assert_eq!(buffer_capacity(budget, workers), expected);
    }

    #[test]
    fn test_fan_in_floor() {
        assert_eq!(clamp_fan_in(0, FALLBACK_FD_LIMIT).unwrap(), 2);
        assert_eq!(clamp_fan_in(1, FALLBACK_FD_LIMIT).unwrap(), 2);
        assert_eq!(clamp_fan_in(DEFAULT_FAN_IN, FALLBACK_FD_LIMIT).unwrap(), DEFAULT_FAN_IN);
    }

    #[test]
    fn test_fan_in_clamped_by_open_file_limit() {
        // 40 descriptors minus 32 reserved minus the output leave a 7-way merge
        assert_eq!(clamp_fan_in(DEFAULT_FAN_IN, 40).unwrap(), 7);
    }

    #[test]
    fn test_fan_in_below_two_way_merge_is_resource_limit() {
        let err = clamp_fan_in(DEFAULT_FAN_IN, 34).unwrap_err();

        match err {
            SortError::ResourceLimit { needed, available } => {
                assert_eq!(needed, 3);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_intermediate_path_naming() {
        let path = intermediate_path(Path::new("/out/sorted.dat"), 2, 128);
        assert_eq!(path, PathBuf::from("/out/sorted.dat.intermediate_r2_g128"));
    }

    #[test]
    fn test_builder_defaults() {
        let builder = DirSorterBuilder::new();
        assert_eq!(builder.memory_budget, DEFAULT_MEMORY_BUDGET);
        assert_eq!(builder.fan_in, DEFAULT_FAN_IN);
        assert_eq!(builder.workers, None);
        assert!(!builder.cleanup_on_failure);
    }

    #[rstest]
    fn test_move_file() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let from = tmp_dir.path().join("from");
        let to = tmp_dir.path().join("to");
        fs::write(&from, b"payload").unwrap();

        move_file(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[rstest]
    fn test_collect_input_files_recurses() {
        let tmp_dir = tempfile::tempdir().unwrap();
        fs::create_dir(tmp_dir.path().join("nested")).unwrap();
        fs::write(tmp_dir.path().join("a.dat"), b"").unwrap();
        fs::write(tmp_dir.path().join("nested/b.dat"), b"").unwrap();

        let mut files = collect_input_files(tmp_dir.path());
        files.sort();

        assert_eq!(
            files,
            vec![tmp_dir.path().join("a.dat"), tmp_dir.path().join("nested/b.dat")]
        );
    }

    #[test]
    fn test_collect_input_files_missing_dir_is_empty() {
        let files = collect_input_files(Path::new("/nonexistent/dirsort/input"));
        assert!(files.is_empty());
    }
}

//! `dirsort` is an external merge sort engine for directories of binary
//! record files.
//!
//! Every input file is a flat sequence of signed 64-bit little-endian
//! integers with no header or separators. The sorter produces a single output
//! file containing every input record in ascending order while keeping
//! in-memory sort-buffer residency within a caller-supplied budget, no matter
//! how far the input outgrows RAM. Sorting is achieved in two phases: each
//! input file is streamed through a memory-bounded buffer into a sorted "run"
//! on disk, then the runs are combined by cascading k-way merge rounds until
//! one file remains. Both phases execute on a fixed-size worker pool, so
//! throughput scales with cores while peak residency stays near the budget.
//!
//! # Overview
//!
//! `dirsort` supports the following features:
//!
//! * **Memory limit support:**
//!   the memory budget is divided evenly across the workers, bounding
//!   aggregate sort-buffer residency regardless of input sizes.
//! * **Multithreading support:**
//!   run production and merge rounds are parallelized over a worker pool
//!   sized to the hardware parallelism.
//! * **Bounded descriptor usage:**
//!   the merge fan-in is capped against the process open-file limit and
//!   merge jobs are throttled so a round never exhausts descriptors.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use env_logger;
//! use log;
//!
//! use dirsort::DirSorterBuilder;
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let sorter = DirSorterBuilder::new()
//!         .with_memory_budget(64 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort(Path::new("./data"), Path::new("./sorted.dat")).unwrap();
//!
//!     println!("sorted {} records", stats.records);
//! }
//! ```

pub mod buffer;
pub mod merger;
pub mod pool;
pub mod record;
pub mod run;
pub mod sort;

pub use buffer::RecordBuffer;
pub use pool::{PoolError, TaskHandle, WorkerPool};
pub use record::{RecordReader, RecordWriter, RECORD_SIZE};
pub use run::Run;
pub use sort::{DirSorter, DirSorterBuilder, SortError, SortStats};

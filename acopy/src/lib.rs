//! Asynchronous, concurrency-capped copying of files and directory trees
//!
//! [`copy_file`] transfers one file through a fixed-size buffer without ever
//! loading it whole into memory; [`copy_dir`] mirrors a directory tree,
//! submitting one file copy per regular file into a shared [`TaskPool`] so
//! that at most a caller-chosen number of copies run at once.
//!
//! Both operations return a [`Unit`] immediately; all I/O failures surface
//! through that unit's resolution rather than through a synchronous error.
//! Argument validation is the one exception: an empty path, a zero buffer
//! size or a zero degree of parallelism produce an already-failed unit
//! before the filesystem is touched.
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use acopy::Outcome;
//!
//! # async fn example() {
//! let unit = acopy::copy_dir(Path::new("photos"), Path::new("/mnt/backup/photos"));
//! match unit.wait().await {
//!     Outcome::Succeeded => tracing::info!("tree mirrored"),
//!     Outcome::Failed(fault) => tracing::warn!("copy failed: {}", fault),
//!     Outcome::Canceled => tracing::warn!("copy never finished"),
//! }
//! # }
//! ```
//!
//! A directory copy fails fast: the first file that fails resolves the
//! returned unit with that failure, without waiting for the remaining
//! in-flight copies (they run to completion unobserved). Failures can be
//! inspected by downcasting the [`Fault`] to [`Error`].

pub use chain::{Fault, InvalidCapacity, Outcome, TaskPool, Unit};

mod copy;
#[cfg(test)]
mod testutils;

pub use copy::{
    copy_dir, copy_dir_with, copy_file, copy_file_with, Error, DEFAULT_BUFFER_SIZE,
    DEFAULT_PARALLELISM,
};

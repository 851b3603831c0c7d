//! Interval and scope keyed staging of raw records.
//!
//! tally summarizes raw telemetry into per-window statistics. Until a window
//! closes the raw records that fed it live here, on disk, so that a process
//! restart mid-window does not lose them. Records are addressed by a two-level
//! key: an `interval`, the start of the window in milliseconds since the unix
//! epoch, and a `scope`, the logical source of the record such as a service
//! name. Either level may be drained or inspected independently.
//!
//! The only implementation today is [`filesystem::FilesystemBuffer`] which
//! keeps one temporary file per (interval, scope) pair.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::cargo_common_metadata)]

use std::io;

use rustc_hash::FxHashSet;

mod codec;
pub mod filesystem;

pub use filesystem::FilesystemBuffer;

/// Errors produced by a [`Buffer`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The buffer has been shut down and will not accept further operations.
    #[error("buffer has been shut down")]
    Shutdown,
    /// Wrapper around [`io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    /// A payload is too large to be framed.
    #[error("payload of {0} bytes exceeds the maximum frame size")]
    PayloadTooLarge(usize),
    /// A backing file ended in the middle of a frame.
    #[error("backing file ends with a truncated frame")]
    TruncatedFrame,
    /// One or more failures while releasing buffer resources.
    #[error("{} error(s) during teardown: {}", .0.len(), render(.0))]
    Teardown(Vec<Error>),
}

fn render(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Collapse a list of teardown failures into a single result.
    ///
    /// # Errors
    ///
    /// A single failure is returned as is, several as [`Error::Teardown`].
    pub fn collect(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Teardown(errors)),
        }
    }
}

/// Durable staging of raw records keyed by (interval, scope).
///
/// All operations are safe to call concurrently. Once [`Buffer::shutdown`] has
/// been called every other operation fails with [`Error::Shutdown`].
pub trait Buffer: Send + Sync {
    /// Append `payload` to the (interval, scope) pair, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down or the underlying write fails.
    fn write(&self, interval: i64, scope: &str, payload: &[u8]) -> Result<(), Error>;

    /// The scopes with open entries under `interval`.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down.
    fn scopes(&self, interval: i64) -> Result<FxHashSet<String>, Error>;

    /// The intervals with at least one open scope.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down.
    fn intervals(&self) -> Result<FxHashSet<i64>, Error>;

    /// Replay every payload written to (interval, scope) in write order,
    /// returning the number of payloads visited. A pair that was never written
    /// visits nothing.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down or the backing file cannot be read.
    fn for_each(
        &self,
        interval: i64,
        scope: &str,
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, Error>;

    /// Close and delete the (interval, scope) pair. Closing a pair that is
    /// not open is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down or the file cannot be closed or
    /// removed.
    fn close_interval_scope(&self, interval: i64, scope: &str) -> Result<(), Error>;

    /// Close and delete every scope under `interval`. Every scope is
    /// attempted, failures are returned together.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shut down or any scope fails to close.
    fn close_interval(&self, interval: i64) -> Result<(), Error>;

    /// Release every open file and mark the buffer unusable. Calling this
    /// more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns every failure encountered while closing files.
    fn shutdown(&self) -> Result<(), Error>;
}

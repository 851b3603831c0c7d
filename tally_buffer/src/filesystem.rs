//! A [`Buffer`] backed by temporary files.
//!
//! Every (interval, scope) pair gets its own temporary file in the configured
//! directory, created on first write. Closing a pair closes and deletes its
//! file. Shutting the buffer down closes every file but leaves it on disk so
//! that records of windows that never flushed can be inspected after the fact.
//! Dropping a buffer that was never shut down deletes its files.
//!
//! ## Metrics
//!
//! `buffer_bytes_written`: Total bytes appended, framing included
//! `buffer_files_open`: Number of backing files currently open
//!

use std::{
    collections::hash_map::Entry,
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{Buffer, Error, codec};

const FILE_PREFIX: &str = "buffer-";

#[derive(Debug, Default)]
struct Inner {
    open: FxHashMap<i64, FxHashMap<String, NamedTempFile>>,
    shutdown: bool,
}

impl Inner {
    fn file_count(&self) -> usize {
        self.open.values().map(FxHashMap::len).sum()
    }

    // Close a single pair, assuming the lock is held and the buffer is live.
    fn close_pair(&mut self, interval: i64, scope: &str) -> Result<(), Error> {
        let Some(scopes) = self.open.get_mut(&interval) else {
            return Ok(());
        };
        let Some(file) = scopes.remove(scope) else {
            return Ok(());
        };
        if scopes.is_empty() {
            self.open.remove(&interval);
        }
        debug!(interval, scope, path = ?file.path(), "closing buffer file");
        file.close()?;
        Ok(())
    }
}

/// Disk staging with one temporary file per (interval, scope) pair.
#[derive(Debug)]
pub struct FilesystemBuffer {
    directory: PathBuf,
    inner: Mutex<Inner>,
}

impl FilesystemBuffer {
    /// Create a new [`FilesystemBuffer`] rooted at `directory`. The directory
    /// must exist, no files are created until the first write.
    #[must_use]
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The directory backing files are created in.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the file table consistent, every
        // mutation is a single insert or remove.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        let inner = self.lock();
        if inner.shutdown {
            return Err(Error::Shutdown);
        }
        Ok(inner)
    }
}

// Append `payload` to the scope's file, creating the file if needed.
fn append(
    scopes: &mut FxHashMap<String, NamedTempFile>,
    directory: &Path,
    interval: i64,
    scope: &str,
    payload: &[u8],
) -> Result<usize, Error> {
    let file = match scopes.entry(scope.to_string()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let file = tempfile::Builder::new()
                .prefix(FILE_PREFIX)
                .tempfile_in(directory)?;
            debug!(interval, scope, path = ?file.path(), "created buffer file");
            entry.insert(file)
        }
    };
    let fp = file.as_file_mut();
    fp.seek(SeekFrom::End(0))?;
    codec::encode(fp, payload)
}

impl Buffer for FilesystemBuffer {
    fn write(&self, interval: i64, scope: &str, payload: &[u8]) -> Result<(), Error> {
        let mut inner = self.live()?;

        let scopes = inner.open.entry(interval).or_default();
        let result = append(scopes, &self.directory, interval, scope, payload);
        // A failed create must not leave an empty interval behind.
        if inner.open.get(&interval).is_some_and(FxHashMap::is_empty) {
            inner.open.remove(&interval);
        }
        let written = result?;

        counter!("buffer_bytes_written").increment(written as u64);
        #[allow(clippy::cast_precision_loss)]
        gauge!("buffer_files_open").set(inner.file_count() as f64);
        Ok(())
    }

    fn scopes(&self, interval: i64) -> Result<FxHashSet<String>, Error> {
        let inner = self.live()?;
        Ok(inner
            .open
            .get(&interval)
            .map(|scopes| scopes.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn intervals(&self) -> Result<FxHashSet<i64>, Error> {
        let inner = self.live()?;
        Ok(inner.open.keys().copied().collect())
    }

    fn for_each(
        &self,
        interval: i64,
        scope: &str,
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, Error> {
        let mut inner = self.live()?;
        let Some(file) = inner
            .open
            .get_mut(&interval)
            .and_then(|scopes| scopes.get_mut(scope))
        else {
            return Ok(0);
        };

        let fp = file.as_file_mut();
        fp.seek(SeekFrom::Start(0))?;
        codec::iterate(&mut BufReader::new(fp), visit)
    }

    fn close_interval_scope(&self, interval: i64, scope: &str) -> Result<(), Error> {
        let mut inner = self.live()?;
        let res = inner.close_pair(interval, scope);
        #[allow(clippy::cast_precision_loss)]
        gauge!("buffer_files_open").set(inner.file_count() as f64);
        res
    }

    fn close_interval(&self, interval: i64) -> Result<(), Error> {
        let mut inner = self.live()?;
        let scopes: Vec<String> = inner
            .open
            .get(&interval)
            .map(|scopes| scopes.keys().cloned().collect())
            .unwrap_or_default();

        let mut errors = Vec::new();
        for scope in scopes {
            if let Err(e) = inner.close_pair(interval, &scope) {
                errors.push(e);
            }
        }
        // A failed close has already dropped its file from the table.
        inner.open.remove(&interval);
        #[allow(clippy::cast_precision_loss)]
        gauge!("buffer_files_open").set(inner.file_count() as f64);
        Error::collect(errors)
    }

    fn shutdown(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Ok(());
        }
        inner.shutdown = true;

        let mut errors = Vec::new();
        for (interval, scopes) in inner.open.drain() {
            for (scope, file) in scopes {
                match file.keep() {
                    Ok((fp, path)) => {
                        if let Err(e) = fp.sync_all() {
                            errors.push(Error::Io(e));
                        }
                        info!(interval, scope = %scope, path = ?path, "buffer file left on disk at shutdown");
                    }
                    Err(e) => errors.push(Error::Io(e.into())),
                }
            }
        }
        gauge!("buffer_files_open").set(0.0);
        Error::collect(errors)
    }
}

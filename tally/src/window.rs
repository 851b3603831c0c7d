//! Windowed accumulation of statistic groups.
//!
//! A [`Recorder`] folds [`StatRecord`]s into [`SketchGroup`]s belonging to the
//! current time window. Windows are fixed length and non-overlapping, window
//! `w` spans `[w, w + interval)` with `w = floor(t / interval) * interval`.
//!
//! Only one window is open at a time. The recorder advances lazily: the first
//! call whose `now` lands in a later window closes the open window and returns
//! its groups as a [`Pile`]. A record whose `now` lands in an earlier window is
//! folded into the open window rather than reopening a closed one, which
//! bounds memory to a single window of groups. Callers that need flushes while
//! traffic is idle drive [`Recorder::tick`] from a timer.
//!
//! ```text
//!   Empty --record--> Accumulating --record/tick in later window--> Accumulating
//!                                          \
//!                                           `--> Pile of the closed window
//! ```

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH},
};

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{sketch::SketchGroup, stats::StatRecord};

/// Errors produced by [`Recorder`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The window interval must be at least one millisecond
    #[error("window interval must be at least one millisecond, got {0:?}")]
    Interval(Duration),
    /// The supplied time precedes the unix epoch
    #[error("time precedes the unix epoch: {0}")]
    SystemTime(#[from] SystemTimeError),
}

/// Start of the window containing `t_ms`, both in milliseconds.
///
/// # Panics
///
/// Panics if `interval_ms` is not positive.
#[must_use]
pub fn window_start(t_ms: i64, interval_ms: i64) -> i64 {
    assert!(interval_ms > 0, "window interval must be positive");
    t_ms.div_euclid(interval_ms) * interval_ms
}

/// Milliseconds since the unix epoch.
///
/// # Errors
///
/// Fails if `t` precedes the unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis(t: SystemTime) -> Result<i64, SystemTimeError> {
    Ok(t.duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

/// Every group of one closed window, keyed by group key. Groups whose keys
/// collide share a bucket.
#[derive(Debug, Default)]
pub struct Pile {
    /// Start of the window, milliseconds since the unix epoch
    pub window_start: i64,
    /// Window length in milliseconds
    pub interval_ms: i64,
    /// The window's groups
    pub groups: FxHashMap<u64, Vec<SketchGroup>>,
}

impl Pile {
    /// Total number of groups in the pile.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Whether the pile holds no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate every group in the pile.
    pub fn iter(&self) -> impl Iterator<Item = &SketchGroup> {
        self.groups.values().flatten()
    }
}

#[derive(Debug, Default)]
struct State {
    window_start: Option<i64>,
    groups: FxHashMap<u64, Vec<SketchGroup>>,
}

impl State {
    fn take(&mut self, interval_ms: i64) -> Option<Pile> {
        let window_start = self.window_start?;
        let groups = std::mem::take(&mut self.groups);
        if groups.is_empty() {
            return None;
        }
        Some(Pile {
            window_start,
            interval_ms,
            groups,
        })
    }

    // The window a record for `start` lands in, late records fold into the
    // open window.
    fn landing(&self, start: i64) -> i64 {
        self.window_start.map_or(start, |open| open.max(start))
    }

    fn fold(&mut self, stat: &StatRecord) {
        let bucket = self.groups.entry(stat.group_key()).or_default();
        let group = match bucket.iter().position(|g| g.matches(stat)) {
            Some(idx) => &mut bucket[idx],
            None => {
                bucket.push(SketchGroup::new(stat));
                let last = bucket.len() - 1;
                &mut bucket[last]
            }
        };
        group.observe(&stat.tag_value, stat.count);
    }

    // Advance to `start` if it is later than the open window, returning the
    // closed window.
    fn advance(&mut self, start: i64, interval_ms: i64) -> Option<Pile> {
        match self.window_start {
            None => {
                self.window_start = Some(start);
                None
            }
            Some(open) if start > open => {
                let pile = self.take(interval_ms);
                self.window_start = Some(start);
                pile
            }
            Some(_) => None,
        }
    }
}

/// Accumulates statistics for one stream into fixed time windows.
#[derive(Debug)]
pub struct Recorder {
    interval_ms: i64,
    state: Mutex<State>,
}

impl Recorder {
    /// Create a new [`Recorder`] with windows of length `interval`.
    ///
    /// # Errors
    ///
    /// Fails if `interval` is shorter than one millisecond.
    pub fn new(interval: Duration) -> Result<Self, Error> {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        if interval_ms < 1 {
            return Err(Error::Interval(interval));
        }
        Ok(Self {
            interval_ms,
            state: Mutex::new(State::default()),
        })
    }

    /// Window length in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Start of the open window, if any.
    #[must_use]
    pub fn current_window(&self) -> Option<i64> {
        self.lock().window_start
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold `stat` into the window containing `now`.
    ///
    /// Returns the previously open window's pile if `now` lies in a later
    /// window. The record itself always lands in the window that is open once
    /// this call returns.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch.
    pub fn record(&self, now: SystemTime, stat: &StatRecord) -> Result<Option<Pile>, Error> {
        self.record_staged(now, std::slice::from_ref(stat), |_| Ok::<(), Error>(()))
    }

    /// Fold `stats` into the window containing `now`, calling `stage` with the
    /// start of the window they land in first.
    ///
    /// `stage` runs under the recorder's lock: no rollover can close the
    /// window between staging and folding, and a pile is only ever handed out
    /// after everything staged against its window. If `stage` fails nothing
    /// is folded and no window closes.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch or `stage` fails.
    pub fn record_staged<E, F>(
        &self,
        now: SystemTime,
        stats: &[StatRecord],
        stage: F,
    ) -> Result<Option<Pile>, E>
    where
        E: From<Error>,
        F: FnOnce(i64) -> Result<(), E>,
    {
        let start = window_start(unix_millis(now).map_err(Error::from)?, self.interval_ms);

        let mut state = self.lock();
        stage(state.landing(start))?;
        let pile = state.advance(start, self.interval_ms);
        for stat in stats {
            state.fold(stat);
        }
        drop(state);

        counter!("stat_records_observed").increment(stats.len() as u64);
        if let Some(pile) = &pile {
            debug!(
                window_start = pile.window_start,
                groups = pile.len(),
                "window rolled over"
            );
        }
        Ok(pile)
    }

    /// Close the open window if `now` lies in a later window.
    ///
    /// This is the idle path: with no records arriving [`Recorder::record`]
    /// never observes a rollover. Returns `None` if no window closed or the
    /// closed window held no groups.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch.
    pub fn tick(&self, now: SystemTime) -> Result<Option<Pile>, Error> {
        let start = window_start(unix_millis(now)?, self.interval_ms);
        let mut state = self.lock();
        if state.window_start.is_none() {
            return Ok(None);
        }
        Ok(state.advance(start, self.interval_ms))
    }

    /// Close the open window regardless of time, leaving the recorder empty.
    #[must_use]
    pub fn drain(&self) -> Option<Pile> {
        let mut state = self.lock();
        let pile = state.take(self.interval_ms);
        state.window_start = None;
        pile
    }
}

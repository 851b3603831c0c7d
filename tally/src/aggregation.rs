//! Bucketed numeric accumulation.
//!
//! Cardinality sketches summarize attribute values. Where raw measurements
//! must be summarized instead an [`Accumulator`] keeps a running sum and
//! observation count per bucket. Buckets are given as ascending upper bounds:
//! a value lands in the first bucket whose bound is greater than or equal to
//! it, values beyond the last bound land in the last bucket. A single bucket
//! therefore takes every value.
//!
//! The accumulator stores raw sums and counts only. [`Aggregation`] derives
//! either a SUM or an AVG view on read, switching the view never requires
//! re-accumulation.
//!
//! [`MetricAggregator`] keeps one [`Aggregation`] per (window, series) so that
//! values of the same series are summarized per window. A series is identified
//! by a TID that covers the metric name as well as its attributes, see
//! [`crate::tid::of_series`].

use std::{
    cmp::Ordering,
    fmt,
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use num_traits::{Num, NumCast, Zero, ops::saturating::SaturatingAdd};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    record::Attributes,
    window::{unix_millis, window_start},
};

/// Errors produced by [`Accumulator`] and [`Aggregation`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Values were added under a name other than the aggregation's
    #[error("aggregation name mismatch: {expected} != {actual}")]
    NameMismatch {
        /// Configured name
        expected: String,
        /// Name supplied by the caller
        actual: String,
    },
    /// No bucket boundaries were supplied
    #[error("at least one bucket boundary is required")]
    NoBuckets,
    /// Bucket boundaries are not strictly ascending
    #[error("bucket boundaries must be strictly ascending")]
    UnorderedBuckets,
    /// The supplied time precedes the unix epoch
    #[error("time precedes the unix epoch")]
    SystemTime,
    /// The window interval must be positive
    #[error("window interval must be positive")]
    Interval,
}

/// A numeric type the accumulator can fold.
pub trait Numeric: Copy + PartialOrd + Num + NumCast + fmt::Debug + Send + 'static {
    /// Add `rhs`, clamping at the type's bounds instead of overflowing.
    #[must_use]
    fn accumulate(self, rhs: Self) -> Self;
}

impl Numeric for i64 {
    fn accumulate(self, rhs: Self) -> Self {
        SaturatingAdd::saturating_add(&self, &rhs)
    }
}

impl Numeric for f64 {
    fn accumulate(self, rhs: Self) -> Self {
        self + rhs
    }
}

/// The view an [`Aggregation`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    /// Sum of values per bucket
    #[default]
    Sum,
    /// Mean of values per bucket
    Avg,
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationType::Sum => f.write_str("sum"),
            AggregationType::Avg => f.write_str("avg"),
        }
    }
}

/// Per-bucket running sums and counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator<T> {
    buckets: Vec<T>,
    sums: Vec<T>,
    counts: Vec<u64>,
}

impl<T: Numeric> Accumulator<T> {
    /// Create an [`Accumulator`] with ascending upper bounds `buckets`.
    ///
    /// # Errors
    ///
    /// Fails if `buckets` is empty or not strictly ascending.
    pub fn new(buckets: Vec<T>) -> Result<Self, Error> {
        if buckets.is_empty() {
            return Err(Error::NoBuckets);
        }
        if buckets
            .windows(2)
            .any(|w| w[0].partial_cmp(&w[1]) != Some(Ordering::Less))
        {
            return Err(Error::UnorderedBuckets);
        }
        let n = buckets.len();
        Ok(Self {
            buckets,
            sums: vec![<T as Zero>::zero(); n],
            counts: vec![0; n],
        })
    }

    fn bucket_of(&self, value: T) -> usize {
        self.buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.buckets.len() - 1)
    }

    /// Fold `values` into their buckets.
    pub fn add(&mut self, values: &[T]) {
        for value in values {
            let idx = self.bucket_of(*value);
            self.sums[idx] = self.sums[idx].accumulate(*value);
            self.counts[idx] += 1;
        }
    }

    /// Sum per bucket.
    #[must_use]
    pub fn sum(&self) -> Vec<T> {
        self.sums.clone()
    }

    /// Mean per bucket. An empty bucket reports zero.
    #[must_use]
    pub fn avg(&self) -> Vec<T> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(sum, count)| {
                if *count == 0 {
                    return <T as Zero>::zero();
                }
                match <T as NumCast>::from(*count) {
                    Some(count) => *sum / count,
                    None => <T as Zero>::zero(),
                }
            })
            .collect()
    }

    /// Total observations across all buckets.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// The configured bucket bounds.
    #[must_use]
    pub fn buckets(&self) -> &[T] {
        &self.buckets
    }
}

/// A named accumulator reporting a SUM or AVG view.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation<T> {
    name: String,
    kind: AggregationType,
    tags: Attributes,
    accumulator: Accumulator<T>,
}

impl<T: Numeric> Aggregation<T> {
    /// Create a new [`Aggregation`].
    ///
    /// # Errors
    ///
    /// Fails if `buckets` is not a valid bucket layout.
    pub fn new(
        name: impl Into<String>,
        buckets: Vec<T>,
        kind: AggregationType,
        tags: Attributes,
    ) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            kind,
            tags,
            accumulator: Accumulator::new(buckets)?,
        })
    }

    /// Fold `values` into the aggregation.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NameMismatch`] if `name` is not this aggregation's
    /// name. Nothing is folded in that case.
    pub fn add(&mut self, name: &str, values: &[T]) -> Result<(), Error> {
        if self.name != name {
            return Err(Error::NameMismatch {
                expected: self.name.clone(),
                actual: name.to_string(),
            });
        }
        self.accumulator.add(values);
        Ok(())
    }

    /// The configured view of the per-bucket values.
    #[must_use]
    pub fn value(&self) -> Vec<T> {
        match self.kind {
            AggregationType::Sum => self.accumulator.sum(),
            AggregationType::Avg => self.accumulator.avg(),
        }
    }

    /// Sum per bucket.
    #[must_use]
    pub fn sum(&self) -> Vec<T> {
        self.accumulator.sum()
    }

    /// Mean per bucket.
    #[must_use]
    pub fn avg(&self) -> Vec<T> {
        self.accumulator.avg()
    }

    /// Total observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.accumulator.count()
    }

    /// The configured bucket bounds.
    #[must_use]
    pub fn buckets(&self) -> &[T] {
        self.accumulator.buckets()
    }

    /// The attribute set of the aggregated series.
    #[must_use]
    pub fn tags(&self) -> &Attributes {
        &self.tags
    }

    /// The aggregation's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The aggregation's view.
    #[must_use]
    pub fn aggregation_type(&self) -> AggregationType {
        self.kind
    }
}

/// Aggregations of one closed window.
#[derive(Debug)]
pub struct ClosedWindow<T> {
    /// Start of the window, milliseconds since the unix epoch
    pub window_start: i64,
    /// Aggregations keyed by series
    pub aggregations: FxHashMap<i64, Aggregation<T>>,
}

/// Windowed [`Aggregation`]s keyed by series.
#[derive(Debug)]
pub struct MetricAggregator<T> {
    interval_ms: i64,
    windows: Mutex<FxHashMap<i64, FxHashMap<i64, Aggregation<T>>>>,
}

impl<T: Numeric> MetricAggregator<T> {
    /// Create a new [`MetricAggregator`] with windows of `interval_ms`.
    ///
    /// # Errors
    ///
    /// Fails if `interval_ms` is not positive.
    pub fn new(interval_ms: i64) -> Result<Self, Error> {
        if interval_ms <= 0 {
            return Err(Error::Interval);
        }
        Ok(Self {
            interval_ms,
            windows: Mutex::new(FxHashMap::default()),
        })
    }

    /// Fold `values` for `series` into the window containing `now`,
    /// creating the aggregation from `buckets`, `kind` and `tags` on first
    /// sight.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch, the bucket layout is invalid or
    /// `name` disagrees with the series' existing aggregation.
    #[allow(clippy::too_many_arguments)]
    pub fn aggregate(
        &self,
        now: SystemTime,
        series: i64,
        name: &str,
        values: &[T],
        buckets: &[T],
        kind: AggregationType,
        tags: &Attributes,
    ) -> Result<(), Error> {
        let start = window_start(
            unix_millis(now).map_err(|_| Error::SystemTime)?,
            self.interval_ms,
        );
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(start).or_default();
        let aggregation = match window.entry(series) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Aggregation::new(name, buckets.to_vec(), kind, tags.clone())?)
            }
        };
        aggregation.add(name, values)
    }

    /// Remove and return every window that ends at or before the window
    /// containing `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch.
    pub fn emit(&self, now: SystemTime) -> Result<Vec<ClosedWindow<T>>, Error> {
        let current = window_start(
            unix_millis(now).map_err(|_| Error::SystemTime)?,
            self.interval_ms,
        );
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed: Vec<i64> = windows.keys().copied().filter(|w| *w < current).collect();
        closed.sort_unstable();
        Ok(closed
            .into_iter()
            .filter_map(|w| {
                windows.remove(&w).map(|aggregations| ClosedWindow {
                    window_start: w,
                    aggregations,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn single_bucket_sum_avg_count() {
        let mut acc = Accumulator::new(vec![10i64]).unwrap();
        acc.add(&[1, 2, 3]);
        assert_eq!(acc.sum(), vec![6]);
        assert_eq!(acc.avg(), vec![2]);
        assert_eq!(acc.count(), 3);

        let mut acc = Accumulator::new(vec![10.0f64]).unwrap();
        acc.add(&[1.0, 2.0, 3.0]);
        assert_eq!(acc.sum(), vec![6.0]);
        assert_eq!(acc.avg(), vec![2.0]);
        assert_eq!(acc.count(), 3);
    }

    #[test]
    fn values_route_to_owning_bucket() {
        let mut acc = Accumulator::new(vec![1.0, 5.0, 10.0]).unwrap();
        acc.add(&[0.5, 1.0, 2.0, 5.0, 7.0, 100.0]);
        assert_eq!(acc.sum(), vec![1.5, 7.0, 107.0]);
        assert_eq!(acc.count(), 6);
        assert_eq!(acc.buckets(), &[1.0, 5.0, 10.0]);
    }

    #[test]
    fn empty_bucket_averages_to_zero() {
        let mut acc = Accumulator::new(vec![1i64, 100]).unwrap();
        acc.add(&[50, 60]);
        assert_eq!(acc.avg(), vec![0, 55]);
        let acc = Accumulator::new(vec![1.0f64]).unwrap();
        assert_eq!(acc.avg(), vec![0.0]);
    }

    #[test]
    fn integer_sums_saturate() {
        let mut acc = Accumulator::new(vec![0i64, 10]).unwrap();
        acc.add(&[i64::MAX, 5, i64::MIN, -1]);
        assert_eq!(acc.sum(), vec![i64::MIN, i64::MAX]);
        assert_eq!(acc.count(), 4);
    }

    #[test]
    fn bucket_layout_is_validated() {
        assert_eq!(Accumulator::<i64>::new(vec![]), Err(Error::NoBuckets));
        assert_eq!(Accumulator::new(vec![5i64, 1]), Err(Error::UnorderedBuckets));
        assert_eq!(Accumulator::new(vec![1.0, 1.0]), Err(Error::UnorderedBuckets));
        assert_eq!(Accumulator::new(vec![1.0, f64::NAN]), Err(Error::UnorderedBuckets));
    }

    #[test]
    fn name_mismatch_is_rejected() {
        let mut agg =
            Aggregation::new("latency", vec![1.0], AggregationType::Sum, Attributes::default())
                .unwrap();
        let err = agg.add("bytes", &[1.0]).unwrap_err();
        assert_eq!(
            err,
            Error::NameMismatch {
                expected: "latency".to_string(),
                actual: "bytes".to_string()
            }
        );
        assert_eq!(agg.count(), 0);
    }

    #[test]
    fn view_follows_aggregation_type() {
        let mut sum =
            Aggregation::new("x", vec![10i64], AggregationType::Sum, Attributes::default())
                .unwrap();
        let mut avg =
            Aggregation::new("x", vec![10i64], AggregationType::Avg, Attributes::default())
                .unwrap();
        sum.add("x", &[2, 4]).unwrap();
        avg.add("x", &[2, 4]).unwrap();
        assert_eq!(sum.value(), vec![6]);
        assert_eq!(avg.value(), vec![3]);
        assert_eq!(avg.sum(), vec![6]);
        assert_eq!(sum.avg(), vec![3]);
        assert_eq!(avg.aggregation_type(), AggregationType::Avg);
        assert_eq!(avg.name(), "x");
    }

    #[test]
    fn aggregator_emits_only_closed_windows() {
        let agg = MetricAggregator::<f64>::new(10_000).unwrap();
        let tags = Attributes::default();
        agg.aggregate(at(1_000), 1, "m", &[1.0], &[10.0], AggregationType::Sum, &tags)
            .unwrap();
        agg.aggregate(at(2_000), 1, "m", &[2.0], &[10.0], AggregationType::Sum, &tags)
            .unwrap();
        agg.aggregate(at(2_000), 2, "m", &[5.0], &[10.0], AggregationType::Sum, &tags)
            .unwrap();
        agg.aggregate(at(12_000), 1, "m", &[3.0], &[10.0], AggregationType::Sum, &tags)
            .unwrap();

        assert!(agg.emit(at(9_000)).unwrap().is_empty());

        let closed = agg.emit(at(15_000)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window_start, 0);
        assert_eq!(closed[0].aggregations[&1].value(), vec![3.0]);
        assert_eq!(closed[0].aggregations[&2].count(), 1);

        // Emitted windows are gone.
        assert!(agg.emit(at(15_000)).unwrap().is_empty());
        let closed = agg.emit(at(25_000)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window_start, 10_000);
    }

    #[test]
    fn aggregator_surfaces_name_mismatch() {
        let agg = MetricAggregator::<i64>::new(1_000).unwrap();
        let tags = Attributes::default();
        agg.aggregate(at(0), 1, "a", &[1], &[10], AggregationType::Sum, &tags)
            .unwrap();
        assert!(matches!(
            agg.aggregate(at(0), 1, "b", &[1], &[10], AggregationType::Sum, &tags),
            Err(Error::NameMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn reads_are_idempotent(values in prop::collection::vec(-1_000i64..1_000, 0..64)) {
            let mut acc = Accumulator::new(vec![-100, 0, 100]).unwrap();
            acc.add(&values);
            prop_assert_eq!(acc.sum(), acc.sum());
            prop_assert_eq!(acc.avg(), acc.avg());
            prop_assert_eq!(acc.count(), values.len() as u64);
            prop_assert_eq!(acc.sum().iter().sum::<i64>(), values.iter().sum::<i64>());
        }
    }
}

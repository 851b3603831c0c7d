//! The stats processor.
//!
//! For every ingested [`Record`] the processor:
//!
//! 1. computes the record's TID,
//! 2. stages the raw record, JSON encoded, in the [`Buffer`] under the open
//!    window and the scope `<signal>/<service>`,
//! 3. folds numeric measurements of metric records into a windowed
//!    [`MetricAggregator`],
//! 4. emits one [`StatRecord`] per countable attribute into the signal's
//!    [`Recorder`].
//!
//! When a recorder closes a window its pile is turned into a report and
//! handed to the [`Dispatcher`]. Only after the hand-off are the window's
//! staged records released from the buffer. A full dispatch queue loses the
//! report but the staged records are released all the same.
//!
//! Attribute keys starting with `_` are pipeline-internal and not counted,
//! with the exception of [`TID_FIELD`]: every record is stamped with its TID
//! under that key and the number of distinct TIDs is counted like any other
//! attribute.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use metrics::counter;
use tally_buffer::Buffer;
use tracing::{debug, info, warn};

use crate::{
    aggregation::{self, AggregationType, ClosedWindow, MetricAggregator},
    config::Config,
    dispatch::Dispatcher,
    exporter,
    record::{Attributes, Record, Signal},
    stats::{Phase, StatRecord},
    tid::{self, Environment, TID_FIELD},
    window::{self, Pile, Recorder, unix_millis},
};

/// Errors produced by [`StatsProcessor`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Window bookkeeping failed
    #[error("window error: {0}")]
    Window(#[from] window::Error),
    /// The staging buffer failed. [`tally_buffer::Error::Shutdown`] is fatal
    /// to the processor.
    #[error("buffer error: {0}")]
    Buffer(#[from] tally_buffer::Error),
    /// A record could not be encoded for staging
    #[error("record encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The bucket layout for numeric measurements is invalid
    #[error("aggregation error: {0}")]
    Aggregation(#[from] aggregation::Error),
}

/// Settings of a [`StatsProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Window length
    pub interval: Duration,
    /// Vendor id stamped on every statistic
    pub vendor: String,
    /// Pipeline phase stamped on every statistic
    pub phase: Phase,
    /// Bucket upper bounds for numeric measurements
    pub buckets: Vec<f64>,
    /// Reported view of numeric measurements
    pub mode: AggregationType,
}

impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.window_interval(),
            vendor: config.vendor.clone(),
            phase: config.phase,
            buckets: config.aggregation.buckets.clone(),
            mode: config.aggregation.mode,
        }
    }
}

/// Turns records into windowed statistics.
#[derive(Debug)]
pub struct StatsProcessor<B> {
    metric: Recorder,
    log: Recorder,
    span: Recorder,
    aggregator: MetricAggregator<f64>,
    buffer: B,
    dispatcher: Dispatcher,
    environment: Option<Arc<dyn Environment>>,
    options: Options,
}

impl<B: Buffer> StatsProcessor<B> {
    /// Create a new [`StatsProcessor`] staging into `buffer` and handing
    /// closed windows to `dispatcher`.
    ///
    /// # Errors
    ///
    /// Fails if the window interval is shorter than a millisecond or the
    /// bucket layout is invalid.
    pub fn new(
        options: Options,
        buffer: B,
        dispatcher: Dispatcher,
        environment: Option<Arc<dyn Environment>>,
    ) -> Result<Self, Error> {
        aggregation::Accumulator::new(options.buckets.clone())?;
        let metric = Recorder::new(options.interval)?;
        let aggregator = MetricAggregator::new(metric.interval_ms())?;
        Ok(Self {
            log: Recorder::new(options.interval)?,
            span: Recorder::new(options.interval)?,
            metric,
            aggregator,
            buffer,
            dispatcher,
            environment,
            options,
        })
    }

    fn recorder(&self, signal: Signal) -> &Recorder {
        match signal {
            Signal::Metric => &self.metric,
            Signal::Log => &self.log,
            Signal::Span => &self.span,
        }
    }

    /// The staging buffer.
    #[must_use]
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Process `records` as received at `now`.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch or a record cannot be staged.
    /// Records before the failing one have been fully processed. Measurements
    /// that cannot be aggregated are logged and dropped without failing the
    /// batch.
    pub fn process(&self, now: SystemTime, records: &[Record]) -> Result<(), Error> {
        let now_ms = unix_millis(now).map_err(window::Error::from)?;
        for record in records {
            self.process_one(now, now_ms, record)?;
        }
        Ok(())
    }

    fn process_one(&self, now: SystemTime, now_ms: i64, record: &Record) -> Result<(), Error> {
        let signal = record.signal;
        let recorder = self.recorder(signal);
        let tid = tid::of_record(record, self.environment.as_deref());
        let service = record.service();
        let stats = self.stat_records(record, tid, service);

        let scope = scope(signal, service);
        let payload = serde_json::to_vec(record)?;
        let pile = recorder.record_staged(now, &stats, |interval| {
            self.buffer
                .write(interval, &scope, &payload)
                .map_err(Error::from)
        })?;

        if signal == Signal::Metric && !record.values.is_empty() {
            self.aggregate(now, record);
        }

        if let Some(pile) = pile {
            self.hand_off(signal, &pile, now_ms)?;
        }
        Ok(())
    }

    // A measurement that cannot be aggregated costs only its own values.
    fn aggregate(&self, now: SystemTime, record: &Record) {
        let series = tid::of_series(record, self.environment.as_deref());
        if let Err(err) = self.aggregator.aggregate(
            now,
            series,
            &record.name,
            &record.values,
            &self.options.buckets,
            self.options.mode,
            &record.attributes,
        ) {
            warn!(%err, name = %record.name, series, "dropping measurement");
            counter!("aggregation_failures").increment(1);
        }
    }

    fn stat_records(&self, record: &Record, tid: i64, service: &str) -> Vec<StatRecord> {
        let tags = self
            .environment
            .as_ref()
            .map(|env| env.tags().clone())
            .unwrap_or_default();
        let stat = |tag_name: String, tag_value: &str| StatRecord {
            signal: record.signal,
            signal_name: record.name.clone(),
            tag_name,
            tag_value: tag_value.to_string(),
            service_name: service.to_string(),
            count: 1,
            phase: self.options.phase,
            vendor_id: self.options.vendor.clone(),
            tags: tags.clone(),
        };

        let prefix = record.signal.as_str();
        let mut stats = Vec::with_capacity(
            record.resource.len() + record.scope.len() + record.attributes.len() + 1,
        );
        for (level, attrs) in [
            ("resource", &record.resource),
            ("scope", &record.scope),
            (prefix, &record.attributes),
        ] {
            stats.extend(
                countable(attrs).map(|(k, v)| stat(format!("{level}.{k}"), v.as_str())),
            );
        }
        stats.push(stat(format!("{prefix}.{TID_FIELD}"), &tid.to_string()));
        stats
    }

    fn hand_off(&self, signal: Signal, pile: &Pile, now_ms: i64) -> Result<(), Error> {
        let report = exporter::build_report(signal, pile, now_ms);
        // A refused report is logged and counted by the dispatcher.
        let _ = self.dispatcher.dispatch(report);
        self.release(signal, pile.window_start)
    }

    // Close the staged records of `signal` in the window starting at
    // `interval`. Other signals' scopes in that window are left alone.
    fn release(&self, signal: Signal, interval: i64) -> Result<(), Error> {
        let prefix = scope(signal, "");
        let mut errors = Vec::new();
        for scope in self.buffer.scopes(interval)? {
            if scope.starts_with(&prefix) {
                if let Err(err) = self.buffer.close_interval_scope(interval, &scope) {
                    errors.push(err);
                }
            }
        }
        debug!(%signal, interval, "released staged records");
        tally_buffer::Error::collect(errors)?;
        Ok(())
    }

    /// Close every window that `now` has moved past even though no record
    /// arrived to notice.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch or staged records cannot be
    /// released.
    pub fn tick(&self, now: SystemTime) -> Result<(), Error> {
        let now_ms = unix_millis(now).map_err(window::Error::from)?;
        for signal in Signal::ALL {
            if let Some(pile) = self.recorder(signal).tick(now)? {
                info!(
                    %signal,
                    window_start = pile.window_start,
                    groups = pile.len(),
                    "forced rollover"
                );
                self.hand_off(signal, &pile, now_ms)?;
            }
        }
        Ok(())
    }

    /// Remove and return the numeric aggregations of every window `now` has
    /// moved past.
    ///
    /// # Errors
    ///
    /// Fails if `now` precedes the unix epoch.
    pub fn emit_aggregations(&self, now: SystemTime) -> Result<Vec<ClosedWindow<f64>>, Error> {
        Ok(self.aggregator.emit(now)?)
    }

    /// Hand off every open window regardless of time, then shut the buffer
    /// down. Reports already queued are delivered once the processor, and
    /// with it its [`Dispatcher`], is gone.
    ///
    /// # Errors
    ///
    /// Returns every failure met while releasing staged records or shutting
    /// the buffer down. Every signal is drained even if an earlier one fails.
    pub fn shutdown(self, now: SystemTime) -> Result<(), Error> {
        let now_ms = unix_millis(now).map_err(window::Error::from)?;
        let mut errors = Vec::new();
        for signal in Signal::ALL {
            if let Some(pile) = self.recorder(signal).drain() {
                info!(%signal, window_start = pile.window_start, groups = pile.len(), "draining window");
                match self.hand_off(signal, &pile, now_ms) {
                    Ok(()) => {}
                    Err(Error::Buffer(err)) => errors.push(err),
                    Err(err) => return Err(err),
                }
            }
        }
        if let Err(err) = self.buffer.shutdown() {
            errors.push(err);
        }
        tally_buffer::Error::collect(errors)?;
        Ok(())
    }
}

fn scope(signal: Signal, service: &str) -> String {
    format!("{signal}/{service}")
}

fn countable(attrs: &Attributes) -> impl Iterator<Item = (&String, &String)> {
    attrs
        .iter()
        .filter(|(k, _)| k.as_str() != TID_FIELD && tid::computes_stats_on(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatch::{self, Worker},
        exporter::Sink,
        proto::StatsReport,
        record::SERVICE_NAME_KEY,
        tid::StaticEnvironment,
    };
    use async_trait::async_trait;
    use std::{
        num::NonZeroU32,
        sync::Mutex,
        time::UNIX_EPOCH,
    };
    use tally_buffer::FilesystemBuffer;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Collect {
        reports: Mutex<Vec<StatsReport>>,
    }

    #[async_trait]
    impl Sink for Collect {
        async fn send(&self, report: &StatsReport) -> Result<(), exporter::Error> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct Harness {
        processor: StatsProcessor<FilesystemBuffer>,
        worker: Worker,
        sink: Arc<Collect>,
        dir: TempDir,
    }

    fn harness(capacity: usize) -> Harness {
        harness_with(capacity, Duration::from_secs(10))
    }

    fn harness_with(capacity: usize, interval: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collect::default());
        let (dispatcher, worker) = dispatch::queue(
            Arc::clone(&sink) as Arc<dyn Sink>,
            capacity,
            NonZeroU32::new(1).unwrap(),
        );
        let options = Options {
            interval,
            vendor: "tally".to_string(),
            phase: Phase::Pre,
            buckets: vec![10.0],
            mode: AggregationType::Sum,
        };
        let processor =
            StatsProcessor::new(options, FilesystemBuffer::new(dir.path()), dispatcher, None)
                .unwrap();
        Harness {
            processor,
            worker,
            sink,
            dir,
        }
    }

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    fn request(status: &str) -> Record {
        Record {
            signal: Signal::Metric,
            name: "http.requests".to_string(),
            service_name: String::new(),
            resource: [(SERVICE_NAME_KEY.to_string(), "checkout".to_string())]
                .into_iter()
                .collect(),
            scope: Attributes::default(),
            attributes: [("status_code".to_string(), status.to_string())]
                .into_iter()
                .collect(),
            timestamp_ms: 0,
            values: Vec::new(),
        }
    }

    fn find<'a>(report: &'a StatsReport, tag_name: &str) -> &'a crate::proto::Stat {
        report
            .stats
            .iter()
            .find(|s| s.tag_name == tag_name)
            .unwrap()
    }

    async fn finish(h: Harness, now: SystemTime) -> Vec<StatsReport> {
        h.processor.shutdown(now).unwrap();
        h.worker.run().await;
        h.sink.reports.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn counts_and_estimates_per_attribute() {
        let h = harness(16);
        h.processor
            .process(at(1_000), &[request("200"), request("200"), request("404")])
            .unwrap();
        h.processor.tick(at(11_000)).unwrap();

        let reports = finish(h, at(12_000)).await;
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.signal, "metric");
        assert_eq!(report.window_start, 0);

        let status = find(report, "metric.status_code");
        assert_eq!(status.count, 3);
        assert!((status.cardinality_estimate - 2.0).abs() < 0.5);
        assert_eq!(status.service_name, "checkout");
        assert_eq!(status.signal_name, "http.requests");

        let service = find(report, "resource.service.name");
        assert_eq!(service.count, 3);
        assert!((service.cardinality_estimate - 1.0).abs() < 0.5);

        let tids = find(report, &format!("metric.{TID_FIELD}"));
        assert_eq!(tids.count, 3);
        assert!((tids.cardinality_estimate - 2.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn internal_attributes_are_not_counted() {
        let h = harness(16);
        let mut record = request("200");
        record
            .attributes
            .insert("_fingerprint".to_string(), "abc".to_string());
        record
            .attributes
            .insert(TID_FIELD.to_string(), "spoofed".to_string());
        h.processor.process(at(1_000), &[record]).unwrap();

        let reports = finish(h, at(2_000)).await;
        assert_eq!(reports.len(), 1);
        let tags: Vec<&str> = reports[0].stats.iter().map(|s| s.tag_name.as_str()).collect();
        assert!(!tags.contains(&"metric._fingerprint"));
        assert_eq!(
            tags.iter()
                .filter(|t| **t == format!("metric.{TID_FIELD}"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn rollover_releases_staged_records() {
        let h = harness(16);
        h.processor.process(at(1_000), &[request("200")]).unwrap();

        let mut replayed = Vec::new();
        h.processor
            .buffer()
            .for_each(0, "metric/checkout", &mut |payload| {
                replayed.push(serde_json::from_slice::<Record>(payload).unwrap());
            })
            .unwrap();
        assert_eq!(replayed, vec![request("200")]);

        h.processor.process(at(12_000), &[request("404")]).unwrap();
        let intervals = h.processor.buffer().intervals().unwrap();
        assert!(!intervals.contains(&0));
        assert!(intervals.contains(&10_000));

        let reports = finish(h, at(13_000)).await;
        assert_eq!(reports.len(), 2);
        let mut windows: Vec<i64> = reports.iter().map(|r| r.window_start).collect();
        windows.sort_unstable();
        assert_eq!(windows, vec![0, 10_000]);
    }

    #[tokio::test]
    async fn signals_release_independently() {
        let h = harness(16);
        let mut log = request("200");
        log.signal = Signal::Log;
        h.processor
            .process(at(1_000), &[request("200"), log])
            .unwrap();
        h.processor.process(at(11_000), &[request("500")]).unwrap();

        // The metric window closed, the log window is still open.
        let scopes = h.processor.buffer().scopes(0).unwrap();
        assert!(scopes.contains("log/checkout"));
        assert!(!scopes.contains("metric/checkout"));

        let reports = finish(h, at(12_000)).await;
        assert_eq!(reports.len(), 3);
    }

    #[tokio::test]
    async fn full_queue_still_releases_records() {
        let h = harness(1);
        h.processor.process(at(1_000), &[request("200")]).unwrap();
        h.processor.process(at(11_000), &[request("200")]).unwrap();
        h.processor.process(at(21_000), &[request("200")]).unwrap();

        let intervals = h.processor.buffer().intervals().unwrap();
        assert_eq!(intervals.len(), 1);
        assert!(intervals.contains(&20_000));

        // One report fits the queue, the second and the drained third are
        // dropped.
        let reports = finish(h, at(22_000)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].window_start, 0);
    }

    #[tokio::test]
    async fn shutdown_leaves_no_staged_records() {
        let dir_files = |h: &Harness| std::fs::read_dir(h.dir.path()).unwrap().count();
        let h = harness(16);
        h.processor
            .process(at(1_000), &[request("200"), request("404")])
            .unwrap();
        assert_eq!(dir_files(&h), 1);
        let path = h.dir.path().to_path_buf();
        // Keep the temp dir alive past `finish`, which consumes the harness.
        let Harness { processor, worker, sink, dir } = h;
        let h = Harness { processor, worker, sink, dir: TempDir::new().unwrap() };
        let reports = finish(h, at(2_000)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(std::fs::read_dir(path).unwrap().count(), 0);
        drop(dir);
    }

    #[test]
    fn buffer_is_unusable_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let buffer = FilesystemBuffer::new(dir.path());
        buffer.shutdown().unwrap();
        let (dispatcher, _worker) = dispatch::queue(
            Arc::new(Collect::default()),
            4,
            NonZeroU32::new(1).unwrap(),
        );
        let processor = StatsProcessor::new(
            Options {
                interval: Duration::from_secs(1),
                vendor: "tally".to_string(),
                phase: Phase::Post,
                buckets: vec![1.0],
                mode: AggregationType::Avg,
            },
            buffer,
            dispatcher,
            None,
        )
        .unwrap();
        let err = processor.process(at(0), &[request("200")]).unwrap_err();
        assert!(matches!(err, Error::Buffer(tally_buffer::Error::Shutdown)));
    }

    #[tokio::test]
    async fn measurements_are_aggregated_per_series() {
        let h = harness(16);
        let mut a = request("200");
        a.values = vec![1.0, 2.0, 3.0];
        let mut b = request("200");
        b.values = vec![4.0];
        let mut c = request("500");
        c.values = vec![100.0];
        h.processor.process(at(1_000), &[a, b, c]).unwrap();

        assert!(h.processor.emit_aggregations(at(5_000)).unwrap().is_empty());
        let closed = h.processor.emit_aggregations(at(10_000)).unwrap();
        assert_eq!(closed.len(), 1);
        let windows = &closed[0].aggregations;
        assert_eq!(windows.len(), 2);
        let mut sums: Vec<Vec<f64>> = windows.values().map(aggregation::Aggregation::value).collect();
        sums.sort_by(|x, y| x[0].total_cmp(&y[0]));
        assert_eq!(sums, vec![vec![10.0], vec![100.0]]);
        let _ = finish(h, at(11_000)).await;
    }

    #[tokio::test]
    async fn metrics_sharing_attributes_aggregate_apart() {
        let h = harness(16);
        let mut requests = request("200");
        requests.values = vec![1.0];
        let mut latency = request("200");
        latency.name = "http.latency".to_string();
        latency.values = vec![5.0];
        let mut more_requests = request("200");
        more_requests.values = vec![2.0];
        h.processor
            .process(at(1_000), &[requests, latency, more_requests])
            .unwrap();

        let closed = h.processor.emit_aggregations(at(10_000)).unwrap();
        assert_eq!(closed.len(), 1);
        let mut series: Vec<(String, Vec<f64>)> = closed[0]
            .aggregations
            .values()
            .map(|a| (a.name().to_string(), a.value()))
            .collect();
        series.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            series,
            vec![
                ("http.latency".to_string(), vec![5.0]),
                ("http.requests".to_string(), vec![3.0]),
            ]
        );

        // Every record of the batch made it into the statistics.
        let reports = finish(h, at(11_000)).await;
        assert_eq!(reports.len(), 1);
        let tid_tag = format!("metric.{TID_FIELD}");
        let observed: i64 = reports[0]
            .stats
            .iter()
            .filter(|s| s.tag_name == tid_tag)
            .map(|s| s.count)
            .sum();
        assert_eq!(observed, 3);
        let names: Vec<&str> = reports[0]
            .stats
            .iter()
            .filter(|s| s.tag_name == "metric.status_code")
            .map(|s| s.signal_name.as_str())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"http.latency"));
    }

    #[tokio::test]
    async fn concurrent_processing_releases_every_staged_record() {
        let h = harness_with(1_024, Duration::from_millis(10));
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let processor = &h.processor;
                s.spawn(move || {
                    for i in 0..50u64 {
                        let ms = 1_000 + i * 7 + t * 3;
                        processor
                            .process(at(ms), &[request(&t.to_string())])
                            .unwrap();
                    }
                });
            }
        });
        h.processor.tick(at(100_000)).unwrap();
        assert!(h.processor.buffer().intervals().unwrap().is_empty());

        let reports = finish(h, at(100_000)).await;
        let observed: i64 = reports
            .iter()
            .map(|r| find(r, &format!("metric.{TID_FIELD}")).count)
            .sum();
        assert_eq!(observed, 200);
    }

    #[tokio::test]
    async fn environment_tags_change_tids_and_ride_along() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collect::default());
        let (dispatcher, worker) = dispatch::queue(
            Arc::clone(&sink) as Arc<dyn Sink>,
            4,
            NonZeroU32::new(1).unwrap(),
        );
        let env: Arc<dyn Environment> = Arc::new(StaticEnvironment::new(
            [("cluster".to_string(), "prod".to_string())]
                .into_iter()
                .collect(),
        ));
        let processor = StatsProcessor::new(
            Options {
                interval: Duration::from_secs(10),
                vendor: "acme".to_string(),
                phase: Phase::Post,
                buckets: vec![1.0],
                mode: AggregationType::Sum,
            },
            FilesystemBuffer::new(dir.path()),
            dispatcher,
            Some(env),
        )
        .unwrap();
        processor.process(at(1_000), &[request("200")]).unwrap();
        processor.shutdown(at(2_000)).unwrap();
        worker.run().await;

        let reports = sink.reports.lock().unwrap();
        let stat = find(&reports[0], "metric.status_code");
        assert_eq!(stat.vendor_id, "acme");
        assert_eq!(stat.phase, "post");
        assert_eq!(stat.tags.get("cluster").map(String::as_str), Some("prod"));
    }
}

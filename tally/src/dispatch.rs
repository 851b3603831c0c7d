//! Background delivery of reports.
//!
//! Accumulation must never wait on the network. Closed windows are handed to
//! a [`Dispatcher`], which places them on a bounded queue without blocking. A
//! single [`Worker`] drains the queue and delivers each report to a
//! [`Sink`] on its own task, at most `workers` deliveries in flight.
//!
//! Delivery is fire-and-forget. A report that cannot be queued because the
//! queue is full is dropped, a report the sink rejects is logged and dropped.
//! Neither is retried.
//!
//! Shutdown is by channel closure: once every [`Dispatcher`] is dropped the
//! worker delivers whatever is still queued, waits for in-flight deliveries
//! and returns.
//!
//! ## Metrics
//!
//! `piles_emitted`: Reports accepted onto the queue
//! `pile_groups_emitted`: Stats carried by accepted reports
//! `pile_dispatch_dropped`: Reports dropped because the queue was full
//!

use std::{num::NonZeroU32, sync::Arc};

use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::{exporter::Sink, proto::StatsReport};

/// Errors produced by [`Dispatcher`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The queue is full, the report was dropped
    #[error("dispatch queue full, report dropped")]
    Full,
    /// The worker has gone away, the report was dropped
    #[error("dispatch worker stopped, report dropped")]
    Closed,
}

/// The enqueueing half of the dispatch queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<StatsReport>,
}

/// The delivering half of the dispatch queue.
#[derive(Debug)]
pub struct Worker {
    receiver: mpsc::Receiver<StatsReport>,
    sink: Arc<dyn Sink>,
    semaphore: Arc<Semaphore>,
    workers: NonZeroU32,
}

/// Create a dispatch queue holding up to `capacity` reports, delivered to
/// `sink` with at most `workers` deliveries in flight.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn queue(sink: Arc<dyn Sink>, capacity: usize, workers: NonZeroU32) -> (Dispatcher, Worker) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        Dispatcher { sender },
        Worker {
            receiver,
            sink,
            semaphore: Arc::new(Semaphore::new(workers.get() as usize)),
            workers,
        },
    )
}

impl Dispatcher {
    /// Enqueue `report` for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the queue is full or the worker has stopped. The report is
    /// dropped in either case.
    pub fn dispatch(&self, report: StatsReport) -> Result<(), Error> {
        let window_start = report.window_start;
        let groups = report.stats.len() as u64;
        let signal = report.signal.clone();
        match self.sender.try_send(report) {
            Ok(()) => {
                info!(%signal, window_start, groups, "dispatching pile");
                counter!("piles_emitted").increment(1);
                counter!("pile_groups_emitted").increment(groups);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%signal, window_start, groups, "dispatch queue full, dropping pile");
                counter!("pile_dispatch_dropped").increment(1);
                Err(Error::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%signal, window_start, groups, "dispatch worker stopped, dropping pile");
                counter!("pile_dispatch_dropped").increment(1);
                Err(Error::Closed)
            }
        }
    }
}

impl Worker {
    /// Deliver reports until every [`Dispatcher`] is dropped and the queue is
    /// empty, then wait for in-flight deliveries to finish.
    pub async fn run(mut self) {
        while let Some(report) = self.receiver.recv().await {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                error!("dispatch semaphore closed");
                return;
            };
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move {
                match sink.send(&report).await {
                    Ok(()) => debug!(
                        signal = %report.signal,
                        window_start = report.window_start,
                        "pile delivered"
                    ),
                    Err(err) => error!(
                        signal = %report.signal,
                        window_start = report.window_start,
                        %err,
                        "flush failed, window dropped"
                    ),
                }
                drop(permit);
            });
        }
        info!("dispatch queue closed, waiting for in-flight deliveries");
        // Holding every permit means no delivery is outstanding.
        let _permit = self.semaphore.acquire_many(self.workers.get()).await;
    }
}

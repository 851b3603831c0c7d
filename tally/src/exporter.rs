//! Report construction and delivery.
//!
//! A closed window's [`Pile`] is converted into a [`proto::StatsReport`] and
//! delivered to a [`Sink`]. The production sink, [`HttpExporter`], POSTs the
//! protobuf encoding to `<endpoint>/api/v1/<signal>stats`.
//!
//! ## Metrics
//!
//! `report_sent`: Reports accepted by the intake
//! `report_failure`: Reports the intake rejected or that failed in transit
//! `report_groups_skipped`: Malformed groups left out of a report
//!

use std::{fmt, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use prost::Message;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::{proto, record::Signal, sketch::SketchGroup, window::Pile};

const PROTOBUF: &str = "application/x-protobuf";

/// Errors produced by [`Sink`] implementations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The HTTP client failed
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// The intake answered with a status other than 200 or 202
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// Status code returned
        status: u16,
        /// Response body, possibly empty
        body: String,
    },
}

/// A destination for reports.
#[async_trait]
pub trait Sink: Send + Sync + fmt::Debug {
    /// Deliver `report`.
    ///
    /// # Errors
    ///
    /// Fails if the report could not be delivered. Implementations do not
    /// retry.
    async fn send(&self, report: &proto::StatsReport) -> Result<(), Error>;
}

/// Convert `pile`, a closed window of `signal`, into a report stamped with
/// `submitted_at`.
///
/// Groups with no observed values or a non-positive count are malformed and
/// left out with a warning. The remaining stats are ordered by signal name,
/// tag name then service name.
#[must_use]
pub fn build_report(signal: Signal, pile: &Pile, submitted_at: i64) -> proto::StatsReport {
    let mut stats: Vec<proto::Stat> = pile
        .iter()
        .filter_map(|group| {
            if group.sketch().is_empty() || group.count() <= 0 {
                warn!(
                    signal_name = %group.signal_name,
                    tag_name = %group.tag_name,
                    service_name = %group.service_name,
                    count = group.count(),
                    "skipping malformed group"
                );
                counter!("report_groups_skipped").increment(1);
                return None;
            }
            Some(stat(group))
        })
        .collect();
    stats.sort_by(|a, b| {
        (&a.signal_name, &a.tag_name, &a.service_name).cmp(&(
            &b.signal_name,
            &b.tag_name,
            &b.service_name,
        ))
    });

    proto::StatsReport {
        submitted_at,
        signal: signal.as_str().to_string(),
        stats,
        window_start: pile.window_start,
    }
}

fn stat(group: &SketchGroup) -> proto::Stat {
    proto::Stat {
        signal_name: group.signal_name.clone(),
        service_name: group.service_name.clone(),
        tag_name: group.tag_name.clone(),
        phase: group.phase.as_str().to_string(),
        count: group.count(),
        vendor_id: group.vendor_id.clone(),
        cardinality_estimate: group.estimate_cardinality(),
        sketch: group.serialize(),
        tags: group
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// A [`Sink`] posting reports over HTTP.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExporter {
    /// Create a new [`HttpExporter`] posting below `endpoint`, every request
    /// bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint: String = endpoint.into();
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// The URL reports of `signal` are posted to.
    #[must_use]
    pub fn url(&self, signal: &str) -> String {
        format!("{}/api/v1/{signal}stats", self.endpoint)
    }
}

#[async_trait]
impl Sink for HttpExporter {
    async fn send(&self, report: &proto::StatsReport) -> Result<(), Error> {
        let url = self.url(&report.signal);
        let labels = vec![("signal".to_string(), report.signal.clone())];

        let response = match self
            .client
            .post(&url)
            .header(CONTENT_TYPE, PROTOBUF)
            .body(report.encode_to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                counter!("report_failure", &labels).increment(1);
                return Err(err.into());
            }
        };

        let status = response.status().as_u16();
        match status {
            200 | 202 => {
                debug!(%url, status, stats = report.stats.len(), "report accepted");
                counter!("report_sent", &labels).increment(1);
                Ok(())
            }
            status => {
                counter!("report_failure", &labels).increment(1);
                let body = response.text().await.unwrap_or_default();
                Err(Error::UnexpectedStatus { status, body })
            }
        }
    }
}

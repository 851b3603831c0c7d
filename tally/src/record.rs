//! The canonical record shape handed to tally by ingestion adapters.
//!
//! Adapters convert vendor wire payloads into [`Record`]. tally does not care
//! where a record came from, only which signal it belongs to and which
//! attributes it carries at the resource, scope and record level.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// An attribute set, key to stringified value.
pub type Attributes = FxHashMap<String, String>;

/// Resource attribute naming the emitting service.
pub const SERVICE_NAME_KEY: &str = "service.name";

/// Service name used when a record names none.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// The kind of telemetry a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// A metric data point
    Metric,
    /// A log line
    Log,
    /// A trace span
    Span,
}

impl Signal {
    /// All signals, in a stable order.
    pub const ALL: [Signal; 3] = [Signal::Metric, Signal::Log, Signal::Span];

    /// The prefix record-level attributes are namespaced with.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Metric => "metric",
            Signal::Log => "log",
            Signal::Span => "span",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested telemetry record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Record {
    /// The signal this record belongs to
    pub signal: Signal,
    /// The metric name, log fingerprint or span name
    pub name: String,
    /// The emitting service. When empty the resource's `service.name` is used.
    #[serde(default)]
    pub service_name: String,
    /// Resource level attributes
    #[serde(default)]
    pub resource: Attributes,
    /// Scope level attributes
    #[serde(default)]
    pub scope: Attributes,
    /// Record level attributes
    #[serde(default)]
    pub attributes: Attributes,
    /// Event time, milliseconds since the unix epoch
    #[serde(default)]
    pub timestamp_ms: i64,
    /// Numeric measurements carried by a metric data point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
}

impl Record {
    /// The service this record is attributed to.
    #[must_use]
    pub fn service(&self) -> &str {
        if !self.service_name.is_empty() {
            return &self.service_name;
        }
        self.resource
            .get(SERVICE_NAME_KEY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SERVICE)
    }
}

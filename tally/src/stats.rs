//! Statistic records and their grouping.
//!
//! A [`StatRecord`] is produced once per attribute of every ingested record.
//! Records that agree on signal name, tag name, service, phase and vendor
//! share a group and accumulate into the same sketch. The tag value is
//! deliberately not part of the group, it is the dimension being counted.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::record::{Attributes, Signal};

/// Where in the pipeline statistics were taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before enrichment
    #[default]
    Pre,
    /// After enrichment
    Post,
}

impl Phase {
    /// Wire name of this phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of one attribute on one record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    /// Signal the observation came from
    pub signal: Signal,
    /// Metric name, log fingerprint or span name
    pub signal_name: String,
    /// Namespaced attribute key, e.g. `metric.status_code`
    pub tag_name: String,
    /// The attribute's value, the dimension whose cardinality is estimated
    pub tag_value: String,
    /// Emitting service
    pub service_name: String,
    /// Number of records this observation stands for
    pub count: i64,
    /// Pipeline phase
    pub phase: Phase,
    /// Vendor identifier
    pub vendor_id: String,
    /// Enrichment tags carried with the group
    pub tags: Attributes,
}

impl StatRecord {
    /// Hash of the fields that define this record's group.
    #[must_use]
    pub fn group_key(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for field in [
            self.signal.as_str(),
            self.signal_name.as_str(),
            self.tag_name.as_str(),
            self.service_name.as_str(),
            self.phase.as_str(),
            self.vendor_id.as_str(),
        ] {
            // Length prefix each field so ("ab", "c") and ("a", "bc") differ.
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.digest()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sketch::SketchGroup;

    pub(crate) fn stat(tag_name: &str, tag_value: &str) -> StatRecord {
        StatRecord {
            signal: Signal::Metric,
            signal_name: "http.requests".to_string(),
            tag_name: tag_name.to_string(),
            tag_value: tag_value.to_string(),
            service_name: "checkout".to_string(),
            count: 1,
            phase: Phase::Pre,
            vendor_id: "tally".to_string(),
            tags: Attributes::default(),
        }
    }

    #[test]
    fn tag_value_does_not_affect_group() {
        let a = stat("metric.status_code", "200");
        let b = stat("metric.status_code", "404");
        assert_eq!(a.group_key(), b.group_key());
        assert!(SketchGroup::new(&a).matches(&b));
    }

    #[test]
    fn group_fields_affect_group() {
        let base = stat("metric.status_code", "200");

        let mut other = base.clone();
        other.tag_name = "metric.method".to_string();
        assert_ne!(base.group_key(), other.group_key());
        assert!(!SketchGroup::new(&base).matches(&other));

        let mut other = base.clone();
        other.phase = Phase::Post;
        assert_ne!(base.group_key(), other.group_key());

        let mut other = base.clone();
        other.signal = Signal::Log;
        assert_ne!(base.group_key(), other.group_key());

        let mut other = base.clone();
        other.vendor_id = "other".to_string();
        assert_ne!(base.group_key(), other.group_key());
    }

    #[test]
    fn field_boundaries_matter() {
        let mut a = stat("ab", "x");
        a.service_name = "c".to_string();
        let mut b = stat("a", "x");
        b.service_name = "bc".to_string();
        assert_ne!(a.group_key(), b.group_key());
    }
}

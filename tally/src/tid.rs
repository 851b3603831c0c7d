//! Tag identity hashing.
//!
//! A tag identity, or TID, is a 64-bit hash of an attribute set. Two attribute
//! sets with the same namespaced (key, value) content always hash to the same
//! TID regardless of iteration order. The TID is an identity, not a secret;
//! collisions are tolerated.
//!
//! Attributes are namespaced before hashing: resource attributes under
//! `resource.`, scope attributes under `scope.`, record attributes under the
//! caller's prefix and environment tags under `env.`. Keys starting with
//! [`INTERNAL_MARKER`] are pipeline-internal and never hashed. Pairs with an
//! empty value are dropped. The remaining pairs are sorted by key and joined as
//! `k1:v1:k2:v2:...` before hashing with xxh64.

use std::{collections::BTreeMap, fmt};

use rustc_hash::FxHashMap;
use xxhash_rust::xxh64::xxh64;

use crate::record::{Attributes, Record};

/// Leading character of pipeline-internal attribute keys.
pub const INTERNAL_MARKER: char = '_';

/// The internal attribute carrying a record's TID. Statistics are computed on
/// this field even though it is internal.
pub const TID_FIELD: &str = "_tally.tid";

/// A source of deployment-wide tags, folded into every TID under `env.`.
pub trait Environment: Send + Sync + fmt::Debug {
    /// The environment's tags.
    fn tags(&self) -> &FxHashMap<String, String>;
}

/// An [`Environment`] with a fixed tag set, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    tags: FxHashMap<String, String>,
}

impl StaticEnvironment {
    /// Create a new [`StaticEnvironment`].
    #[must_use]
    pub fn new(tags: FxHashMap<String, String>) -> Self {
        Self { tags }
    }
}

impl Environment for StaticEnvironment {
    fn tags(&self) -> &FxHashMap<String, String> {
        &self.tags
    }
}

/// Whether `key` names an internal attribute.
#[must_use]
pub fn is_internal(key: &str) -> bool {
    key.starts_with(INTERNAL_MARKER)
}

/// Whether per-field statistics are computed for `key`.
#[must_use]
pub fn computes_stats_on(key: &str) -> bool {
    key == TID_FIELD || !is_internal(key)
}

/// Compute the TID of an attribute set.
///
/// `extra` is merged in as-is, without namespacing or internal filtering.
/// A missing `environment` contributes no tags.
#[must_use]
pub fn compute(
    extra: &Attributes,
    resource: &Attributes,
    scope: &Attributes,
    attributes: &Attributes,
    prefix: &str,
    environment: Option<&dyn Environment>,
) -> i64 {
    let mut tags: BTreeMap<String, &str> = extra
        .iter()
        .map(|(k, v)| (k.clone(), v.as_str()))
        .collect();
    add_keys(resource, "resource", &mut tags);
    add_keys(scope, "scope", &mut tags);
    add_keys(attributes, prefix, &mut tags);
    if let Some(environment) = environment {
        for (k, v) in environment.tags() {
            tags.insert(format!("env.{k}"), v.as_str());
        }
    }
    hash_tags(&tags)
}

/// Compute the TID of a [`Record`], namespacing its record-level attributes
/// by its signal.
#[must_use]
pub fn of_record(record: &Record, environment: Option<&dyn Environment>) -> i64 {
    compute(
        &Attributes::default(),
        &record.resource,
        &record.scope,
        &record.attributes,
        record.signal.as_str(),
        environment,
    )
}

/// Key of the `extra` tag naming a metric in [`of_series`].
pub const SERIES_NAME_KEY: &str = "name";

/// Compute the identity of the numeric series a metric [`Record`] belongs to.
/// Unlike [`of_record`] this also covers the metric name, so two metrics
/// sharing an attribute set are separate series.
#[must_use]
pub fn of_series(record: &Record, environment: Option<&dyn Environment>) -> i64 {
    let extra: Attributes = [(SERIES_NAME_KEY.to_string(), record.name.clone())]
        .into_iter()
        .collect();
    compute(
        &extra,
        &record.resource,
        &record.scope,
        &record.attributes,
        record.signal.as_str(),
        environment,
    )
}

fn add_keys<'a>(attrs: &'a Attributes, prefix: &str, tags: &mut BTreeMap<String, &'a str>) {
    for (k, v) in attrs {
        if !is_internal(k) {
            tags.insert(format!("{prefix}.{k}"), v.as_str());
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn hash_tags(tags: &BTreeMap<String, &str>) -> i64 {
    let mut joined = String::new();
    for (k, v) in tags.iter().filter(|(_, v)| !v.is_empty()) {
        if !joined.is_empty() {
            joined.push(':');
        }
        joined.push_str(k);
        joined.push(':');
        joined.push_str(v);
    }
    xxh64(joined.as_bytes(), 0) as i64
}

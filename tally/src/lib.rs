//! Windowed cardinality statistics for telemetry streams.
//!
//! tally sits in a telemetry pipeline and, rather than forwarding every raw
//! metric, log or span record, summarizes the stream per signal name and per
//! attribute: how many records were seen and approximately how many distinct
//! values each attribute took. Summaries are accumulated in fixed,
//! non-overlapping time windows and shipped to a backend once a window closes.
//! Raw records are staged on disk through [`tally_buffer`] until their window
//! is handed off.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::cargo_common_metadata)]

pub mod aggregation;
pub mod config;
pub mod dispatch;
pub mod exporter;
pub mod processor;
pub mod proto;
pub mod record;
pub mod sketch;
pub mod stats;
pub mod tid;
pub mod window;

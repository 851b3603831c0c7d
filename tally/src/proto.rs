//! Protobuf messages of the egress report.
//!
//! Field numbers are part of the wire contract with the intake; never reuse
//! or renumber them.

#![allow(clippy::pedantic)]
#![allow(missing_docs)]

/// A report of every group of one closed window of one signal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatsReport {
    /// Submission time, milliseconds since the unix epoch
    #[prost(int64, tag = "1")]
    pub submitted_at: i64,
    /// Signal the report covers: `metric`, `log` or `span`
    #[prost(string, tag = "2")]
    pub signal: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub stats: ::prost::alloc::vec::Vec<Stat>,
    /// Start of the reported window, milliseconds since the unix epoch
    #[prost(int64, tag = "4")]
    pub window_start: i64,
}

/// The statistics of one group.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub signal_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub tag_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub phase: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub count: i64,
    #[prost(string, tag = "6")]
    pub vendor_id: ::prost::alloc::string::String,
    #[prost(double, tag = "7")]
    pub cardinality_estimate: f64,
    /// Compact HyperLogLog encoding
    #[prost(bytes = "vec", tag = "8")]
    pub sketch: ::prost::alloc::vec::Vec<u8>,
    #[prost(map = "string, string", tag = "9")]
    pub tags: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

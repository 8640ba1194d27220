//! Pick the quantity to report for each record and sum them.

use crate::record::{MetricRecord, ResourceQuantity};

#[derive(clap::ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ValuationMode {
    /// live usage from the metrics API
    Usage,
    /// declared requests of the current replicas
    #[default]
    Requests,
    /// requests once scaled to the autoscaler maximum
    MaxRequests,
}

/// The quantity of `record` reported under `mode`.
///
/// Without scaling headroom the max-requests value is the requests value, so a
/// workload that can not scale never reports an inflated (or empty) maximum.
pub fn select(record: &MetricRecord, mode: ValuationMode) -> ResourceQuantity {
    match mode {
        ValuationMode::Usage => record.usage,
        ValuationMode::Requests => record.requests,
        ValuationMode::MaxRequests if record.has_scaling_headroom() => record.max_requests,
        ValuationMode::MaxRequests => record.requests,
    }
}

/// Text of the REPLICAS column.
pub fn replicas_label(record: &MetricRecord, mode: ValuationMode) -> String {
    match mode {
        ValuationMode::MaxRequests => record.max_replicas.to_string(),
        _ => format!("{}/{}", record.current_replicas, record.max_replicas),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow<'a> {
    pub record: &'a MetricRecord,
    pub selected: ResourceQuantity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rollup<'a> {
    pub rows: Vec<RollupRow<'a>>,
    pub total: ResourceQuantity,
}

pub fn rollup(records: &[MetricRecord], mode: ValuationMode) -> Rollup<'_> {
    let rows = records
        .iter()
        .map(|record| RollupRow {
            record,
            selected: select(record, mode),
        })
        .collect::<Vec<_>>();
    let total = rows.iter().map(|row| row.selected).sum();
    Rollup { rows, total }
}

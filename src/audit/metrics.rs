//! Metrics aggregation over the audit log.
//!
//! Pure function of the entries handed in: throughput buckets, latency
//! percentiles joined start-to-end by request id, tool usage, error rate and
//! an event-kind histogram. Nothing is cached or persisted.

use crate::audit::{AuditEntry, AuditEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Bucket width used for the throughput series, in seconds.
    pub window_seconds: u64,
    pub requests: u64,
    pub throughput: Vec<ThroughputBucket>,
    pub latency: LatencySummary,
    pub tool_usage: BTreeMap<String, u64>,
    /// policy blocks / requests started.
    pub error_rate: f64,
    pub events: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputBucket {
    pub bucket_start: DateTime<Utc>,
    pub requests: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Completed requests the percentiles are computed from.
    pub samples: u64,
    pub p50_seconds: f64,
    pub p95_seconds: f64,
    pub p99_seconds: f64,
}

/// Aggregate `entries` (append order) into a report, bucketing throughput by
/// `window_seconds`.
pub fn aggregate(entries: &[AuditEntry], window_seconds: u64) -> MetricsReport {
    let window_seconds = window_seconds.max(1);
    let mut starts: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let mut durations: Vec<f64> = Vec::new();
    let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
    let mut tool_usage: BTreeMap<String, u64> = BTreeMap::new();
    let mut events: BTreeMap<String, u64> = BTreeMap::new();
    let mut requests = 0u64;
    let mut blocks = 0u64;

    for entry in entries {
        *events.entry(entry.event.as_str().to_string()).or_insert(0) += 1;
        match entry.event {
            AuditEvent::RequestStart => {
                requests += 1;
                starts.insert(entry.request_id, entry.ts);
                let bucket = entry.ts.timestamp().div_euclid(window_seconds as i64);
                *buckets.entry(bucket).or_insert(0) += 1;
            }
            AuditEvent::RequestEnd => {
                if let Some(start) = starts.get(&entry.request_id) {
                    let duration = (entry.ts - *start).num_microseconds().unwrap_or(0);
                    durations.push(duration as f64 / 1_000_000.0);
                }
            }
            AuditEvent::ToolCall => {
                if let Some(tool) = entry.detail.get("tool").and_then(|v| v.as_str()) {
                    *tool_usage.entry(tool.to_string()).or_insert(0) += 1;
                }
            }
            AuditEvent::PolicyBlock => blocks += 1,
            AuditEvent::ToolResult => {}
        }
    }

    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let latency = LatencySummary {
        samples: durations.len() as u64,
        p50_seconds: percentile(&durations, 50.0),
        p95_seconds: percentile(&durations, 95.0),
        p99_seconds: percentile(&durations, 99.0),
    };

    let throughput = buckets
        .into_iter()
        .map(|(bucket, count)| ThroughputBucket {
            bucket_start: DateTime::from_timestamp(bucket * window_seconds as i64, 0)
                .unwrap_or_default(),
            requests: count,
        })
        .collect();

    MetricsReport {
        window_seconds,
        requests,
        throughput,
        latency,
        tool_usage,
        error_rate: if requests > 0 {
            blocks as f64 / requests as f64
        } else {
            0.0
        },
        events,
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

//! Security-alert heuristics derived from the audit log.
//!
//! Alerts are recomputed on demand from the entries handed in; nothing here
//! is persisted.

use crate::audit::{AuditEntry, AuditEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Denials within this window from one request trip `burst_denial`.
const BURST_THRESHOLD: usize = 5;
const BURST_WINDOW_SECS: i64 = 60;
/// Identical (tool, reason) denials across the whole log trip `repeated_denial`.
const REPEAT_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PathTraversal,
    SqlInjection,
    BurstDenial,
    RepeatedDenial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    pub message: String,
}

/// Scan audit entries (append order) and produce the derived alerts,
/// most severe first.
pub fn scan(entries: &[AuditEntry]) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let mut block_times: HashMap<Uuid, Vec<DateTime<Utc>>> = HashMap::new();
    let mut burst_flagged: HashMap<Uuid, bool> = HashMap::new();
    let mut repeat_counts: HashMap<(String, String), (usize, DateTime<Utc>)> = HashMap::new();

    for entry in entries {
        match entry.event {
            AuditEvent::PolicyBlock => {
                if let Some(alert) = path_traversal_alert(entry) {
                    alerts.push(alert);
                }

                let times = block_times.entry(entry.request_id).or_default();
                times.push(entry.ts);
                let window_start = entry.ts - Duration::seconds(BURST_WINDOW_SECS);
                times.retain(|t| *t >= window_start);
                let flagged = burst_flagged.entry(entry.request_id).or_insert(false);
                if times.len() >= BURST_THRESHOLD && !*flagged {
                    *flagged = true;
                    alerts.push(Alert {
                        kind: AlertKind::BurstDenial,
                        severity: Severity::Medium,
                        request_id: Some(entry.request_id),
                        ts: entry.ts,
                        message: format!(
                            "{} policy blocks within {}s from request {}",
                            times.len(),
                            BURST_WINDOW_SECS,
                            entry.request_id
                        ),
                    });
                }

                let tool = detail_str(entry, "tool").unwrap_or("unknown").to_string();
                let reason = detail_str(entry, "reason").unwrap_or("").to_string();
                let slot = repeat_counts.entry((tool, reason)).or_insert((0, entry.ts));
                slot.0 += 1;
                slot.1 = entry.ts;
            }
            AuditEvent::ToolCall => {
                if let Some(alert) = sql_injection_alert(entry) {
                    alerts.push(alert);
                }
            }
            _ => {}
        }
    }

    for ((tool, reason), (count, ts)) in repeat_counts {
        if count >= REPEAT_THRESHOLD {
            alerts.push(Alert {
                kind: AlertKind::RepeatedDenial,
                severity: Severity::Low,
                request_id: None,
                ts,
                message: format!(
                    "tool '{}' denied {} times for the same reason: {}",
                    tool, count, reason
                ),
            });
        }
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.ts.cmp(&b.ts)));
    alerts
}

fn detail_str<'a>(entry: &'a AuditEntry, key: &str) -> Option<&'a str> {
    entry.detail.get(key).and_then(|v| v.as_str())
}

/// A filesystem or sqlite block means the model reached for a path outside
/// the whitelist; dotted routes get called out explicitly.
fn path_traversal_alert(entry: &AuditEntry) -> Option<Alert> {
    let rule = detail_str(entry, "rule")?;
    if !matches!(rule, "filesystem.read" | "filesystem.write" | "data.sqlite") {
        return None;
    }
    let args = entry
        .detail
        .get("arguments")
        .map(|v| v.to_string())
        .unwrap_or_default();
    let dotted = args.contains("..");
    Some(Alert {
        kind: AlertKind::PathTraversal,
        severity: Severity::High,
        request_id: Some(entry.request_id),
        ts: entry.ts,
        message: if dotted {
            format!("blocked path containing '..' (rule {})", rule)
        } else {
            format!("blocked non-whitelisted path (rule {})", rule)
        },
    })
}

fn sql_injection_alert(entry: &AuditEntry) -> Option<Alert> {
    if detail_str(entry, "tool") != Some("sql_query") {
        return None;
    }
    let query = entry
        .detail
        .get("arguments")
        .and_then(|v| v.get("query"))
        .and_then(|v| v.as_str())?;
    let pattern = injection_pattern(query)?;
    Some(Alert {
        kind: AlertKind::SqlInjection,
        severity: Severity::Critical,
        request_id: Some(entry.request_id),
        ts: entry.ts,
        message: format!("sql_query matched injection pattern: {}", pattern),
    })
}

/// Curated pattern set; matching is case-insensitive on an uppercased copy.
fn injection_pattern(query: &str) -> Option<&'static str> {
    let upper = query.to_uppercase();
    if upper.contains("DROP ") {
        return Some("DROP");
    }
    if upper.contains("ATTACH ") {
        return Some("ATTACH");
    }
    if let Some(at) = upper.find("UNION SELECT") {
        if upper[at..].contains(" FROM ") {
            return Some("UNION SELECT ... FROM");
        }
    }
    // A comment followed by a statement terminator is the classic
    // tail-smuggling shape.
    for opener in ["--", "/*"] {
        if let Some(at) = upper.find(opener) {
            if upper[at..].contains(';') {
                return Some("comment before statement terminator");
            }
        }
    }
    None
}

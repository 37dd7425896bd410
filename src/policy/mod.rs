//! Policy engine: pure decision functions over (action, manifest).
//!
//! Every check returns a [`PolicyDecision`] value; denials are outcomes, not
//! errors. The engine holds one immutable manifest snapshot with the
//! allow-lists pre-compiled, so a manifest reload builds a fresh engine.

pub mod paths;

use crate::error::ManifestError;
use crate::manifest::{Manifest, Outbound, PolicyMode};
use globset::GlobMatcher;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Outcome of one policy check. Pure value: the verdict, a human-readable
/// reason, and the rule that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub reason: String,
    pub rule: String,
}

impl PolicyDecision {
    pub fn allow(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: reason.into(),
            rule: rule.to_string(),
        }
    }

    pub fn deny(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: reason.into(),
            rule: rule.to_string(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Which side of the vector allow-lists a check consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Read,
    Write,
}

pub struct PolicyEngine {
    manifest: Arc<Manifest>,
    allow_read: Vec<paths::AllowEntry>,
    allow_write: Vec<paths::AllowEntry>,
    vector_read: Vec<(String, GlobMatcher)>,
    vector_write: Vec<(String, GlobMatcher)>,
}

impl PolicyEngine {
    /// Compile the manifest's allow-lists. Pattern errors are caught at
    /// manifest load, so failure here means the manifest bypassed `validate`.
    pub fn new(manifest: Arc<Manifest>) -> Result<Self, ManifestError> {
        let compile_list = |entries: &[String], list: &str| {
            entries
                .iter()
                .map(|e| {
                    paths::AllowEntry::compile(e).map_err(|err| {
                        ManifestError::Invalid(format!("policy.data.filesystem.{}: {}", list, err))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let compile_patterns = |entries: &[String]| {
            entries
                .iter()
                .map(|p| {
                    paths::compile_name_pattern(p)
                        .map(|m| (p.clone(), m))
                        .map_err(ManifestError::Invalid)
                })
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            allow_read: compile_list(&manifest.policy.data.filesystem.allow_read, "allow_read")?,
            allow_write: compile_list(&manifest.policy.data.filesystem.allow_write, "allow_write")?,
            vector_read: compile_patterns(&manifest.policy.data.vector.allow)?,
            vector_write: compile_patterns(&manifest.policy.data.vector.allow_write)?,
            manifest,
        })
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn policy_mode(&self) -> PolicyMode {
        self.manifest.runtime.policy_mode
    }

    fn developer_override(&self) -> Option<PolicyDecision> {
        match self.manifest.runtime.policy_mode {
            PolicyMode::Developer => Some(PolicyDecision::allow(
                "developer_mode",
                "developer mode bypasses allow-list checks",
            )),
            PolicyMode::LocalOnly => None,
        }
    }

    /// Tool-name allow-list lookup.
    pub fn check_tool(&self, name: &str) -> PolicyDecision {
        if let Some(decision) = self.developer_override() {
            return decision;
        }
        if self.manifest.policy.tools.allow.contains(name) {
            PolicyDecision::allow("tools.allow", format!("tool '{}' is allow-listed", name))
        } else {
            PolicyDecision::deny(
                "tools.allow",
                format!("tool '{}' is not in policy.tools.allow", name),
            )
        }
    }

    /// Exact canonical-path membership; no glob semantics for sqlite.
    pub fn check_sqlite(&self, path: &Path) -> PolicyDecision {
        if let Some(decision) = self.developer_override() {
            return decision;
        }
        let canonical = match paths::canonicalize_lenient(path) {
            Ok(p) => p,
            Err(reason) => return PolicyDecision::deny("data.sqlite", reason),
        };
        if self
            .manifest
            .policy
            .data
            .sqlite
            .allow
            .iter()
            .any(|allowed| allowed == &canonical)
        {
            PolicyDecision::allow(
                "data.sqlite",
                format!("database '{}' is allow-listed", canonical.display()),
            )
        } else {
            PolicyDecision::deny(
                "data.sqlite",
                format!(
                    "database '{}' is not in policy.data.sqlite.allow",
                    canonical.display()
                ),
            )
        }
    }

    pub fn check_read(&self, path: &Path) -> PolicyDecision {
        self.check_filesystem(path, &self.allow_read, "filesystem.read")
    }

    pub fn check_write(&self, path: &Path) -> PolicyDecision {
        self.check_filesystem(path, &self.allow_write, "filesystem.write")
    }

    fn check_filesystem(
        &self,
        path: &Path,
        entries: &[paths::AllowEntry],
        rule: &str,
    ) -> PolicyDecision {
        if let Some(decision) = self.developer_override() {
            return decision;
        }
        let canonical = match paths::canonicalize_lenient(path) {
            Ok(p) => p,
            Err(reason) => return PolicyDecision::deny(rule, reason),
        };
        for entry in entries {
            if entry.matches(&canonical) {
                return PolicyDecision::allow(
                    rule,
                    format!(
                        "path '{}' matches allow entry '{}'",
                        canonical.display(),
                        entry.pattern()
                    ),
                );
            }
        }
        PolicyDecision::deny(
            rule,
            format!(
                "path '{}' matches no allow-list entry",
                canonical.display()
            ),
        )
    }

    /// Advisory network check: the engine does not enforce sockets, callers
    /// do. Loopback hosts stay reachable under `outbound: deny` because the
    /// model backend itself is local.
    pub fn check_network(&self, host: &str) -> PolicyDecision {
        const LOOPBACK: &[&str] = &["localhost", "127.0.0.1", "::1"];

        if let Some(decision) = self.developer_override() {
            return decision;
        }
        if self.manifest.policy.network.outbound == Outbound::Allow {
            return PolicyDecision::allow("network.outbound", "outbound traffic is allowed");
        }
        if self.manifest.policy.network.allow_domains.contains(host) {
            return PolicyDecision::allow(
                "network.allow_domains",
                format!("host '{}' is allow-listed", host),
            );
        }
        if LOOPBACK.contains(&host) {
            return PolicyDecision::allow(
                "network.loopback",
                format!("host '{}' is loopback", host),
            );
        }
        PolicyDecision::deny(
            "network.outbound",
            format!("outbound traffic to '{}' is denied", host),
        )
    }

    /// Glob-match a collection name against the vector allow-lists.
    pub fn check_vector(&self, collection: &str, op: VectorOp) -> PolicyDecision {
        if let Some(decision) = self.developer_override() {
            return decision;
        }
        let (patterns, rule) = match op {
            VectorOp::Read => (&self.vector_read, "vector.allow"),
            VectorOp::Write => (&self.vector_write, "vector.allow_write"),
        };
        for (pattern, matcher) in patterns {
            if matcher.is_match(collection) {
                return PolicyDecision::allow(
                    rule,
                    format!("collection '{}' matches '{}'", collection, pattern),
                );
            }
        }
        PolicyDecision::deny(
            rule,
            format!("collection '{}' matches no allow-list pattern", collection),
        )
    }
}

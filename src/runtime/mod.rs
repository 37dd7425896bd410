//! Shared runtime state, threaded explicitly through request handling.
//!
//! One process holds one manifest snapshot (atomically replaceable), one
//! audit-log writer, one model adapter and one tool registry. There is no
//! module-level mutable state; everything hangs off [`Runtime`].

pub mod router;

pub use router::run_chat;

use crate::adapter::{self, ModelAdapter};
use crate::audit::AuditLog;
use crate::embedding::{self, Embedder};
use crate::error::Result;
use crate::manifest::{Manifest, PolicyMode};
use crate::policy::PolicyEngine;
use crate::tools::ToolRegistry;
use crate::vector::{self, VectorStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// The manifest a request is pinned to, with its compiled policy engine.
/// Cloning is cheap; in-flight requests keep their snapshot across reloads.
#[derive(Clone)]
pub struct Snapshot {
    pub manifest: Arc<Manifest>,
    pub policy: Arc<PolicyEngine>,
}

impl Snapshot {
    pub fn new(manifest: Arc<Manifest>) -> Result<Self> {
        let policy = Arc::new(PolicyEngine::new(manifest.clone())?);
        Ok(Self { manifest, policy })
    }
}

pub struct Runtime {
    snapshot: RwLock<Snapshot>,
    pub audit: Arc<AuditLog>,
    pub adapter: Arc<dyn ModelAdapter>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub tools: Arc<ToolRegistry>,
    started_at: Instant,
}

impl Runtime {
    /// Default wiring from a loaded manifest: Ollama adapter, configured
    /// embedding and vector backends, built-in tool registry, audit log at
    /// the manifest's path.
    pub async fn from_manifest(manifest: Manifest) -> Result<Arc<Self>> {
        if manifest.runtime.policy_mode == PolicyMode::Developer {
            warn!("policy_mode is 'developer': allow-list checks are bypassed");
        }
        let audit = Arc::new(AuditLog::open(&manifest.audit.path).await?);
        let adapter = adapter::from_config(&manifest)?;
        let embedder = embedding::from_config(&manifest.embedding, &manifest.runtime)?;
        let vectors = vector::from_config(&manifest.vector_db)?;
        Self::with_parts(
            manifest,
            audit,
            adapter,
            embedder,
            vectors,
            Arc::new(ToolRegistry::builtin()),
        )
    }

    /// Explicit wiring, used by tests and alternative hosts.
    pub fn with_parts(
        manifest: Manifest,
        audit: Arc<AuditLog>,
        adapter: Arc<dyn ModelAdapter>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Arc<Self>> {
        let snapshot = Snapshot::new(Arc::new(manifest))?;

        // Network checks are advisory; flag a backend host the policy would
        // deny rather than refusing to start.
        if let Ok(base) = url::Url::parse(&snapshot.manifest.runtime.base_url) {
            if let Some(host) = base.host_str() {
                let decision = snapshot.policy.check_network(host);
                if !decision.is_allow() {
                    warn!(host, reason = %decision.reason, "model backend host is outside the network policy");
                }
            }
        }
        Ok(Arc::new(Self {
            snapshot: RwLock::new(snapshot),
            audit,
            adapter,
            embedder,
            vectors,
            tools,
            started_at: Instant::now(),
        }))
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// Atomically replace the manifest snapshot. The audit log, adapter and
    /// backend wiring are fixed at startup; only policy-relevant state swaps.
    pub async fn reload_manifest(&self, manifest: Manifest) -> Result<()> {
        let next = Snapshot::new(Arc::new(manifest))?;
        let mut current = self.snapshot.write().await;
        info!(
            app = %next.manifest.app.name,
            policy_mode = next.manifest.runtime.policy_mode.as_str(),
            "manifest reloaded"
        );
        *current = next;
        Ok(())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

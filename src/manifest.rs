//! Declarative manifest: the policy document governing one gateway instance.
//!
//! Loaded once from YAML, validated, canonicalized, then immutable. Reloads
//! replace the whole object atomically; in-flight requests keep the snapshot
//! they started with.

use crate::error::ManifestError;
use crate::policy::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable supplying the default manifest path.
pub const MANIFEST_ENV: &str = "DOMEKIT_MANIFEST";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub app: AppInfo,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_db: VectorDbConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppInfo {
    pub name: String,
    #[serde(default = "default_app_version")]
    pub version: String,
}

fn default_app_version() -> String {
    "0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub policy_mode: PolicyMode,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Hard deadline for one request through the tool-calling loop.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            policy_mode: PolicyMode::default(),
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

/// `local_only` enforces every allow-list; `developer` short-circuits every
/// check to ALLOW and is intended for local development only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    LocalOnly,
    Developer,
}

impl PolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Developer => "developer",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub tools: ToolsPolicy,
    #[serde(default)]
    pub data: DataPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub outbound: Outbound,
    #[serde(default)]
    pub allow_domains: BTreeSet<String>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            outbound: Outbound::Deny,
            allow_domains: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outbound {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsPolicy {
    #[serde(default)]
    pub allow: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataPolicy {
    #[serde(default)]
    pub sqlite: SqlitePolicy,
    #[serde(default)]
    pub filesystem: FilesystemPolicy,
    #[serde(default)]
    pub vector: VectorPolicy,
}

/// Exact absolute paths only; globs are rejected at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlitePolicy {
    #[serde(default)]
    pub allow: Vec<PathBuf>,
}

/// Ordered lists of path prefixes and globs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemPolicy {
    #[serde(default)]
    pub allow_read: Vec<String>,
    #[serde(default)]
    pub allow_write: Vec<String>,
}

/// Collection-name glob patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub allow_write: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsConfig {
    #[serde(default = "default_model_backend")]
    pub backend: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub map: BTreeMap<String, ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            backend: default_model_backend(),
            default: String::new(),
            map: BTreeMap::new(),
        }
    }
}

fn default_model_backend() -> String {
    "ollama".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub context_window: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default)]
    pub read_only: bool,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            read_only: false,
        }
    }
}

fn default_max_rows() -> usize {
    100
}

fn default_max_bytes() -> usize {
    1_048_576
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            model: default_embedding_model(),
        }
    }
}

fn default_embedding_backend() -> String {
    "ollama".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorDbConfig {
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            default_top_k: default_top_k(),
        }
    }
}

fn default_vector_backend() -> String {
    "memory".to_string()
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub redact_prompt: bool,
    #[serde(default)]
    pub redact_tool_outputs: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            redact_prompt: false,
            redact_tool_outputs: false,
        }
    }
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./audit.jsonl")
}

impl Manifest {
    /// Load and validate a manifest from a YAML file. Absolute paths in the
    /// allow-lists are canonicalized here and stored in canonical form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate manifest YAML.
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_yaml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Canonicalize allow-list paths and reject malformed entries. Entries
    /// whose canonicalization target does not exist warn but do not fail.
    pub fn validate(&mut self) -> Result<(), ManifestError> {
        let mut canonical_sqlite = Vec::with_capacity(self.policy.data.sqlite.allow.len());
        for entry in &self.policy.data.sqlite.allow {
            let text = entry.to_string_lossy();
            if text.contains(['*', '?', '[']) {
                return Err(ManifestError::Invalid(format!(
                    "policy.data.sqlite.allow entry '{}' contains a glob character; \
                     sqlite paths must be exact",
                    text
                )));
            }
            if !entry.is_absolute() {
                return Err(ManifestError::Invalid(format!(
                    "policy.data.sqlite.allow entry '{}' is not an absolute path",
                    text
                )));
            }
            if !entry.exists() {
                warn!(path = %text, "sqlite allow-list entry does not exist");
            }
            let canonical = paths::canonicalize_lenient(entry)
                .map_err(|e| ManifestError::Invalid(format!("sqlite allow entry: {}", e)))?;
            canonical_sqlite.push(canonical);
        }
        self.policy.data.sqlite.allow = canonical_sqlite;

        self.policy.data.filesystem.allow_read =
            canonicalize_fs_entries(&self.policy.data.filesystem.allow_read, "allow_read")?;
        self.policy.data.filesystem.allow_write =
            canonicalize_fs_entries(&self.policy.data.filesystem.allow_write, "allow_write")?;

        for pattern in self
            .policy
            .data
            .vector
            .allow
            .iter()
            .chain(&self.policy.data.vector.allow_write)
        {
            paths::compile_name_pattern(pattern)
                .map_err(|e| ManifestError::Invalid(format!("policy.data.vector: {}", e)))?;
        }

        if !self.models.default.is_empty() && !self.models.map.contains_key(&self.models.default) {
            warn!(
                model = %self.models.default,
                "models.default has no entry in models.map; the name is passed to the backend as-is"
            );
        }

        Ok(())
    }

    /// Effective configuration for a tool, falling back to global defaults.
    pub fn tool_config(&self, name: &str) -> ToolConfig {
        self.tools.get(name).cloned().unwrap_or_default()
    }

    /// Backend model id for a model name, following `models.map` when the
    /// name is mapped.
    pub fn resolve_model<'a>(&'a self, name: &'a str) -> &'a str {
        match self.models.map.get(name) {
            Some(entry) => &entry.id,
            None => name,
        }
    }
}

/// Canonicalize prefix entries; glob entries are syntax-checked only and kept
/// verbatim (they are matched against canonical paths later).
fn canonicalize_fs_entries(
    entries: &[String],
    list: &str,
) -> Result<Vec<String>, ManifestError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.contains(['*', '?', '[']) {
            paths::AllowEntry::compile(entry).map_err(|e| {
                ManifestError::Invalid(format!("policy.data.filesystem.{}: {}", list, e))
            })?;
            out.push(entry.clone());
        } else {
            if !Path::new(entry).exists() {
                warn!(path = %entry, list, "filesystem allow-list entry does not exist");
            }
            let canonical = paths::canonicalize_lenient(Path::new(entry)).map_err(|e| {
                ManifestError::Invalid(format!("policy.data.filesystem.{}: {}", list, e))
            })?;
            let mut text = canonical.to_string_lossy().into_owned();
            if entry.ends_with('/') && !text.ends_with('/') {
                text.push('/');
            }
            out.push(text);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
app:
  name: hello
"#;

    #[test]
    fn minimal_manifest_gets_defaults() {
        let manifest = Manifest::from_yaml(MINIMAL).unwrap();
        assert_eq!(manifest.runtime.policy_mode, PolicyMode::LocalOnly);
        assert_eq!(manifest.runtime.request_timeout_seconds, 120);
        assert_eq!(manifest.policy.network.outbound, Outbound::Deny);
        assert_eq!(manifest.tool_config("sql_query").max_rows, 100);
        assert_eq!(manifest.tool_config("read_file").max_bytes, 1_048_576);
        assert_eq!(manifest.vector_db.default_top_k, 10);
        assert_eq!(manifest.audit.path, PathBuf::from("./audit.jsonl"));
    }

    #[test]
    fn request_timeout_is_overridable() {
        let yaml = r#"
app:
  name: hello
runtime:
  request_timeout_seconds: 15
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.runtime.request_timeout_seconds, 15);
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = r#"
app:
  name: hello
surprise: true
"#;
        assert!(matches!(
            Manifest::from_yaml(yaml),
            Err(ManifestError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_unrecognized_policy_mode() {
        let yaml = r#"
app:
  name: hello
runtime:
  policy_mode: yolo
"#;
        assert!(matches!(
            Manifest::from_yaml(yaml),
            Err(ManifestError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_glob_in_sqlite_allow() {
        let yaml = r#"
app:
  name: hello
policy:
  data:
    sqlite:
      allow: ["/data/*.db"]
"#;
        let err = Manifest::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[test]
    fn canonicalizes_sqlite_paths() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("h.db");
        std::fs::write(&db, b"").unwrap();
        let yaml = format!(
            "app:\n  name: hello\npolicy:\n  data:\n    sqlite:\n      allow: [\"{}\"]\n",
            dir.path().join("sub/../h.db").display()
        );
        let manifest = Manifest::from_yaml(&yaml).unwrap();
        assert_eq!(
            manifest.policy.data.sqlite.allow,
            vec![std::fs::canonicalize(&db).unwrap()]
        );
    }

    #[test]
    fn missing_allow_target_warns_but_loads() {
        let yaml = r#"
app:
  name: hello
policy:
  data:
    filesystem:
      allow_read: ["/definitely/not/there/"]
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(
            manifest.policy.data.filesystem.allow_read,
            vec!["/definitely/not/there/".to_string()]
        );
    }

    #[test]
    fn parse_error_reports_location() {
        let yaml = "app:\n  name: [unclosed\n";
        match Manifest::from_yaml(yaml) {
            Err(ManifestError::Parse { location, .. }) => assert!(location.is_some()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn resolve_model_follows_map() {
        let yaml = r#"
app:
  name: hello
models:
  backend: ollama
  default: fast
  map:
    fast:
      id: llama3.1:8b
      context_window: 8192
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.resolve_model("fast"), "llama3.1:8b");
        assert_eq!(manifest.resolve_model("other"), "other");
    }
}

//! Append-only line-delimited audit log.
//!
//! All appends serialize through a single writer guarded by a mutex (FIFO
//! among waiters), so the byte offset advances monotonically and the file
//! order equals arrival order. Live subscribers get copies through bounded
//! channels; a subscriber that cannot keep up is dropped rather than ever
//! reordering or thinning the stream it sees.

use crate::audit::{AuditEntry, AuditEvent};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Filters for [`AuditLog::query`]. Results come back in file order, which
/// equals append order.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub event: Option<AuditEvent>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub request_id: Option<Uuid>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QueryFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(event) = self.event {
            if entry.event != event {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.ts > until {
                return false;
            }
        }
        if let Some(request_id) = self.request_id {
            if entry.request_id != request_id {
                return false;
            }
        }
        true
    }
}

pub struct AuditLog {
    path: PathBuf,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: File,
    offset: u64,
    entries: u64,
    index: HashMap<Uuid, Vec<u64>>,
    subscribers: Vec<mpsc::Sender<AuditEntry>>,
}

impl AuditLog {
    /// Open (or create) the log file in append mode. Existing content is
    /// scanned once to rebuild the entry count and the request-id index.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut offset = 0u64;
        let mut entries = 0u64;
        let mut index: HashMap<Uuid, Vec<u64>> = HashMap::new();
        if let Ok(existing) = File::open(&path).await {
            let mut lines = BufReader::new(existing).lines();
            while let Some(line) = lines.next_line().await? {
                let line_start = offset;
                offset += line.len() as u64 + 1;
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => {
                        entries += 1;
                        index.entry(entry.request_id).or_default().push(line_start);
                    }
                    Err(e) => {
                        warn!(offset = line_start, error = %e, "skipping unparsable audit line");
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), entries, "audit log opened");
        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file,
                offset,
                entries,
                index,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Returns the byte offset the entry was written at;
    /// offsets are strictly increasing. The write is flushed to the OS but
    /// not fsynced.
    pub async fn append(&self, entry: AuditEntry) -> Result<u64> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        let at = state.offset;
        state
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::audit(format!("append failed: {}", e)))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| Error::audit(format!("flush failed: {}", e)))?;
        state.offset += line.len() as u64;
        state.entries += 1;
        state.index.entry(entry.request_id).or_default().push(at);

        // Fan out to live subscribers. A full buffer means the subscriber
        // fell behind: drop the subscriber, never the newest entry, so every
        // surviving subscriber sees a gapless ordered stream.
        state.subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping slow audit subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Ok(at)
    }

    /// Stream entries from disk through `filter`. Returns the page plus the
    /// total number of matches before pagination.
    pub async fn query(&self, filter: &QueryFilter) -> Result<(Vec<AuditEntry>, u64)> {
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        let mut total = 0u64;
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
                continue;
            };
            if !filter.matches(&entry) {
                continue;
            }
            let matched = total as usize;
            total += 1;
            if matched >= filter.offset && out.len() < limit {
                out.push(entry);
            }
        }
        Ok((out, total))
    }

    /// All entries for one request, in append order. Served from the offset
    /// index when the request is known, otherwise a linear scan.
    pub async fn by_request(&self, request_id: Uuid) -> Result<Vec<AuditEntry>> {
        let offsets = {
            let state = self.state.lock().await;
            state.index.get(&request_id).cloned()
        };

        match offsets {
            Some(offsets) if !offsets.is_empty() => {
                let file = File::open(&self.path).await?;
                let mut reader = BufReader::new(file);
                let mut out = Vec::with_capacity(offsets.len());
                for at in offsets {
                    reader.seek(SeekFrom::Start(at)).await?;
                    let mut line = String::new();
                    reader.read_line(&mut line).await?;
                    let entry = serde_json::from_str::<AuditEntry>(line.trim_end())
                        .map_err(|e| Error::audit(format!("corrupt entry at {}: {}", at, e)))?;
                    out.push(entry);
                }
                Ok(out)
            }
            _ => {
                let filter = QueryFilter {
                    request_id: Some(request_id),
                    ..QueryFilter::default()
                };
                Ok(self.query(&filter).await?.0)
            }
        }
    }

    /// Register a live subscriber with a bounded buffer. Every subsequent
    /// append is delivered until the subscriber lags or hangs up.
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AuditEntry> {
        let (tx, rx) = mpsc::channel(capacity);
        self.state.lock().await.subscribers.push(tx);
        rx
    }

    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.offset
    }

    pub async fn entry_count(&self) -> u64 {
        self.state.lock().await.entries
    }

    /// Every parsable entry on disk, for the derived views.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.query(&QueryFilter::default()).await?.0)
    }
}

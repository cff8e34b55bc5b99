//! Durable capability cache — one JSON file per backend.
//!
//! A restart must not force a live query against every backend before the
//! proxy can advertise a tool list, so the last successfully fetched
//! [`CapabilitySet`] is persisted per backend. Writes are atomic (temp file
//! then rename) and persistence failures are logged, never propagated: the
//! in-memory capability set is still valid even when the disk write fails.

use chrono::Utc;
use relay_core::{CapabilitySet, RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One persisted record: a backend's last-known capability set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub server_id: String,
    pub capabilities: CapabilitySet,
    pub fetched_at_epoch_millis: i64,
}

impl CacheEntry {
    /// Build an entry stamped with the current time.
    pub fn now(server_id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            server_id: server_id.into(),
            capabilities,
            fetched_at_epoch_millis: Utc::now().timestamp_millis(),
        }
    }
}

/// File-backed capability cache.
///
/// The store is one resource: a single lock guards every operation, since
/// writes are infrequent and atomicity matters more than parallelism here.
pub struct CapabilityCache {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl CapabilityCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> RelayResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, server_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_id(server_id)))
    }

    /// Load every persisted entry, skipping and logging any that fail to
    /// decode. Corruption must never abort startup.
    pub async fn load_all(&self) -> RelayResult<Vec<CacheEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable cache entry");
                }
            }
        }
        entries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(entries)
    }

    /// Load the entry for one backend, if present and decodable.
    pub async fn load(&self, server_id: &str) -> Option<CacheEntry> {
        let _guard = self.lock.lock().await;
        let path = self.entry_path(server_id);
        match read_entry(&path).await {
            Ok(entry) => Some(entry),
            Err(RelayError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(server = %server_id, error = %e, "skipping undecodable cache entry");
                None
            }
        }
    }

    /// Persist an entry, overwriting any previous record for the backend.
    ///
    /// Atomic: written to a temp sibling then renamed into place, so a
    /// crash mid-write never leaves a half-written file. Failures are
    /// logged and swallowed.
    pub async fn save(&self, entry: &CacheEntry) {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.write_atomic(entry).await {
            warn!(server = %entry.server_id, error = %e, "capability cache write failed");
        } else {
            debug!(server = %entry.server_id, "capability cache entry written");
        }
    }

    async fn write_atomic(&self, entry: &CacheEntry) -> RelayResult<()> {
        let path = self.entry_path(&entry.server_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entry)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Delete the entry for one backend. Missing entries are fine.
    pub async fn remove(&self, server_id: &str) {
        let _guard = self.lock.lock().await;
        let path = self.entry_path(server_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(server = %server_id, "capability cache entry removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(server = %server_id, error = %e, "capability cache remove failed"),
        }
    }

    /// Delete every entry whose backend id is not in `valid_ids`.
    ///
    /// An empty set means "no backends configured" and clears everything.
    pub async fn retain(&self, valid_ids: &[&str]) {
        let _guard = self.lock.lock().await;
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "capability cache prune failed");
                return;
            }
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let keep = decode_id(stem)
                .map(|id| valid_ids.contains(&id.as_str()))
                .unwrap_or(false);
            if !keep {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "stale cache entry not removed");
                } else {
                    debug!(path = %path.display(), "stale cache entry pruned");
                }
            }
        }
    }
}

async fn read_entry(path: &Path) -> RelayResult<CacheEntry> {
    let data = tokio::fs::read_to_string(path).await?;
    let entry = serde_json::from_str(&data)?;
    Ok(entry)
}

/// Encode a backend id into a filesystem-safe filename stem.
///
/// Reversible: bytes outside `[A-Za-z0-9._-]` become `%XX` (uppercase hex),
/// and `%` itself is always escaped.
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Decode a filename stem back into the backend id.
pub fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

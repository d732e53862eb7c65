//! Extraction payload storage
//!
//! 작은 페이로드는 item 행에 그대로 저장하고, 큰 페이로드는
//! `payload_dir/<blake3>.json` 파일로 분리한다. The item row then keeps the hash only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::domain::entities::RawPayload;
use crate::domain::errors::Result;

const SPILL_EXTENSION: &str = "json";

/// How a payload is persisted on the item row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPayload {
    /// Serialized JSON kept in the `payload` column
    Inline(String),
    /// Content hash of a file under the payload directory (`payload_ref` column)
    Spilled(String),
}

#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
    max_inline_bytes: usize,
}

impl PayloadStore {
    pub fn new(dir: impl Into<PathBuf>, max_inline_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_inline_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        self.dir.join(format!("{reference}.{SPILL_EXTENSION}"))
    }

    /// Serialize a payload, spilling it to disk when it is too large for the row
    pub async fn store(&self, payload: &RawPayload) -> Result<StoredPayload> {
        let serialized = serde_json::to_string(payload)?;
        if serialized.len() <= self.max_inline_bytes {
            return Ok(StoredPayload::Inline(serialized));
        }

        let reference = blake3::hash(serialized.as_bytes()).to_hex().to_string();
        let path = self.path_for(&reference);
        if !fs::try_exists(&path).await? {
            fs::create_dir_all(&self.dir).await?;
            // the hashed name only ever points at a complete file
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, serialized.as_bytes()).await?;
            fs::rename(&tmp, &path).await?;
        }
        debug!(
            "📦 Spilled {} byte payload to {}",
            serialized.len(),
            path.display()
        );
        Ok(StoredPayload::Spilled(reference))
    }

    /// Resolve the row columns back into a payload
    pub async fn load(
        &self,
        inline: Option<&str>,
        reference: Option<&str>,
    ) -> Result<Option<RawPayload>> {
        if let Some(reference) = reference {
            let bytes = fs::read(self.path_for(reference)).await?;
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }
        match inline {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    /// Delete spilled files no remaining item references. Returns how many were removed.
    pub async fn remove_unreferenced(&self, in_use: &HashSet<String>) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPILL_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if in_use.contains(stem) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove payload file {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn small_payloads_stay_inline() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path(), 1024);

        let payload = json!({ "name": "widget", "fields": [1, 2, 3] });
        let stored = store.store(&payload).await.unwrap();

        let StoredPayload::Inline(json) = stored else {
            panic!("expected inline payload");
        };
        let loaded = store.load(Some(&json), None).await.unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn large_payloads_spill_to_content_addressed_files() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path().join("payloads"), 64);

        let payload = json!({ "blob": "x".repeat(500) });
        let first = store.store(&payload).await.unwrap();
        let second = store.store(&payload).await.unwrap();
        assert_eq!(first, second);

        let StoredPayload::Spilled(reference) = first else {
            panic!("expected spilled payload");
        };
        assert_eq!(reference.len(), 64);
        assert!(store.path_for(&reference).exists());

        let loaded = store.load(None, Some(&reference)).await.unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn cleanup_keeps_referenced_files() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path(), 16);

        let StoredPayload::Spilled(keep) = store.store(&json!({ "a": "a".repeat(100) })).await.unwrap()
        else {
            panic!("expected spill");
        };
        let StoredPayload::Spilled(drop) = store.store(&json!({ "b": "b".repeat(100) })).await.unwrap()
        else {
            panic!("expected spill");
        };

        let in_use: HashSet<String> = [keep.clone()].into_iter().collect();
        assert_eq!(store.remove_unreferenced(&in_use).await.unwrap(), 1);
        assert!(store.path_for(&keep).exists());
        assert!(!store.path_for(&drop).exists());
    }

    #[tokio::test]
    async fn cleanup_of_missing_directory_is_noop() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path().join("never-created"), 16);
        assert_eq!(store.remove_unreferenced(&HashSet::new()).await.unwrap(), 0);
    }
}

//! Processed-source tracking
//!
//! Remembers which URLs have already been ingested so the same page is never
//! processed twice. Keyed by a truncated SHA-256 of the URL; persisted as
//! JSON at `<data_dir>/.silvia/processed_sources.json`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A source that has been ingested into the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSource {
    pub url: String,
    pub title: String,
    pub processed_at: DateTime<Utc>,
    pub hash: String,
    /// Entity id of the archived capture, if one was stored
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub storage_path: Option<String>,
}

/// Persistent set of processed sources, keyed by URL hash
pub struct SourceTracker {
    path: PathBuf,
    sources: RwLock<HashMap<String, ProcessedSource>>,
}

/// Stable key for a URL: the first 32 hex characters of its SHA-256
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(digest)[..32].to_string()
}

impl SourceTracker {
    /// Open the tracker at `<data_dir>/.silvia/processed_sources.json`
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir
            .into()
            .join(".silvia")
            .join("processed_sources.json");
        let sources = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let records: Vec<ProcessedSource> =
                serde_json::from_str(&contents).map_err(|e| Error::Format {
                    path: path.display().to_string(),
                    message: format!("invalid processed-sources file: {e}"),
                })?;
            records.into_iter().map(|r| (r.hash.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            sources: RwLock::new(sources),
        })
    }

    pub fn is_processed(&self, url: &str) -> bool {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.contains_key(&url_hash(url))
    }

    pub fn get(&self, url: &str) -> Option<ProcessedSource> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.get(&url_hash(url)).cloned()
    }

    /// Record a source as processed; re-marking overwrites the old record
    pub fn mark_processed(
        &self,
        url: &str,
        title: &str,
        storage_path: Option<String>,
    ) -> Result<ProcessedSource> {
        let record = ProcessedSource {
            url: url.to_string(),
            title: title.to_string(),
            processed_at: Utc::now(),
            hash: url_hash(url),
            storage_path,
        };
        {
            let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
            sources.insert(record.hash.clone(), record.clone());
            self.persist(&sources)?;
        }
        Ok(record)
    }

    /// Forget a source; returns whether it was known
    pub fn remove(&self, url: &str) -> Result<bool> {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        let removed = sources.remove(&url_hash(url)).is_some();
        if removed {
            self.persist(&sources)?;
        }
        Ok(removed)
    }

    /// All processed sources, most recent first
    pub fn all(&self) -> Vec<ProcessedSource> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = sources.values().cloned().collect();
        all.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        all
    }

    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On disk the tracker is an array of records, ordered by URL for
    /// stable diffs
    fn persist(&self, sources: &HashMap<String, ProcessedSource>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut records: Vec<&ProcessedSource> = sources.values().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| Error::Other(format!("failed to serialize processed sources: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_url_hash_is_stable_and_truncated() {
        let hash = url_hash("https://example.com/article");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, url_hash("https://example.com/article"));
        assert_ne!(hash, url_hash("https://example.com/other"));
    }

    #[test]
    fn test_mark_and_query() {
        let dir = TempDir::new().unwrap();
        let tracker = SourceTracker::open(dir.path()).unwrap();
        assert!(!tracker.is_processed("https://example.com"));

        tracker
            .mark_processed("https://example.com", "Example", Some("sources/web/example".into()))
            .unwrap();
        assert!(tracker.is_processed("https://example.com"));
        let record = tracker.get("https://example.com").unwrap();
        assert_eq!(record.title, "Example");
        assert_eq!(record.storage_path.as_deref(), Some("sources/web/example"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let tracker = SourceTracker::open(dir.path()).unwrap();
            tracker.mark_processed("https://a.example", "A", None).unwrap();
        }
        let tracker = SourceTracker::open(dir.path()).unwrap();
        assert!(tracker.is_processed("https://a.example"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_remove_forgets() {
        let dir = TempDir::new().unwrap();
        let tracker = SourceTracker::open(dir.path()).unwrap();
        tracker.mark_processed("https://a.example", "A", None).unwrap();
        assert!(tracker.remove("https://a.example").unwrap());
        assert!(!tracker.remove("https://a.example").unwrap());
        assert!(tracker.is_empty());
    }
}

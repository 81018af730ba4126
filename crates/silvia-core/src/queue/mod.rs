//! Persistent priority queue of sources waiting to be processed
//!
//! The queue is a JSON array at `<data_dir>/.silvia/queue.json`, rewritten on
//! every mutation so a crash never loses more than the in-flight change.
//! Ordering is priority (high first), then insertion time.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Processing priority, serialized as an integer for forward compatibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Parse from a user-facing name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" | "l" | "0" => Some(Self::Low),
            "medium" | "med" | "m" | "1" => Some(Self::Medium),
            "high" | "h" | "2" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        match p {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(Self::Low),
            1 => Ok(Self::Medium),
            2 => Ok(Self::High),
            other => Err(format!("invalid priority value: {other}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One source waiting in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSource {
    pub url: String,
    pub priority: Priority,
    pub added_at: DateTime<Utc>,
    /// Entity or source that led to this URL, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// Persistent priority queue, deduplicated by URL
pub struct SourceQueue {
    path: PathBuf,
    items: Mutex<Vec<QueuedSource>>,
}

impl SourceQueue {
    /// Open the queue at `<data_dir>/.silvia/queue.json`, creating an empty
    /// one if the file is missing
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(".silvia").join("queue.json");
        let items = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                Error::Format {
                    path: path.display().to_string(),
                    message: format!("invalid queue file: {e}"),
                }
            })?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Add a source; returns false (and changes nothing) if the URL is
    /// already queued
    pub fn add(
        &self,
        url: &str,
        priority: Priority,
        from_source: Option<String>,
        description: Option<String>,
    ) -> Result<bool> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.iter().any(|s| s.url == url) {
            return Ok(false);
        }
        items.push(QueuedSource {
            url: url.to_string(),
            priority,
            added_at: Utc::now(),
            from_source,
            description,
        });
        debug!(url, %priority, "queued source");
        self.persist(&items)?;
        Ok(true)
    }

    /// Remove a source by URL; returns whether it was present
    pub fn remove(&self, url: &str) -> Result<bool> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let before = items.len();
        items.retain(|s| s.url != url);
        let removed = items.len() != before;
        if removed {
            self.persist(&items)?;
        }
        Ok(removed)
    }

    /// The next source to process, without removing it
    pub fn peek(&self) -> Option<QueuedSource> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        next_index(&items).map(|i| items[i].clone())
    }

    /// Remove and return the next source to process
    pub fn pop(&self) -> Result<Option<QueuedSource>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let Some(i) = next_index(&items) else {
            return Ok(None);
        };
        let item = items.remove(i);
        self.persist(&items)?;
        Ok(Some(item))
    }

    pub fn contains(&self, url: &str) -> bool {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.iter().any(|s| s.url == url)
    }

    /// All queued sources in processing order
    pub fn get_all(&self) -> Vec<QueuedSource> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let mut sorted = items.clone();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.added_at.cmp(&b.added_at)));
        sorted
    }

    /// Change a queued source's priority, keeping its queue age
    pub fn update_priority(&self, url: &str, priority: Priority) -> Result<bool> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let Some(item) = items.iter_mut().find(|s| s.url == url) else {
            return Ok(false);
        };
        if item.priority == priority {
            return Ok(true);
        }
        item.priority = priority;
        self.persist(&items)?;
        Ok(true)
    }

    /// Drop everything
    pub fn clear(&self) -> Result<()> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.clear();
        self.persist(&items)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, items: &[QueuedSource]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(items)
            .map_err(|e| Error::Other(format!("failed to serialize queue: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Index of the highest-priority, oldest item
fn next_index(items: &[QueuedSource]) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.added_at.cmp(&b.added_at))
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_priority_parsing_and_order() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::parse("m"), Some(Priority::Medium));
        assert_eq!(Priority::parse("urgent"), None);
        assert!(Priority::High > Priority::Low);
    }

    #[test]
    fn test_add_dedupes_by_url() {
        let dir = TempDir::new().unwrap();
        let queue = SourceQueue::open(dir.path()).unwrap();
        assert!(queue.add("https://a.example", Priority::Low, None, None).unwrap());
        assert!(!queue.add("https://a.example", Priority::High, None, None).unwrap());
        assert_eq!(queue.len(), 1);
        // The original priority stands.
        assert_eq!(queue.peek().unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_pop_order_is_priority_then_age() {
        let dir = TempDir::new().unwrap();
        let queue = SourceQueue::open(dir.path()).unwrap();
        queue.add("https://low", Priority::Low, None, None).unwrap();
        queue.add("https://high-1", Priority::High, None, None).unwrap();
        queue.add("https://high-2", Priority::High, None, None).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().url, "https://high-1");
        assert_eq!(queue.pop().unwrap().unwrap().url, "https://high-2");
        assert_eq!(queue.pop().unwrap().unwrap().url, "https://low");
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = SourceQueue::open(dir.path()).unwrap();
            queue
                .add("https://keep", Priority::Medium, Some("people/jane".into()), None)
                .unwrap();
        }
        let queue = SourceQueue::open(dir.path()).unwrap();
        assert!(queue.contains("https://keep"));
        let item = queue.peek().unwrap();
        assert_eq!(item.from_source.as_deref(), Some("people/jane"));
        assert_eq!(item.priority, Priority::Medium);
    }

    #[test]
    fn test_update_priority_keeps_age() {
        let dir = TempDir::new().unwrap();
        let queue = SourceQueue::open(dir.path()).unwrap();
        queue.add("https://a", Priority::Low, None, None).unwrap();
        let added_at = queue.peek().unwrap().added_at;

        assert!(queue.update_priority("https://a", Priority::High).unwrap());
        let item = queue.peek().unwrap();
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.added_at, added_at);

        assert!(!queue.update_priority("https://missing", Priority::High).unwrap());
    }

    #[test]
    fn test_priority_serializes_as_integer() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "2");
        let parsed: Priority = serde_json::from_str("0").unwrap();
        assert_eq!(parsed, Priority::Low);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }
}

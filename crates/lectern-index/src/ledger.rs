//! Processed-file ledger for change detection.
//!
//! The ledger maps each source filename of a collection to the content hash
//! it had when it was last fully processed, plus the chunk ids it produced.
//! It is the only thing consulted when deciding what to reprocess, and it is
//! written once, at the end of an ingestion run.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// File name of the ledger inside a collection's knowledge base directory.
pub const LEDGER_FILE: &str = "processed_files.json";

const LEDGER_VERSION: u32 = 1;

/// Ledger of processed files for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    /// Version of the ledger format
    pub version: u32,

    /// When the ledger was last modified
    pub last_updated: Option<SystemTime>,

    /// Next chunk sequence number to hand out
    #[serde(default)]
    pub next_chunk_seq: u64,

    /// Filename (relative, `/`-separated) to processing state
    pub files: BTreeMap<String, FileState>,
}

/// State of a processed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// SHA-256 of the file content, hex encoded
    pub content_hash: String,

    /// When the file was processed
    #[serde(rename = "indexed_at", alias = "processed_at")]
    pub processed_at: SystemTime,

    /// Chunk ids the file produced, in document order
    pub chunk_ids: Vec<String>,
}

/// A chunk id handed out by [`Ledger::allocate_chunk_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedChunkId {
    pub seq: u64,
    pub id: String,
}

/// Format the id for a chunk sequence number.
pub fn chunk_id(seq: u64) -> String {
    format!("chunk_{}", seq)
}

/// SHA-256 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            last_updated: None,
            next_chunk_seq: 0,
            files: BTreeMap::new(),
        }
    }

    /// Load a ledger from a file.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = fs::read_to_string(path).map_err(LedgerError::Io)?;
        serde_json::from_str(&content).map_err(LedgerError::Parse)
    }

    /// Load a ledger, returning an empty one if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, LedgerError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save the ledger. The file is replaced atomically.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let content = serde_json::to_string_pretty(self).map_err(LedgerError::Serialize)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(LedgerError::Io)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(LedgerError::Io)?;
        fs::rename(&tmp, path).map_err(LedgerError::Io)
    }

    /// Check if a file is new or changed since it was last processed.
    pub fn needs_update(&self, filename: &str, current_hash: &str) -> bool {
        match self.files.get(filename) {
            Some(state) => state.content_hash != current_hash,
            None => true,
        }
    }

    pub fn get(&self, filename: &str) -> Option<&FileState> {
        self.files.get(filename)
    }

    /// Record that a file went through every ingestion step.
    pub fn record_processed(&mut self, filename: String, content_hash: String, chunk_ids: Vec<String>) {
        self.files.insert(
            filename,
            FileState {
                content_hash,
                processed_at: SystemTime::now(),
                chunk_ids,
            },
        );
        self.last_updated = Some(SystemTime::now());
    }

    /// Remove a file from the ledger.
    pub fn remove_file(&mut self, filename: &str) -> Option<FileState> {
        let removed = self.files.remove(filename);
        if removed.is_some() {
            self.last_updated = Some(SystemTime::now());
        }
        removed
    }

    /// Forget everything, including the chunk id sequence.
    pub fn clear(&mut self) {
        self.files.clear();
        self.next_chunk_seq = 0;
        self.last_updated = Some(SystemTime::now());
    }

    /// Files recorded in the ledger that are not in `current_files`.
    pub fn find_deleted_files(&self, current_files: &[String]) -> Vec<String> {
        let current: HashSet<&str> = current_files.iter().map(String::as_str).collect();
        self.files
            .keys()
            .filter(|name| !current.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Hand out `count` fresh, sequential chunk ids.
    pub fn allocate_chunk_ids(&mut self, count: usize) -> Vec<AllocatedChunkId> {
        let start = self.next_chunk_seq;
        self.next_chunk_seq += count as u64;
        (start..self.next_chunk_seq)
            .map(|seq| AllocatedChunkId {
                seq,
                id: chunk_id(seq),
            })
            .collect()
    }

    pub fn total_chunks(&self) -> usize {
        self.files.values().map(|f| f.chunk_ids.len()).sum()
    }
}

/// Errors that can occur when reading or writing the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse ledger: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ledger_new() {
        let ledger = Ledger::new();
        assert_eq!(ledger.version, 1);
        assert!(ledger.files.is_empty());
        assert_eq!(ledger.next_chunk_seq, 0);
        assert_eq!(ledger.total_chunks(), 0);
    }

    #[test]
    fn test_needs_update() {
        let mut ledger = Ledger::new();

        assert!(ledger.needs_update("week1.pdf", "hash1"));

        ledger.record_processed("week1.pdf".to_string(), "hash1".to_string(), ids(&["chunk_0"]));
        assert!(!ledger.needs_update("week1.pdf", "hash1"));
        assert!(ledger.needs_update("week1.pdf", "hash2"));
    }

    #[test]
    fn test_record_replaces_previous_state() {
        let mut ledger = Ledger::new();
        ledger.record_processed("notes.md".to_string(), "h1".to_string(), ids(&["chunk_0", "chunk_1"]));
        ledger.record_processed(
            "notes.md".to_string(),
            "h2".to_string(),
            ids(&["chunk_2", "chunk_3", "chunk_4"]),
        );

        assert_eq!(ledger.files.len(), 1);
        assert_eq!(ledger.total_chunks(), 3);
        let state = ledger.get("notes.md").unwrap();
        assert_eq!(state.content_hash, "h2");
        assert_eq!(state.chunk_ids[0], "chunk_2");
    }

    #[test]
    fn test_remove_file() {
        let mut ledger = Ledger::new();
        ledger.record_processed("a.md".to_string(), "ha".to_string(), ids(&["chunk_0"]));

        let removed = ledger.remove_file("a.md");
        assert_eq!(removed.unwrap().chunk_ids, ids(&["chunk_0"]));
        assert!(ledger.remove_file("a.md").is_none());
        assert!(ledger.files.is_empty());
    }

    #[test]
    fn test_find_deleted_files() {
        let mut ledger = Ledger::new();
        ledger.record_processed("a.md".to_string(), "h1".to_string(), vec![]);
        ledger.record_processed("b.md".to_string(), "h2".to_string(), vec![]);
        ledger.record_processed("c.md".to_string(), "h3".to_string(), vec![]);

        let deleted = ledger.find_deleted_files(&ids(&["a.md", "c.md"]));
        assert_eq!(deleted, ids(&["b.md"]));
        assert!(ledger.find_deleted_files(&ids(&["a.md", "b.md", "c.md"])).is_empty());
    }

    #[test]
    fn test_allocate_chunk_ids_is_sequential() {
        let mut ledger = Ledger::new();
        let first = ledger.allocate_chunk_ids(2);
        let second = ledger.allocate_chunk_ids(1);

        assert_eq!(first[0].id, "chunk_0");
        assert_eq!(first[1].id, "chunk_1");
        assert_eq!(second[0], AllocatedChunkId { seq: 2, id: "chunk_2".to_string() });
        assert_eq!(ledger.next_chunk_seq, 3);
        assert!(ledger.allocate_chunk_ids(0).is_empty());
    }

    #[test]
    fn test_clear_resets_sequence() {
        let mut ledger = Ledger::new();
        ledger.allocate_chunk_ids(5);
        ledger.record_processed("a.md".to_string(), "h".to_string(), ids(&["chunk_0"]));

        ledger.clear();
        assert!(ledger.files.is_empty());
        assert_eq!(ledger.next_chunk_seq, 0);
        assert!(ledger.last_updated.is_some());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb").join(LEDGER_FILE);

        let mut ledger = Ledger::new();
        let allocated = ledger.allocate_chunk_ids(2);
        ledger.record_processed(
            "slides/intro.pdf".to_string(),
            "abc123".to_string(),
            allocated.into_iter().map(|a| a.id).collect(),
        );
        ledger.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = Ledger::load(&path).unwrap();
        assert_eq!(loaded.next_chunk_seq, 2);
        assert_eq!(loaded.get("slides/intro.pdf").unwrap().content_hash, "abc123");
        assert_eq!(loaded.total_chunks(), 2);
    }

    #[test]
    fn test_load_or_default_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load_or_default(&dir.path().join(LEDGER_FILE)).unwrap();
        assert!(ledger.files.is_empty());
    }

    #[test]
    fn test_load_corrupt_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Ledger::load(&path), Err(LedgerError::Parse(_))));
    }

    #[test]
    fn test_content_hash() {
        let a = content_hash(b"lecture one");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_hash(b"lecture one"));
        assert_ne!(a, content_hash(b"lecture onf"));
    }
}

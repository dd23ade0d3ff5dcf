//! File-backed brute-force vector index.
//!
//! Each collection is one `vector_index.json` under
//! `<root>/<collection_id>/`. Every mutation rewrites the file through a
//! temp file and rename.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ChunkRecord, ScoredChunk, VectorIndex, VectorIndexError, VectorRecord};

pub const VECTOR_INDEX_FILE: &str = "vector_index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCollection {
    dimensions: usize,
    /// Sorted by `chunk.seq`
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    chunk: ChunkRecord,
    vector: Vec<f32>,
}

pub struct LocalVectorIndex {
    root: PathBuf,
    // serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl LocalVectorIndex {
    /// `root` is the knowledge base directory holding one folder per collection.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, collection: &str) -> PathBuf {
        self.root.join(collection).join(VECTOR_INDEX_FILE)
    }

    fn read(&self, collection: &str) -> Result<Option<StoredCollection>, VectorIndexError> {
        let path = self.path(collection);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let stored = serde_json::from_str(&content).map_err(|e| VectorIndexError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Some(stored))
    }

    fn read_existing(&self, collection: &str) -> Result<StoredCollection, VectorIndexError> {
        self.read(collection)?
            .ok_or_else(|| VectorIndexError::MissingCollection(collection.to_string()))
    }

    fn write(&self, collection: &str, stored: &StoredCollection) -> Result<(), VectorIndexError> {
        let path = self.path(collection);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let content = serde_json::to_string(stored).map_err(|e| VectorIndexError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> VectorIndexError {
    VectorIndexError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Cosine similarity; zero when either vector has zero norm.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn exists(&self, collection: &str) -> Result<bool, VectorIndexError> {
        Ok(self.path(collection).exists())
    }

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), VectorIndexError> {
        let _guard = self.write_lock.lock().await;
        if self.read(collection)?.is_none() {
            info!(collection, dimensions, "Creating local vector index");
            self.write(
                collection,
                &StoredCollection {
                    dimensions,
                    entries: Vec::new(),
                },
            )?;
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut stored = self.read_existing(collection)?;

        for record in &records {
            if record.vector.len() != stored.dimensions {
                return Err(VectorIndexError::DimensionMismatch {
                    expected: stored.dimensions,
                    got: record.vector.len(),
                });
            }
        }

        let replaced: HashSet<String> = records.iter().map(|r| r.chunk.id.clone()).collect();
        stored.entries.retain(|e| !replaced.contains(&e.chunk.id));
        stored.entries.extend(records.into_iter().map(|r| StoredEntry {
            chunk: r.chunk,
            vector: r.vector,
        }));
        stored.entries.sort_by_key(|e| e.chunk.seq);

        debug!(collection, total = stored.entries.len(), "Upserted vectors");
        self.write(collection, &stored)
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, VectorIndexError> {
        let stored = self.read_existing(collection)?;

        let mut scored: Vec<ScoredChunk> = stored
            .entries
            .into_iter()
            .map(|e| ScoredChunk {
                score: cosine_similarity(vector, &e.vector),
                chunk: e.chunk,
            })
            .collect();
        // ties resolve to the earlier chunk
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.seq.cmp(&b.chunk.seq))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<ChunkRecord>, VectorIndexError> {
        let stored = self.read_existing(collection)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                stored
                    .entries
                    .iter()
                    .find(|e| &e.chunk.id == id)
                    .map(|e| e.chunk.clone())
            })
            .collect())
    }

    async fn delete_source(&self, collection: &str, source: &str) -> Result<(), VectorIndexError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut stored) = self.read(collection)? else {
            return Ok(());
        };
        let before = stored.entries.len();
        stored.entries.retain(|e| e.chunk.source != source);
        let removed = before - stored.entries.len();
        if removed > 0 {
            debug!(collection, source, removed, "Deleted vectors for source");
            self.write(collection, &stored)?;
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), VectorIndexError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(collection);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(collection, "Dropped local vector index");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn count(&self, collection: &str) -> Result<usize, VectorIndexError> {
        Ok(self.read(collection)?.map(|s| s.entries.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, source: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk: ChunkRecord {
                id: format!("chunk_{}", seq),
                seq,
                text: format!("text {}", seq),
                source: source.to_string(),
                order: seq as usize,
            },
            vector,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::new(dir.path());

        assert!(!index.exists("c1").await.unwrap());
        assert_eq!(index.count("c1").await.unwrap(), 0);
        assert!(matches!(
            index.query("c1", &[1.0, 0.0], 3).await,
            Err(VectorIndexError::MissingCollection(_))
        ));
        index.drop_collection("c1").await.unwrap();
        index.delete_source("c1", "a.md").await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_query_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::new(dir.path());
        index.ensure_collection("c1", 2).await.unwrap();
        assert!(index.exists("c1").await.unwrap());

        index
            .upsert(
                "c1",
                vec![
                    record(0, "a.md", vec![1.0, 0.0]),
                    record(1, "a.md", vec![0.7, 0.7]),
                    record(2, "b.md", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(index.count("c1").await.unwrap(), 3);

        let hits = index.query("c1", &[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "chunk_0");
        assert_eq!(hits[1].chunk.id, "chunk_1");

        let fetched = index
            .fetch("c1", &["chunk_2".to_string(), "chunk_9".to_string(), "chunk_0".to_string()])
            .await
            .unwrap();
        let ids: Vec<_> = fetched.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["chunk_2", "chunk_0"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::new(dir.path());
        index.ensure_collection("c1", 2).await.unwrap();

        index.upsert("c1", vec![record(0, "a.md", vec![1.0, 0.0])]).await.unwrap();
        let mut updated = record(0, "a.md", vec![0.0, 1.0]);
        updated.chunk.text = "new".to_string();
        index.upsert("c1", vec![updated]).await.unwrap();

        assert_eq!(index.count("c1").await.unwrap(), 1);
        let fetched = index.fetch("c1", &["chunk_0".to_string()]).await.unwrap();
        assert_eq!(fetched[0].text, "new");
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::new(dir.path());
        index.ensure_collection("c1", 3).await.unwrap();

        let result = index.upsert("c1", vec![record(0, "a.md", vec![1.0])]).await;
        assert!(matches!(
            result,
            Err(VectorIndexError::DimensionMismatch { expected: 3, got: 1 })
        ));
    }

    #[tokio::test]
    async fn test_delete_source_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalVectorIndex::new(dir.path());
        index.ensure_collection("c1", 2).await.unwrap();
        index
            .upsert(
                "c1",
                vec![
                    record(0, "a.md", vec![1.0, 0.0]),
                    record(1, "b.md", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        index.delete_source("c1", "a.md").await.unwrap();
        assert_eq!(index.count("c1").await.unwrap(), 1);
        assert!(index.fetch("c1", &["chunk_0".to_string()]).await.unwrap().is_empty());

        index.drop_collection("c1").await.unwrap();
        assert!(!index.exists("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1").join(VECTOR_INDEX_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[").unwrap();

        let index = LocalVectorIndex::new(dir.path());
        assert!(matches!(
            index.query("c1", &[1.0], 1).await,
            Err(VectorIndexError::Corrupt { .. })
        ));
    }
}

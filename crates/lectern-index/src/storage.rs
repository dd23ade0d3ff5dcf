//! Persistence of per-collection knowledge graphs.
//!
//! Each collection directory holds `knowledge_graph.json` and
//! `graph_metadata.json`. Both are written to a temp file first and renamed
//! into place, so an interrupted save leaves the previous graph readable.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::graph::KnowledgeGraph;

pub const GRAPH_FILE: &str = "knowledge_graph.json";
pub const GRAPH_METADATA_FILE: &str = "graph_metadata.json";

/// Summary written next to the graph after every build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub collection_id: String,
    pub created_at: DateTime<Utc>,
    pub node_count: usize,
    pub edge_count: usize,
    pub model_used: String,
    #[serde(default)]
    pub chunks_processed: usize,
    #[serde(default)]
    pub extraction_failures: usize,
}

impl GraphMetadata {
    pub fn new(collection_id: &str, graph: &KnowledgeGraph, model_used: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            created_at: Utc::now(),
            node_count: graph.node_count(),
            edge_count: graph.edge_count(),
            model_used: model_used.to_string(),
            chunks_processed: 0,
            extraction_failures: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize graph: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Reads and writes graphs under a knowledge base root.
#[derive(Debug, Clone)]
pub struct GraphStore {
    root: PathBuf,
}

impl GraphStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn collection_dir(&self, collection_id: &str) -> PathBuf {
        self.root.join(collection_id)
    }

    pub fn graph_path(&self, collection_id: &str) -> PathBuf {
        self.collection_dir(collection_id).join(GRAPH_FILE)
    }

    pub fn metadata_path(&self, collection_id: &str) -> PathBuf {
        self.collection_dir(collection_id).join(GRAPH_METADATA_FILE)
    }

    /// `Ok(None)` when the collection has no graph yet.
    pub fn load(&self, collection_id: &str) -> Result<Option<KnowledgeGraph>, GraphStoreError> {
        let path = self.graph_path(collection_id);
        let Some(graph) = read_json::<KnowledgeGraph>(&path)? else {
            return Ok(None);
        };
        info!(
            collection = %collection_id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Loaded knowledge graph"
        );
        Ok(Some(graph))
    }

    pub fn load_metadata(&self, collection_id: &str) -> Result<Option<GraphMetadata>, GraphStoreError> {
        read_json(&self.metadata_path(collection_id))
    }

    /// Persist graph and metadata. The graph file is replaced first.
    pub fn save(
        &self,
        collection_id: &str,
        graph: &KnowledgeGraph,
        metadata: &GraphMetadata,
    ) -> Result<(), GraphStoreError> {
        let dir = self.collection_dir(collection_id);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let graph_json = serde_json::to_string_pretty(graph).map_err(GraphStoreError::Serialize)?;
        let metadata_json = serde_json::to_string_pretty(metadata).map_err(GraphStoreError::Serialize)?;

        write_atomic(&self.graph_path(collection_id), &graph_json)?;
        write_atomic(&self.metadata_path(collection_id), &metadata_json)?;

        info!(
            collection = %collection_id,
            nodes = metadata.node_count,
            edges = metadata.edge_count,
            "Saved knowledge graph"
        );
        Ok(())
    }

    /// Remove graph and metadata. Missing files are ignored.
    pub fn delete(&self, collection_id: &str) -> Result<(), GraphStoreError> {
        for path in [self.graph_path(collection_id), self.metadata_path(collection_id)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> GraphStoreError {
    GraphStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, GraphStoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| GraphStoreError::Parse {
            path: path.display().to_string(),
            source: e,
        })
}

fn write_atomic(path: &Path, content: &str) -> Result<(), GraphStoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.add_entity("Python", "Language", "chunk_0");
        graph.add_relationship("Python", "Django", "used_with", "chunk_0");
        graph
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path());
        assert!(store.load("c1").unwrap().is_none());
        assert!(store.load_metadata("c1").unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path());
        let graph = sample_graph();
        let mut metadata = GraphMetadata::new("c1", &graph, "Qwen/Qwen3-14B");
        metadata.chunks_processed = 1;

        store.save("c1", &graph, &metadata).unwrap();
        assert!(!store.graph_path("c1").with_extension("json.tmp").exists());

        let loaded = store.load("c1").unwrap().unwrap();
        assert_eq!(loaded.node_count(), 2);
        assert_eq!(loaded.neighbors("python"), vec!["DJANGO"]);

        let loaded_meta = store.load_metadata("c1").unwrap().unwrap();
        assert_eq!(loaded_meta, metadata);
        assert_eq!(loaded_meta.edge_count, 1);
    }

    #[test]
    fn test_corrupt_graph_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path());
        std::fs::create_dir_all(store.collection_dir("c1")).unwrap();
        std::fs::write(store.graph_path("c1"), "{\"nodes\": [").unwrap();

        assert!(matches!(store.load("c1"), Err(GraphStoreError::Parse { .. })));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path());
        let graph = sample_graph();
        store
            .save("c1", &graph, &GraphMetadata::new("c1", &graph, "m"))
            .unwrap();

        store.delete("c1").unwrap();
        assert!(store.load("c1").unwrap().is_none());
        store.delete("c1").unwrap();
    }
}

//! Query-time graph search.
//!
//! Entities named in the query are looked up in the collection's graph.
//! Their provenance chunks become candidates, and every shortest path
//! between two of them is rendered as a short pseudo-document.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use lectern_providers::LLMProvider;
use tracing::{debug, info, warn};

use crate::extraction::QueryEntityExtractor;
use crate::graph::KnowledgeGraph;

/// Metadata `source` value of path pseudo-documents.
pub const PATH_SOURCE: &str = "knowledge_graph_path";

/// A reasoning path between two query entities.
#[derive(Debug, Clone, PartialEq)]
pub struct PathDocument {
    /// "Found a reasoning path: A -> B -> C"
    pub text: String,
    pub path: Vec<String>,
    /// Edge label for each hop, `path.len() - 1` entries
    pub labels: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PathDocument {
    fn new(path: Vec<String>, graph: &KnowledgeGraph) -> Self {
        let labels: Vec<String> = path
            .windows(2)
            .map(|hop| {
                graph
                    .edge_between(&hop[0], &hop[1])
                    .map(|e| e.label.clone())
                    .unwrap_or_default()
            })
            .collect();
        let rendered = path.join(" -> ");

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), PATH_SOURCE.to_string());
        metadata.insert("path".to_string(), rendered.clone());
        metadata.insert("labels".to_string(), labels.join(", "));

        Self {
            text: format!("Found a reasoning path: {}", rendered),
            path,
            labels,
            metadata,
        }
    }
}

/// What the graph contributes to one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphContext {
    /// Provenance chunks, first-seen order, no duplicates
    pub chunk_ids: Vec<String>,
    pub path_documents: Vec<PathDocument>,
    /// Query entities found in the graph
    pub entities: Vec<String>,
}

impl GraphContext {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty() && self.path_documents.is_empty()
    }
}

struct ChunkCollector<'a> {
    seen: HashSet<&'a str>,
    ordered: Vec<String>,
}

impl<'a> ChunkCollector<'a> {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            ordered: Vec::new(),
        }
    }

    fn add_node(&mut self, graph: &'a KnowledgeGraph, name: &str) {
        if let Some(node) = graph.node(name) {
            for chunk_id in &node.provenance {
                if self.seen.insert(chunk_id.as_str()) {
                    self.ordered.push(chunk_id.clone());
                }
            }
        }
    }
}

/// Build the graph context for already-normalized query entities.
pub fn context_for_entities(entities: &[String], graph: &KnowledgeGraph, expand_neighbors: bool) -> GraphContext {
    let present: Vec<String> = entities
        .iter()
        .filter(|e| graph.contains(e))
        .cloned()
        .collect();
    if present.is_empty() {
        return GraphContext::default();
    }

    let mut chunks = ChunkCollector::new();
    for entity in &present {
        chunks.add_node(graph, entity);
    }

    let mut path_documents = Vec::new();
    for (i, source) in present.iter().enumerate() {
        for target in &present[i + 1..] {
            let paths = graph.all_shortest_paths(source, target);
            if paths.is_empty() {
                debug!(source = %source, target = %target, "No path between entities");
                continue;
            }
            debug!(source = %source, target = %target, paths = paths.len(), "Found shortest paths");
            for path in paths {
                for node in &path {
                    chunks.add_node(graph, node);
                }
                path_documents.push(PathDocument::new(path, graph));
            }
        }
    }

    if expand_neighbors {
        for entity in &present {
            for neighbor in graph.neighbors(entity) {
                chunks.add_node(graph, neighbor);
                for second in graph.neighbors(neighbor) {
                    chunks.add_node(graph, second);
                }
            }
        }
    }

    GraphContext {
        chunk_ids: chunks.ordered,
        path_documents,
        entities: present,
    }
}

pub struct GraphRetriever {
    extractor: QueryEntityExtractor,
    expand_neighbors: bool,
}

impl GraphRetriever {
    pub fn new(llm: Arc<dyn LLMProvider>, expand_neighbors: bool) -> Self {
        Self {
            extractor: QueryEntityExtractor::new(llm),
            expand_neighbors,
        }
    }

    /// Never fails: extraction problems yield an empty context.
    pub async fn query_graph(&self, query: &str, graph: &KnowledgeGraph) -> GraphContext {
        if graph.is_empty() {
            return GraphContext::default();
        }
        let entities = match self.extractor.extract(query).await {
            Ok(entities) => entities,
            Err(reason) => {
                warn!(reason = %reason, "Could not extract entities from query, skipping graph search");
                return GraphContext::default();
            }
        };
        if entities.is_empty() {
            debug!("No entities in query");
            return GraphContext::default();
        }

        let context = context_for_entities(&entities, graph, self.expand_neighbors);
        info!(
            entities = ?context.entities,
            chunks = context.chunk_ids.len(),
            paths = context.path_documents.len(),
            "Graph search complete"
        );
        context
    }
}

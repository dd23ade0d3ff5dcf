//! Entity-relationship knowledge graph for one collection.
//!
//! Nodes are entities keyed by their normalized name; edges are undirected
//! and there is at most one per pair. Every node and edge remembers which
//! chunks asserted it so that reprocessing a document can retract exactly
//! what that document contributed.
//!
//! # Example
//!
//! ```
//! use lectern_index::graph::KnowledgeGraph;
//!
//! let mut graph = KnowledgeGraph::new();
//! graph.add_entity("python", "Language", "chunk_0");
//! graph.add_entity("Django", "Framework", "chunk_0");
//! graph.add_relationship("Python", "django", "used_with", "chunk_0");
//!
//! let paths = graph.all_shortest_paths("PYTHON", "DJANGO");
//! assert_eq!(paths, vec![vec!["PYTHON".to_string(), "DJANGO".to_string()]]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::extraction::Extraction;

/// Type given to nodes first seen as a relationship endpoint.
pub const UNKNOWN_TYPE: &str = "Unknown";

/// Label used when an extraction leaves a relationship unlabelled.
pub const DEFAULT_RELATION: &str = "related_to";

/// Upper bound on paths returned for one pair of entities.
pub const MAX_PATHS_PER_PAIR: usize = 32;

/// Uppercase and trim a surface form. Names shorter than two characters
/// are rejected.
///
/// Different surface forms of the same concept ("Python 3", "Python") stay
/// distinct nodes.
pub fn normalize_name(name: &str) -> Option<String> {
    let normalized = name.trim().to_uppercase();
    if normalized.chars().count() < 2 {
        None
    } else {
        Some(normalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub name: String,
    /// First type seen wins
    pub entity_type: String,
    /// Chunk ids that mention this entity, insertion ordered, no duplicates
    pub provenance: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source: String,
    pub target: String,
    /// Label of the first extraction that produced this edge
    pub label: String,
    /// Every distinct label observed for this pair, first-seen order
    pub labels: Vec<String>,
    /// Chunk ids that asserted this edge
    #[serde(default)]
    pub provenance: Vec<String>,
}

impl RelationshipEdge {
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.source == a && self.target == b) || (self.source == b && self.target == a)
    }

    pub fn other_end(&self, name: &str) -> Option<&str> {
        if self.source == name {
            Some(&self.target)
        } else if self.target == name {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// On-disk shape; the lookup indexes are rebuilt after loading.
#[derive(Deserialize)]
struct GraphFile {
    #[serde(default)]
    nodes: BTreeMap<String, EntityNode>,
    #[serde(default)]
    edges: Vec<RelationshipEdge>,
}

impl From<GraphFile> for KnowledgeGraph {
    fn from(file: GraphFile) -> Self {
        let mut graph = KnowledgeGraph {
            nodes: file.nodes,
            edges: file.edges,
            adjacency: HashMap::new(),
            edge_index: HashMap::new(),
        };
        graph.rebuild_index();
        graph
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphFile")]
pub struct KnowledgeGraph {
    nodes: BTreeMap<String, EntityNode>,
    edges: Vec<RelationshipEdge>,
    /// name -> neighbour names, sorted for deterministic traversal
    #[serde(skip)]
    adjacency: HashMap<String, BTreeSet<String>>,
    /// unordered pair -> position in `edges`
    #[serde(skip)]
    edge_index: HashMap<(String, String), usize>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &EntityNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[RelationshipEdge] {
        &self.edges
    }

    /// Look up a node by any surface form of its name.
    pub fn node(&self, name: &str) -> Option<&EntityNode> {
        self.nodes.get(&normalize_name(name)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    /// Sorted neighbour names.
    pub fn neighbors(&self, name: &str) -> Vec<&str> {
        normalize_name(name)
            .and_then(|n| self.adjacency.get(&n))
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn edge_between(&self, a: &str, b: &str) -> Option<&RelationshipEdge> {
        let key = pair_key(&normalize_name(a)?, &normalize_name(b)?);
        self.edge_index.get(&key).map(|&idx| &self.edges[idx])
    }

    /// Add an entity or attach another chunk to an existing one.
    /// Returns the normalized name, or `None` if the name was rejected.
    pub fn add_entity(&mut self, name: &str, entity_type: &str, chunk_id: &str) -> Option<String> {
        let normalized = normalize_name(name)?;
        let entity_type = entity_type.trim();
        let node = self
            .nodes
            .entry(normalized.clone())
            .or_insert_with(|| EntityNode {
                name: normalized.clone(),
                entity_type: if entity_type.is_empty() {
                    UNKNOWN_TYPE.to_string()
                } else {
                    entity_type.to_string()
                },
                provenance: Vec::new(),
            });
        push_unique(&mut node.provenance, chunk_id);
        Some(normalized)
    }

    /// Ensure a node exists without recording provenance on it.
    fn ensure_endpoint(&mut self, name: &str) {
        self.nodes.entry(name.to_string()).or_insert_with(|| EntityNode {
            name: name.to_string(),
            entity_type: UNKNOWN_TYPE.to_string(),
            provenance: Vec::new(),
        });
    }

    /// Add an undirected relationship. Missing endpoints are created with
    /// type [`UNKNOWN_TYPE`]. Self loops and rejected names are ignored.
    /// Returns whether the edge exists afterwards.
    pub fn add_relationship(&mut self, source: &str, target: &str, label: &str, chunk_id: &str) -> bool {
        let (Some(source), Some(target)) = (normalize_name(source), normalize_name(target)) else {
            return false;
        };
        if source == target {
            return false;
        }
        let label = match label.trim() {
            "" => DEFAULT_RELATION,
            l => l,
        };

        self.ensure_endpoint(&source);
        self.ensure_endpoint(&target);

        let key = pair_key(&source, &target);
        match self.edge_index.get(&key) {
            Some(&idx) => {
                let edge = &mut self.edges[idx];
                push_unique(&mut edge.labels, label);
                push_unique(&mut edge.provenance, chunk_id);
            }
            None => {
                self.edges.push(RelationshipEdge {
                    source: source.clone(),
                    target: target.clone(),
                    label: label.to_string(),
                    labels: vec![label.to_string()],
                    provenance: vec![chunk_id.to_string()],
                });
                self.edge_index.insert(key, self.edges.len() - 1);
                self.adjacency.entry(source.clone()).or_default().insert(target.clone());
                self.adjacency.entry(target).or_default().insert(source);
            }
        }
        true
    }

    /// Fold one chunk's extraction into the graph. A failed extraction
    /// contributes nothing. Merging the same extraction twice is a no-op.
    pub fn merge_extraction(&mut self, chunk_id: &str, extraction: &Extraction) {
        let Extraction::Success {
            entities,
            relationships,
        } = extraction
        else {
            return;
        };
        for entity in entities {
            self.add_entity(&entity.name, &entity.entity_type, chunk_id);
        }
        for rel in relationships {
            self.add_relationship(&rel.source, &rel.target, &rel.label, chunk_id);
        }
    }

    /// Remove every trace of the given chunks. Edges no chunk supports any
    /// more are dropped, then nodes with neither provenance nor edges.
    pub fn retract_chunks(&mut self, chunk_ids: &[String]) {
        if chunk_ids.is_empty() {
            return;
        }
        let retracted: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();

        for node in self.nodes.values_mut() {
            node.provenance.retain(|c| !retracted.contains(c.as_str()));
        }
        for edge in &mut self.edges {
            edge.provenance.retain(|c| !retracted.contains(c.as_str()));
        }
        self.edges.retain(|e| !e.provenance.is_empty());

        let connected: HashSet<&str> = self
            .edges
            .iter()
            .flat_map(|e| [e.source.as_str(), e.target.as_str()])
            .collect();
        let orphans: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.provenance.is_empty() && !connected.contains(n.name.as_str()))
            .map(|n| n.name.clone())
            .collect();
        for name in orphans {
            self.nodes.remove(&name);
        }

        self.rebuild_index();
    }

    /// Rebuild adjacency and the pair index from `edges`.
    pub fn rebuild_index(&mut self) {
        self.adjacency.clear();
        self.edge_index.clear();
        let mut kept = Vec::with_capacity(self.edges.len());
        for edge in self.edges.drain(..) {
            let key = pair_key(&edge.source, &edge.target);
            if edge.source == edge.target || self.edge_index.contains_key(&key) {
                continue;
            }
            self.adjacency
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.target.clone());
            self.adjacency
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.source.clone());
            self.edge_index.insert(key, kept.len());
            kept.push(edge);
        }
        self.edges = kept;

        let endpoints: Vec<String> = self
            .adjacency
            .keys()
            .filter(|name| !self.nodes.contains_key(*name))
            .cloned()
            .collect();
        for name in endpoints {
            self.ensure_endpoint(&name);
        }
    }

    /// Every shortest path between two entities, each as a list of node
    /// names from `from` to `to`. Order is deterministic. Empty when either
    /// end is missing, they are the same node, or they are disconnected.
    pub fn all_shortest_paths(&self, from: &str, to: &str) -> Vec<Vec<String>> {
        let (Some(from), Some(to)) = (normalize_name(from), normalize_name(to)) else {
            return Vec::new();
        };
        if from == to || !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return Vec::new();
        }

        // BFS layering, recording every predecessor on a shortest route
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut preds: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut queue = VecDeque::new();
        depth.insert(from.as_str(), 0);
        queue.push_back(from.as_str());

        while let Some(current) = queue.pop_front() {
            let d = depth[current];
            if let Some(&target_depth) = depth.get(to.as_str()) {
                if d >= target_depth {
                    break;
                }
            }
            let Some(neighbours) = self.adjacency.get(current) else {
                continue;
            };
            for next in neighbours {
                let next = next.as_str();
                match depth.get(next) {
                    None => {
                        depth.insert(next, d + 1);
                        preds.entry(next).or_default().push(current);
                        queue.push_back(next);
                    }
                    Some(&nd) if nd == d + 1 => {
                        preds.entry(next).or_default().push(current);
                    }
                    _ => {}
                }
            }
        }

        if !depth.contains_key(to.as_str()) {
            return Vec::new();
        }

        let mut paths = Vec::new();
        let mut stack = vec![to.as_str()];
        self.collect_paths(&preds, from.as_str(), &mut stack, &mut paths);
        paths.sort();
        paths
    }

    fn collect_paths<'a>(
        &self,
        preds: &HashMap<&'a str, Vec<&'a str>>,
        from: &str,
        stack: &mut Vec<&'a str>,
        paths: &mut Vec<Vec<String>>,
    ) {
        if paths.len() >= MAX_PATHS_PER_PAIR {
            return;
        }
        let Some(&current) = stack.last() else {
            return;
        };
        if current == from {
            paths.push(stack.iter().rev().map(|s| s.to_string()).collect());
            return;
        }
        if let Some(ps) = preds.get(current) {
            for &p in ps {
                stack.push(p);
                self.collect_paths(preds, from, stack, paths);
                stack.pop();
            }
        }
    }
}

//! Terminal and JSON rendering.

use std::collections::BTreeMap;
use std::fmt::Write;

use lectern_index::{DocumentOrigin, GraphMetadata, IngestReport, KnowledgeGraph, RetrievedDocument};
use serde_json::{json, Value};

const PREVIEW_CHARS: usize = 240;
const TOP_ENTITIES: usize = 10;

fn origin_label(origin: DocumentOrigin) -> &'static str {
    match origin {
        DocumentOrigin::Vector => "vector",
        DocumentOrigin::Graph => "graph",
        DocumentOrigin::GraphPath => "graph_path",
    }
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}

pub fn render_report(report: &IngestReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {}", report.collection_id, report.summary());
    let _ = writeln!(
        out,
        "  files: {} total, {} unchanged, {} removed",
        report.files_total, report.files_skipped, report.files_removed
    );
    let _ = writeln!(
        out,
        "  chunks indexed: {} ({} with zero vectors)",
        report.chunks_indexed, report.degraded_embeddings
    );
    let _ = writeln!(
        out,
        "  graph: {} nodes, {} edges, {} failed extractions",
        report.nodes, report.edges, report.extraction_failures
    );
    for (file, reason) in &report.files_failed {
        let _ = writeln!(out, "  failed: {} ({})", file, reason);
    }
    let _ = write!(out, "  took {} ms", report.duration_ms);
    out
}

pub fn render_documents(documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return "No documents found.\n".to_string();
    }

    let mut out = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let mut header = format!("[{}] {}", i + 1, origin_label(doc.origin));
        if let Some(id) = &doc.chunk_id {
            let source = doc.metadata.get("source").map(String::as_str).unwrap_or("?");
            let _ = write!(header, " {} ({})", id, source);
        }
        if let Some(score) = doc.rerank_score {
            let _ = write!(header, " rerank={:.3}", score);
        } else if let Some(score) = doc.score {
            let _ = write!(header, " score={:.3}", score);
        }
        let _ = writeln!(out, "{}", header);
        let _ = writeln!(out, "    {}", preview(&doc.text));
    }
    out
}

pub fn documents_json(documents: &[RetrievedDocument]) -> Value {
    Value::Array(
        documents
            .iter()
            .map(|doc| {
                json!({
                    "text": doc.text,
                    "origin": origin_label(doc.origin),
                    "chunk_id": doc.chunk_id,
                    "score": doc.score,
                    "rerank_score": doc.rerank_score,
                    "metadata": doc.metadata,
                })
            })
            .collect(),
    )
}

pub fn render_graph_stats(collection: &str, graph: &KnowledgeGraph, metadata: Option<&GraphMetadata>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {} nodes, {} edges",
        collection,
        graph.node_count(),
        graph.edge_count()
    );
    if let Some(meta) = metadata {
        let _ = writeln!(
            out,
            "  built {} with {} from {} chunks ({} failed)",
            meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            meta.model_used,
            meta.chunks_processed,
            meta.extraction_failures
        );
    }

    let mut types: BTreeMap<&str, usize> = BTreeMap::new();
    for node in graph.nodes() {
        *types.entry(node.entity_type.as_str()).or_default() += 1;
    }
    if !types.is_empty() {
        let _ = writeln!(out, "  entity types:");
        for (kind, count) in &types {
            let _ = writeln!(out, "    {:<24} {}", kind, count);
        }
    }

    let mut degrees: Vec<(&str, usize)> = graph
        .nodes()
        .map(|n| (n.name.as_str(), graph.neighbors(&n.name).len()))
        .filter(|(_, degree)| *degree > 0)
        .collect();
    degrees.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    if !degrees.is_empty() {
        let _ = writeln!(out, "  most connected:");
        for (name, degree) in degrees.into_iter().take(TOP_ENTITIES) {
            let _ = writeln!(out, "    {:<24} {}", name, degree);
        }
    }
    out
}

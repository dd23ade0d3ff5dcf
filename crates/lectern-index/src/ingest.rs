//! Incremental ingestion of a collection's materials directory.
//!
//! Only files whose content hash differs from the ledger are reprocessed.
//! Each reprocessed file has its chunks fully replaced: old vectors are
//! deleted, old graph provenance retracted. The graph is persisted before
//! the ledger, and the ledger is written last, so an interrupted run is
//! simply retried on the next call. A missing or unreadable graph under a
//! populated ledger triggers a full rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::context::{IngestStage, RagContext};
use crate::extraction::LlmEntityExtractor;
use crate::graph::KnowledgeGraph;
use crate::graph_builder::GraphBuilder;
use crate::ledger::{content_hash, Ledger, LedgerError, LEDGER_FILE};
use crate::loaders::{load_bytes, DocumentKind, LoadedDocument, LoaderError};
use crate::segmenter::Segmenter;
use crate::storage::{GraphMetadata, GraphStoreError};
use crate::vector_index::{ChunkRecord, VectorIndexError, VectorRecord};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Materials directory {path} for collection {collection} does not exist")]
    MissingMaterials { collection: String, path: PathBuf },

    #[error("Failed to scan materials directory: {0}")]
    Scan(#[from] walkdir::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Vector index error: {0}")]
    Index(#[from] VectorIndexError),

    #[error("Knowledge graph storage error: {0}")]
    GraphStore(#[from] GraphStoreError),
}

/// Why a single file could not be processed.
#[derive(Debug, Error)]
enum FileError {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("{0}")]
    Load(#[from] LoaderError),

    #[error("vector index: {0}")]
    Index(#[from] VectorIndexError),
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub collection_id: String,
    /// Files found in the materials directory
    pub files_total: usize,
    /// Files new or changed since the last run
    pub files_changed: usize,
    pub files_processed: usize,
    /// Unchanged files
    pub files_skipped: usize,
    /// `(filename, reason)` for files that will be retried next run
    pub files_failed: Vec<(String, String)>,
    /// Files gone from disk whose data was removed
    pub files_removed: usize,
    pub chunks_indexed: usize,
    /// Chunks stored with a zero vector after embedding failed
    pub degraded_embeddings: usize,
    pub nodes: usize,
    pub edges: usize,
    pub extraction_failures: usize,
    pub duration_ms: u64,
}

impl IngestReport {
    pub fn summary(&self) -> String {
        format!("{} of {} files processed", self.files_processed, self.files_changed)
    }
}

/// A file found on disk.
struct SourceFile {
    /// Relative to the materials directory, `/`-separated
    name: String,
    path: PathBuf,
}

/// A loaded file split into chunk texts.
struct SegmentedFile {
    name: String,
    hash: String,
    texts: Vec<String>,
}

/// A file whose vectors were replaced in this run.
struct ProcessedFile {
    name: String,
    hash: String,
    chunks: Vec<ChunkRecord>,
    previous_chunk_ids: Vec<String>,
}

/// Bring the collection's vectors, graph and ledger up to date with its
/// materials directory.
pub async fn ingest(ctx: &RagContext, collection_id: &str, force_rebuild: bool) -> Result<IngestReport, IngestError> {
    let started = Instant::now();
    let mut report = IngestReport {
        collection_id: collection_id.to_string(),
        ..Default::default()
    };

    let materials = ctx.settings.materials_path(collection_id);
    if !materials.is_dir() {
        return Err(IngestError::MissingMaterials {
            collection: collection_id.to_string(),
            path: materials,
        });
    }
    let ledger_path = ctx.settings.collection_path(collection_id).join(LEDGER_FILE);

    let mut force_rebuild = force_rebuild;
    let mut ledger = match Ledger::load_or_default(&ledger_path) {
        Ok(ledger) => ledger,
        Err(LedgerError::Parse(e)) => {
            // chunk ids can no longer be tracked, start over
            warn!(collection = %collection_id, error = %e, "Ledger is corrupt, rebuilding collection");
            force_rebuild = true;
            Ledger::new()
        }
        Err(e) => return Err(e.into()),
    };

    // every ledger entry must have its chunks in the graph
    let mut existing_graph = None;
    if !force_rebuild {
        match ctx.graph_store.load(collection_id) {
            Ok(Some(graph)) => existing_graph = Some(graph),
            Ok(None) if ledger.files.is_empty() => {}
            Ok(None) => {
                warn!(collection = %collection_id, "Knowledge graph missing for ingested files, rebuilding collection");
                force_rebuild = true;
            }
            Err(e) => {
                warn!(collection = %collection_id, error = %e, "Knowledge graph unreadable, rebuilding collection");
                force_rebuild = true;
            }
        }
    }

    if force_rebuild {
        info!(collection = %collection_id, "Force rebuild: clearing ledger, graph and vectors");
        ledger.clear();
        ctx.graph_store.delete(collection_id)?;
        ctx.vector_index.drop_collection(collection_id).await?;
    }

    ctx.report(IngestStage::Loading, 0.0, "Scanning materials");
    let files = scan_materials(&materials)?;
    report.files_total = files.len();

    let current: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
    let deleted = ledger.find_deleted_files(&current);

    let mut changed = Vec::new();
    for file in files {
        match std::fs::read(&file.path) {
            Ok(bytes) if !ledger.needs_update(&file.name, &content_hash(&bytes)) => {
                report.files_skipped += 1;
            }
            Ok(_) => changed.push(file),
            Err(e) => {
                warn!(file = %file.name, error = %e, "Cannot read file");
                report.files_failed.push((file.name, e.to_string()));
            }
        }
    }
    report.files_changed = changed.len() + report.files_failed.len();

    info!(
        collection = %collection_id,
        total = report.files_total,
        changed = changed.len(),
        deleted = deleted.len(),
        "Change detection complete"
    );

    let mut retracted: Vec<String> = Vec::new();
    for name in &deleted {
        ctx.vector_index.delete_source(collection_id, name).await?;
        if let Some(state) = ledger.remove_file(name) {
            retracted.extend(state.chunk_ids);
        }
        report.files_removed += 1;
        info!(collection = %collection_id, file = %name, "Removed deleted file");
    }

    if changed.is_empty() && deleted.is_empty() && !force_rebuild {
        report.duration_ms = started.elapsed().as_millis() as u64;
        ctx.report(IngestStage::Saving, 1.0, "Nothing to do");
        info!(collection = %collection_id, "{}", report.summary());
        return Ok(report);
    }

    // stages run over every file in turn
    let changed_count = changed.len();
    let mut loaded = Vec::with_capacity(changed_count);
    for (idx, file) in changed.into_iter().enumerate() {
        ctx.report(IngestStage::Loading, fraction(idx, changed_count), format!("Loading {}", file.name));
        match load_file(&file) {
            Ok((hash, documents)) => loaded.push((file, hash, documents)),
            Err(e) => {
                error!(collection = %collection_id, file = %file.name, error = %e, "File processing failed");
                report.files_failed.push((file.name, e.to_string()));
            }
        }
    }

    let segmenter = Segmenter::new(ctx.settings.max_chunk_length);
    let loaded_count = loaded.len();
    let mut segmented = Vec::with_capacity(loaded_count);
    for (idx, (file, hash, documents)) in loaded.into_iter().enumerate() {
        ctx.report(IngestStage::Splitting, fraction(idx, loaded_count), format!("Splitting {}", file.name));
        let texts: Vec<String> = documents
            .iter()
            .flat_map(|doc| segmenter.segment(&doc.text))
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();
        debug!(file = %file.name, chunks = texts.len(), "Segmented");
        segmented.push(SegmentedFile {
            name: file.name,
            hash,
            texts,
        });
    }

    // created on first use; a run where nothing loads leaves the collection uningested
    let mut collection_ready = false;
    let mut processed: Vec<ProcessedFile> = Vec::new();
    let segmented_count = segmented.len();
    for (idx, file) in segmented.into_iter().enumerate() {
        ctx.report(
            IngestStage::Vectorizing,
            fraction(idx, segmented_count),
            format!("Embedding {}", file.name),
        );

        let previous_chunk_ids = ledger
            .get(&file.name)
            .map(|s| s.chunk_ids.clone())
            .unwrap_or_default();

        match index_file(ctx, collection_id, &mut ledger, &mut collection_ready, &file, &mut report).await {
            Ok(chunks) => {
                report.files_processed += 1;
                report.chunks_indexed += chunks.len();
                processed.push(ProcessedFile {
                    name: file.name,
                    hash: file.hash,
                    chunks,
                    previous_chunk_ids,
                });
            }
            Err(e) => {
                error!(collection = %collection_id, file = %file.name, error = %e, "File processing failed");
                report.files_failed.push((file.name, e.to_string()));
            }
        }
    }
    ctx.report(IngestStage::Vectorizing, 1.0, "Vectors indexed");

    // knowledge graph
    let mut graph = existing_graph.unwrap_or_else(KnowledgeGraph::new);
    for file in &processed {
        retracted.extend(file.previous_chunk_ids.iter().cloned());
    }
    graph.retract_chunks(&retracted);

    let new_chunks: Vec<ChunkRecord> = processed.iter().flat_map(|f| f.chunks.iter().cloned()).collect();
    let extractor = LlmEntityExtractor::new(ctx.llm.clone());
    let model = extractor.model().to_string();
    let builder = GraphBuilder::new(Arc::new(extractor), ctx.settings.graph.clone());
    let outcome = builder
        .build_with_progress(collection_id, &mut graph, &new_chunks, |percent| {
            ctx.report(
                IngestStage::GraphExtraction,
                percent / 100.0,
                format!("Extracting entities ({:.0}%)", percent),
            )
        })
        .await;
    report.nodes = outcome.node_count;
    report.edges = outcome.edge_count;
    report.extraction_failures = outcome.extraction_failures;

    ctx.report(IngestStage::Saving, 0.0, "Saving knowledge graph");
    let mut metadata = GraphMetadata::new(collection_id, &graph, &model);
    metadata.chunks_processed = outcome.chunks_processed;
    metadata.extraction_failures = outcome.extraction_failures;
    ctx.graph_store.save(collection_id, &graph, &metadata)?;

    for file in processed {
        let ids = file.chunks.into_iter().map(|c| c.id).collect();
        ledger.record_processed(file.name, file.hash, ids);
    }
    ledger.save(&ledger_path)?;
    ctx.report(IngestStage::Saving, 1.0, "Done");

    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        collection = %collection_id,
        chunks = report.chunks_indexed,
        degraded = report.degraded_embeddings,
        failed = report.files_failed.len(),
        duration_ms = report.duration_ms,
        "{}",
        report.summary()
    );
    Ok(report)
}

fn fraction(done: usize, total: usize) -> f32 {
    done as f32 / total.max(1) as f32
}

/// Read and extract one file. Returns its content hash and documents.
fn load_file(file: &SourceFile) -> Result<(String, Vec<LoadedDocument>), FileError> {
    let bytes = std::fs::read(&file.path)?;
    let hash = content_hash(&bytes);
    let documents = load_bytes(&bytes, DocumentKind::from_path(&file.path), &file.name)?;
    Ok((hash, documents))
}

/// Embed one file's chunks and replace its vectors. Returns the chunks written.
async fn index_file(
    ctx: &RagContext,
    collection_id: &str,
    ledger: &mut Ledger,
    collection_ready: &mut bool,
    file: &SegmentedFile,
    report: &mut IngestReport,
) -> Result<Vec<ChunkRecord>, FileError> {
    if !*collection_ready {
        ctx.vector_index
            .ensure_collection(collection_id, ctx.embedder.dimensions())
            .await?;
        *collection_ready = true;
    }

    let allocated = ledger.allocate_chunk_ids(file.texts.len());

    let embedded = ctx.embedder.embed_with_report(&file.texts).await;
    if embedded.degraded > 0 {
        warn!(file = %file.name, degraded = embedded.degraded, "Some chunks stored with zero vectors");
    }
    report.degraded_embeddings += embedded.degraded;

    let chunks: Vec<ChunkRecord> = allocated
        .into_iter()
        .zip(file.texts.iter().cloned())
        .enumerate()
        .map(|(order, (id, text))| ChunkRecord {
            id: id.id,
            seq: id.seq,
            text,
            source: file.name.clone(),
            order,
        })
        .collect();
    let records: Vec<VectorRecord> = chunks
        .iter()
        .cloned()
        .zip(embedded.vectors)
        .map(|(chunk, vector)| VectorRecord { chunk, vector })
        .collect();

    ctx.vector_index.delete_source(collection_id, &file.name).await?;
    ctx.vector_index.upsert(collection_id, records).await?;
    debug!(file = %file.name, chunks = chunks.len(), "Indexed");

    Ok(chunks)
}

/// Every non-hidden regular file under `root`, sorted by relative name.
fn scan_materials(root: &Path) -> Result<Vec<SourceFile>, walkdir::Error> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(SourceFile {
            name,
            path: entry.path().to_path_buf(),
        });
    }
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("week1")).unwrap();
        std::fs::create_dir_all(root.join(".cache")).unwrap();
        std::fs::write(root.join("week1/intro.md"), "intro").unwrap();
        std::fs::write(root.join("syllabus.txt"), "syllabus").unwrap();
        std::fs::write(root.join(".DS_Store"), "junk").unwrap();
        std::fs::write(root.join(".cache/tmp.md"), "junk").unwrap();

        let names: Vec<String> = scan_materials(root).unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["syllabus.txt", "week1/intro.md"]);
    }

    #[test]
    fn test_summary() {
        let report = IngestReport {
            files_changed: 3,
            files_processed: 2,
            ..Default::default()
        };
        assert_eq!(report.summary(), "2 of 3 files processed");
    }
}

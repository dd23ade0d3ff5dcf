//! Qdrant-backed vector index.
//!
//! One Qdrant collection per course collection, named
//! `<prefix><collection_id>`. Point ids are the numeric chunk sequence.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    GetPointsBuilder, PointId, PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, info};

use super::{parse_chunk_seq, ChunkRecord, ScoredChunk, VectorIndex, VectorIndexError, VectorRecord};

/// Connection settings for Qdrant.
#[derive(Debug, Clone)]
pub struct QdrantIndexConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection_prefix: String,
}

impl Default for QdrantIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_prefix: "lectern-".to_string(),
        }
    }
}

pub struct QdrantVectorIndex {
    client: Qdrant,
    prefix: String,
}

impl QdrantVectorIndex {
    pub fn connect(config: &QdrantIndexConfig) -> Result<Self, VectorIndexError> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder.build()?;

        info!("Connected to Qdrant at {}", config.url);

        Ok(Self {
            client,
            prefix: config.collection_prefix.clone(),
        })
    }

    fn collection_name(&self, collection: &str) -> String {
        format!("{}{}", self.prefix, collection)
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn exists(&self, collection: &str) -> Result<bool, VectorIndexError> {
        Ok(self
            .client
            .collection_exists(self.collection_name(collection))
            .await?)
    }

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), VectorIndexError> {
        if self.exists(collection).await? {
            return Ok(());
        }
        let name = self.collection_name(collection);
        info!("Creating collection: {} with {} dimensions", name, dimensions);
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&name)
                    .vectors_config(VectorParamsBuilder::new(dimensions as u64, Distance::Cosine)),
            )
            .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError> {
        if records.is_empty() {
            debug!("No points to upsert");
            return Ok(());
        }
        debug!("Upserting {} points", records.len());

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|r| PointStruct::new(r.chunk.seq, r.vector, chunk_to_payload(&r.chunk)))
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(self.collection_name(collection), points).wait(true))
            .await?;
        Ok(())
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, VectorIndexError> {
        if !self.exists(collection).await? {
            return Err(VectorIndexError::MissingCollection(collection.to_string()));
        }
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(self.collection_name(collection), vector.to_vec(), k as u64)
                    .with_payload(true),
            )
            .await?;

        let hits: Vec<ScoredChunk> = results
            .result
            .into_iter()
            .filter_map(|p| {
                payload_to_chunk(&p.payload).map(|chunk| ScoredChunk {
                    chunk,
                    score: p.score,
                })
            })
            .collect();
        debug!("Found {} search hits", hits.len());
        Ok(hits)
    }

    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<ChunkRecord>, VectorIndexError> {
        let point_ids: Vec<PointId> = ids
            .iter()
            .filter_map(|id| parse_chunk_seq(id))
            .map(PointId::from)
            .collect();
        if point_ids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .get_points(GetPointsBuilder::new(self.collection_name(collection), point_ids).with_payload(true))
            .await?;

        let mut by_id: HashMap<String, ChunkRecord> = response
            .result
            .into_iter()
            .filter_map(|p| payload_to_chunk(&p.payload))
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn delete_source(&self, collection: &str, source: &str) -> Result<(), VectorIndexError> {
        if !self.exists(collection).await? {
            return Ok(());
        }
        debug!(collection, source, "Deleting points for source");
        self.client
            .delete_points(
                DeletePointsBuilder::new(self.collection_name(collection))
                    .points(Filter::must([Condition::matches("source", source.to_string())]))
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), VectorIndexError> {
        if !self.exists(collection).await? {
            return Ok(());
        }
        let name = self.collection_name(collection);
        info!("Deleting collection: {}", name);
        self.client.delete_collection(&name).await?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, VectorIndexError> {
        if !self.exists(collection).await? {
            return Ok(0);
        }
        let info = self
            .client
            .collection_info(self.collection_name(collection))
            .await?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }
}

fn chunk_to_payload(chunk: &ChunkRecord) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert("chunk_id".to_string(), Value::from(chunk.id.clone()));
    map.insert("seq".to_string(), Value::from(chunk.seq as i64));
    map.insert("text".to_string(), Value::from(chunk.text.clone()));
    map.insert("source".to_string(), Value::from(chunk.source.clone()));
    map.insert("order".to_string(), Value::from(chunk.order as i64));
    map
}

/// `None` when the point lacks a chunk id.
fn payload_to_chunk(map: &HashMap<String, Value>) -> Option<ChunkRecord> {
    let id = extract_string(map.get("chunk_id"))?;
    let seq = extract_integer(map.get("seq"))
        .map(|s| s as u64)
        .or_else(|| parse_chunk_seq(&id))?;
    Some(ChunkRecord {
        seq,
        text: extract_string(map.get("text")).unwrap_or_default(),
        source: extract_string(map.get("source")).unwrap_or_default(),
        order: extract_integer(map.get("order")).unwrap_or(0) as usize,
        id,
    })
}

fn extract_string(value: Option<&Value>) -> Option<String> {
    match value.and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn extract_integer(value: Option<&Value>) -> Option<i64> {
    match value.and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => Some(*i),
        _ => None,
    }
}

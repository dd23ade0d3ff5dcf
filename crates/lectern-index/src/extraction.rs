//! LLM-driven entity and relationship extraction.
//!
//! Chunk extraction and query analysis both send one prompt and parse one
//! JSON reply. Transport errors and unparseable replies become
//! [`Extraction::Failure`] rather than an empty success, so callers can tell
//! "nothing found" from "could not ask".

use std::sync::Arc;

use async_trait::async_trait;
use lectern_providers::{extract_json_value, CompletionRequest, LLMProvider, Message, MessageRole};
use serde_json::Value;
use tracing::{debug, warn};

use crate::graph::normalize_name;

const CHUNK_SYSTEM_PROMPT: &str = "You extract a knowledge graph from course material. \
Reply with JSON only, no prose.";

const CHUNK_PROMPT: &str = r#"Extract the key entities in the text below and the relationships between them.

Text:
---
{text}
---

Return a JSON object with two fields:
1. "entities": a list of objects with "name" (the entity name) and "type" (a category such as concept, technology, person)
2. "relationships": a list of objects with "source" (entity name), "target" (entity name) and "label" (a short description of the relationship)

Example:
{
  "entities": [
    {"name": "Python", "type": "Programming language"},
    {"name": "Machine learning", "type": "Field"}
  ],
  "relationships": [
    {"source": "Python", "target": "Machine learning", "label": "used for"}
  ]
}

Only return the JSON object."#;

const QUERY_PROMPT: &str = r#"Extract the key entity names mentioned in the question below.

Question:
---
{query}
---

Return a JSON object of the form:
{
  "entities": ["entity 1", "entity 2"]
}

Only return the JSON object."#;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub label: String,
}

/// Outcome of extracting one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Success {
        entities: Vec<ExtractedEntity>,
        relationships: Vec<ExtractedRelationship>,
    },
    Failure {
        reason: String,
    },
}

impl Extraction {
    pub fn failure(reason: impl Into<String>) -> Self {
        Extraction::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Extraction::Success { .. })
    }
}

/// Anything that can turn chunk text into entities and relationships.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Extraction;
}

/// Extracts with a chat model at temperature 0.
pub struct LlmEntityExtractor {
    provider: Arc<dyn LLMProvider>,
}

impl LlmEntityExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }
}

#[async_trait]
impl EntityExtractor for LlmEntityExtractor {
    async fn extract(&self, text: &str) -> Extraction {
        let request = CompletionRequest::new(vec![
            Message::new(MessageRole::System, CHUNK_SYSTEM_PROMPT.to_string()),
            Message::new(MessageRole::User, CHUNK_PROMPT.replace("{text}", text)),
        ])
        .with_temperature(0.0);

        match self.provider.complete(request).await {
            Ok(response) => parse_extraction(&response.content),
            Err(e) => {
                warn!(error = %e, "Entity extraction request failed");
                Extraction::failure(e.to_string())
            }
        }
    }
}

/// Parse a chunk extraction reply. Entity and relationship items that do
/// not validate are dropped individually; a reply with no recognisable
/// JSON object is a failure.
pub fn parse_extraction(reply: &str) -> Extraction {
    let Some(value) = extract_json_value(reply) else {
        return Extraction::failure("reply contained no JSON");
    };
    let Some(object) = value.as_object() else {
        return Extraction::failure("reply JSON is not an object");
    };

    let entities: Vec<ExtractedEntity> = list(object.get("entities"))
        .iter()
        .filter_map(parse_entity)
        .collect();
    let relationships: Vec<ExtractedRelationship> = list(object.get("relationships"))
        .iter()
        .filter_map(parse_relationship)
        .collect();

    debug!(
        entities = entities.len(),
        relationships = relationships.len(),
        "Parsed extraction"
    );
    Extraction::Success {
        entities,
        relationships,
    }
}

fn list(value: Option<&Value>) -> &[Value] {
    value
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn text_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn parse_entity(value: &Value) -> Option<ExtractedEntity> {
    // bare strings are accepted as untyped entities
    let (name, entity_type) = match value {
        Value::String(name) => (name.as_str(), ""),
        Value::Object(_) => (text_field(value, "name"), text_field(value, "type")),
        _ => return None,
    };
    let name = normalize_name(name)?;
    let entity_type = match entity_type.trim() {
        "" => crate::graph::UNKNOWN_TYPE.to_string(),
        t => t.to_string(),
    };
    Some(ExtractedEntity { name, entity_type })
}

fn parse_relationship(value: &Value) -> Option<ExtractedRelationship> {
    let source = normalize_name(text_field(value, "source"))?;
    let target = normalize_name(text_field(value, "target"))?;
    if source == target {
        return None;
    }
    let label = match text_field(value, "label").trim() {
        "" => crate::graph::DEFAULT_RELATION.to_string(),
        l => l.to_string(),
    };
    Some(ExtractedRelationship {
        source,
        target,
        label,
    })
}

/// Pulls entity names out of a user query, normalized the same way as
/// ingestion so they match graph nodes.
pub struct QueryEntityExtractor {
    provider: Arc<dyn LLMProvider>,
}

impl QueryEntityExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Normalized, deduplicated entity names in query order. `Err` carries
    /// the failure reason.
    pub async fn extract(&self, query: &str) -> Result<Vec<String>, String> {
        let request = CompletionRequest::new(vec![Message::new(
            MessageRole::User,
            QUERY_PROMPT.replace("{query}", query),
        )])
        .with_temperature(0.0);

        let response = self.provider.complete(request).await.map_err(|e| e.to_string())?;
        parse_query_entities(&response.content)
    }
}

/// Accepts `{"entities": [...]}` or a bare JSON array.
pub fn parse_query_entities(reply: &str) -> Result<Vec<String>, String> {
    let value = extract_json_value(reply).ok_or_else(|| "reply contained no JSON".to_string())?;
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(object) => list(object.get("entities")),
        _ => &[],
    };

    let mut names: Vec<String> = Vec::new();
    for item in items {
        let raw = match item {
            Value::String(s) => s.as_str(),
            Value::Object(_) => text_field(item, "name"),
            _ => continue,
        };
        if let Some(name) = normalize_name(raw) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use lectern_providers::{CompletionResponse, Usage};

    struct CannedProvider {
        reply: Option<String>,
    }

    #[async_trait]
    impl LLMProvider for CannedProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            match &self.reply {
                Some(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    usage: Usage::default(),
                    model: "canned".to_string(),
                }),
                None => Err(anyhow!("connection refused")),
            }
        }

        fn name(&self) -> &str {
            "canned"
        }

        fn model(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_parse_extraction() {
        let reply = r#"<think>hmm</think>
```json
{
  "entities": [
    {"name": "Python", "type": "Language"},
    {"name": "Django"},
    {"name": "x", "type": "Letter"},
    "Flask"
  ],
  "relationships": [
    {"source": "python", "target": "django", "label": "used_with"},
    {"source": "Python", "target": "PYTHON", "label": "is"},
    {"source": "Flask", "target": "Python"}
  ]
}
```"#;
        let Extraction::Success {
            entities,
            relationships,
        } = parse_extraction(reply)
        else {
            panic!("expected success");
        };

        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PYTHON", "DJANGO", "FLASK"]);
        assert_eq!(entities[1].entity_type, "Unknown");
        assert_eq!(relationships.len(), 2);
        assert_eq!(relationships[0].label, "used_with");
        assert_eq!(relationships[1].label, "related_to");
    }

    #[test]
    fn test_parse_extraction_garbage_is_failure() {
        assert!(!parse_extraction("I could not find anything.").is_success());
        assert!(!parse_extraction("[1, 2]").is_success());
    }

    #[test]
    fn test_parse_extraction_missing_fields_is_empty_success() {
        assert_eq!(
            parse_extraction("{}"),
            Extraction::Success {
                entities: vec![],
                relationships: vec![]
            }
        );
    }

    #[test]
    fn test_parse_query_entities() {
        assert_eq!(
            parse_query_entities(r#"{"entities": ["Python", " django ", "python", "a"]}"#).unwrap(),
            vec!["PYTHON", "DJANGO"]
        );
        assert_eq!(parse_query_entities(r#"["Flask"]"#).unwrap(), vec!["FLASK"]);
        assert!(parse_query_entities("no idea").is_err());
    }

    #[tokio::test]
    async fn test_llm_extractor_transport_failure() {
        let extractor = LlmEntityExtractor::new(Arc::new(CannedProvider { reply: None }));
        let result = extractor.extract("Python and Django").await;
        assert!(matches!(result, Extraction::Failure { reason } if reason.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_query_extractor() {
        let extractor = QueryEntityExtractor::new(Arc::new(CannedProvider {
            reply: Some(r#"{"entities": ["Python", "Django"]}"#.to_string()),
        }));
        assert_eq!(
            extractor.extract("How is Python used with Django?").await.unwrap(),
            vec!["PYTHON", "DJANGO"]
        );
    }
}

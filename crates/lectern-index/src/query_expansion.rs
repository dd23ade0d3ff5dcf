//! Optional LLM rewrite of a query before vector search.

use std::sync::Arc;

use lectern_providers::{strip_think_blocks, CompletionRequest, LLMProvider, Message, MessageRole};
use tracing::{debug, warn};

const EXPANSION_PROMPT: &str = "Rewrite the search query below so it retrieves more relevant course material. \
Add closely related keywords, technical terms and synonyms that are likely to appear in matching documents, \
while keeping the original meaning. Reply with the expanded query only.\n\nQuery: {query}\n\nExpanded query:";

/// Upper bound on the expanded query, in characters.
const MAX_EXPANDED_CHARS: usize = 1000;

pub struct QueryExpander {
    provider: Arc<dyn LLMProvider>,
}

impl QueryExpander {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Returns the original query on any failure or empty reply.
    pub async fn expand(&self, query: &str) -> String {
        let request = CompletionRequest::new(vec![Message::new(
            MessageRole::User,
            EXPANSION_PROMPT.replace("{query}", query),
        )])
        .with_temperature(0.3)
        .with_max_tokens(300);

        match self.provider.complete(request).await {
            Ok(response) => {
                let expanded = clean_reply(&response.content);
                if expanded.is_empty() {
                    query.to_string()
                } else {
                    debug!(original = %query, expanded = %expanded, "Expanded query");
                    expanded
                }
            }
            Err(e) => {
                warn!(error = %e, "Query expansion failed, using original query");
                query.to_string()
            }
        }
    }
}

fn clean_reply(reply: &str) -> String {
    let text = strip_think_blocks(reply);
    let text = text.trim();
    let text = text
        .strip_prefix("Expanded query:")
        .map(str::trim)
        .unwrap_or(text);
    text.chars().take(MAX_EXPANDED_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_reply() {
        assert_eq!(
            clean_reply("<think>plan</think>\nExpanded query: django orm models"),
            "django orm models"
        );
        assert_eq!(clean_reply("  \n "), "");
        assert_eq!(clean_reply(&"a".repeat(5000)).len(), MAX_EXPANDED_CHARS);
    }
}

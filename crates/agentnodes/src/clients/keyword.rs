use agentcore::services::{Chunk, KnowledgeRetriever};
use agentcore::NodeError;
use async_trait::async_trait;
use std::collections::HashSet;

/// In-memory knowledge base scored by query term overlap.
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    chunks: Vec<Chunk>,
}

impl KeywordRetriever {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Load from a JSON array of `{"content", "source"}` objects.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl KnowledgeRetriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>, NodeError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Chunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let hits = terms(&chunk.content).intersection(&query_terms).count();
                (hits > 0).then(|| Chunk {
                    score: hits as f32 / query_terms.len() as f32,
                    ..chunk.clone()
                })
            })
            .collect();

        // stable: ties keep insertion order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb() -> KeywordRetriever {
        KeywordRetriever::from_json(
            r#"[
                {"content": "Refunds are issued within 5 days.", "source": "refunds.md"},
                {"content": "Shipping takes a week.", "source": "shipping.md"},
                {"content": "Refund requests need an order number and refund reason.", "source": "faq.md"}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_best_matches_first() {
        let chunks = kb().retrieve("refund order number", 2).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source.as_deref(), Some("faq.md"));

        let chunks = kb().retrieve("how long until refunds or shipping", 5).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.score > 0.0));
    }

    #[tokio::test]
    async fn test_no_overlap_is_empty() {
        assert!(kb().retrieve("weather today", 3).await.unwrap().is_empty());
        assert!(kb().retrieve("", 3).await.unwrap().is_empty());
        assert!(KeywordRetriever::default().retrieve("refund", 3).await.unwrap().is_empty());
    }
}

//! Hybrid text retrieval: lexical and dense-vector sub-queries run
//! concurrently against the knowledge index, scores are normalized per
//! hit-set and fused by weighted sum, duplicates collapse to the higher
//! fused score.
//!
//! Degradation ladder: no embedding → lexical only; index down → empty
//! list. Nothing here ever aborts the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::clients::{Embedder, SearchHit, TextIndex};
use crate::config::RetrievalSettings;
use crate::models::{Knowledge, KnowledgeSource};

/// Dense-vector field of the knowledge index documents.
const VECTOR_FIELD: &str = "content_vector";

pub struct TextRetriever {
    es: Arc<dyn TextIndex>,
    embedder: Arc<dyn Embedder>,
    index: String,
    settings: RetrievalSettings,
    enabled: bool,
}

impl TextRetriever {
    pub fn new(
        es: Arc<dyn TextIndex>,
        embedder: Arc<dyn Embedder>,
        index: impl Into<String>,
        settings: RetrievalSettings,
        enabled: bool,
    ) -> Self {
        TextRetriever { es, embedder, index: index.into(), settings, enabled }
    }

    pub async fn retrieve(&self, question: &str, top_k: usize) -> Vec<Knowledge> {
        if !self.enabled || question.trim().is_empty() {
            return Vec::new();
        }
        let top_k = if top_k == 0 { self.settings.top_k } else { top_k };
        let fetch = top_k * 3;

        let vector = match self.embedder.embed(&[question.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("embedding unavailable, lexical-only retrieval: {}", e);
                None
            }
        };

        let (lexical, dense) = tokio::join!(
            self.lexical_search(question, fetch),
            self.vector_search(vector, fetch)
        );

        let fused = fuse_hits(
            &lexical,
            &dense,
            self.settings.lexical_weight,
            self.settings.vector_weight,
        );

        let mut knowledge: Vec<Knowledge> = fused
            .into_iter()
            .map(|(hit, score)| hit_to_knowledge(hit, score))
            .collect();
        knowledge.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        knowledge.truncate(top_k);

        tracing::info!(
            "text retrieval: {} passages (lexical={}, vector={})",
            knowledge.len(),
            lexical.len(),
            dense.len()
        );
        knowledge
    }

    async fn lexical_search(&self, question: &str, size: usize) -> Vec<SearchHit> {
        let query = json!({ "match": { "content": question } });
        match self.es.search(&self.index, query, size).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("lexical search failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn vector_search(&self, vector: Option<Vec<f32>>, size: usize) -> Vec<SearchHit> {
        let Some(vector) = vector else {
            return Vec::new();
        };
        match self.es.knn(&self.index, VECTOR_FIELD, &vector, size).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("vector search failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Normalize each hit-set to [0, 1] by max-score division, combine by
/// weighted sum and de-duplicate by document id (keeping the combined
/// score when a document appears on both sides).
pub fn fuse_hits(
    lexical: &[SearchHit],
    dense: &[SearchHit],
    lexical_weight: f64,
    vector_weight: f64,
) -> Vec<(SearchHit, f64)> {
    fn max_score(hits: &[SearchHit]) -> f64 {
        hits.iter().map(|h| h.score).fold(0.0, f64::max)
    }

    let lex_max = max_score(lexical);
    let vec_max = max_score(dense);

    let mut by_id: HashMap<String, (SearchHit, f64)> = HashMap::new();

    for hit in lexical {
        let normalized = if lex_max > 0.0 { hit.score / lex_max } else { 0.0 };
        by_id.insert(hit.id.clone(), (hit.clone(), normalized * lexical_weight));
    }

    for hit in dense {
        let normalized = if vec_max > 0.0 { hit.score / vec_max } else { 0.0 };
        let weighted = normalized * vector_weight;
        by_id
            .entry(hit.id.clone())
            .and_modify(|(_, score)| *score += weighted)
            .or_insert((hit.clone(), weighted));
    }

    by_id.into_values().collect()
}

fn hit_to_knowledge(hit: SearchHit, score: f64) -> Knowledge {
    let title = hit.source["title"]
        .as_str()
        .or_else(|| hit.source["source_standard"].as_str())
        .unwrap_or_default()
        .to_string();
    let content = hit.source["content"].as_str().unwrap_or_default().to_string();
    Knowledge {
        id: hit.id,
        title,
        content,
        score,
        source: KnowledgeSource::Text,
        metadata: hit.source,
    }
}

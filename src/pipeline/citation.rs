//! Post-stream citation matching: one LLM call deciding which retrieved
//! passages the final answer actually drew on. Failures are silent — the
//! answer has already been delivered.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::clients::{ChatModel, ChatRequest};
use crate::config::{LlmScenario, PromptSettings};
use crate::models::Knowledge;

use super::prompt::truncate_chars;

/// Citation content is clipped to this many chars per entry on the wire.
const CITATION_CONTENT_MAX: usize = 500;
/// Candidate snippets shown to the matcher.
const CANDIDATE_PREVIEW_MAX: usize = 200;

pub struct CitationMatcher {
    llm: Arc<dyn ChatModel>,
    prompts: Arc<PromptSettings>,
    scenario: LlmScenario,
    enabled: bool,
}

fn index_array_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\[\]]*\]").expect("static regex"))
}

impl CitationMatcher {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        prompts: Arc<PromptSettings>,
        scenario: LlmScenario,
        enabled: bool,
    ) -> Self {
        CitationMatcher { llm, prompts, scenario, enabled }
    }

    /// Subset of `candidates` cited by `answer`, in candidate order.
    pub async fn matched(&self, answer: &str, candidates: &[Knowledge]) -> Vec<Knowledge> {
        if !self.enabled || candidates.is_empty() || answer.trim().is_empty() {
            return Vec::new();
        }

        let listing: String = candidates
            .iter()
            .enumerate()
            .map(|(i, k)| {
                format!(
                    "{}. 【{}】 {}\n",
                    i + 1,
                    k.title,
                    truncate_chars(&k.content, CANDIDATE_PREVIEW_MAX)
                )
            })
            .collect();

        let user_prompt = self
            .prompts
            .citation_prompt
            .replace("{answer}", answer)
            .replace("{candidates}", &listing);
        let req = ChatRequest::for_scenario(&self.scenario, None, &user_prompt);

        let output = match self.llm.complete(req).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("citation matching failed (non-fatal): {}", e);
                return Vec::new();
            }
        };

        let indices = parse_indices(&output, candidates.len());
        indices
            .into_iter()
            .map(|i| candidates[i - 1].clone())
            .collect()
    }
}

/// Cited 1-based indices parsed from the matcher output, deduplicated and
/// bounds-checked, in ascending order.
pub fn parse_indices(output: &str, candidate_count: usize) -> Vec<usize> {
    let Some(m) = index_array_regex().find(output) else {
        return Vec::new();
    };
    let parsed: Vec<usize> = match serde_json::from_str::<Vec<i64>>(m.as_str()) {
        Ok(values) => values
            .into_iter()
            .filter(|v| *v >= 1 && (*v as usize) <= candidate_count)
            .map(|v| v as usize)
            .collect(),
        Err(_) => return Vec::new(),
    };

    let mut seen = std::collections::BTreeSet::new();
    let mut indices: Vec<usize> = parsed.into_iter().filter(|i| seen.insert(*i)).collect();
    indices.sort_unstable();
    indices
}

/// Wire format of one cited passage.
pub fn format_citation(k: &Knowledge) -> String {
    let content = truncate_chars(&k.content, CITATION_CONTENT_MAX);
    if k.title.is_empty() {
        content
    } else {
        format!("【{}】\n{}", k.title, content)
    }
}

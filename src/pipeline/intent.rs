//! Lightweight intent classification feeding the announcement subtask of
//! the text flow. Never fails: parsing or transport problems degrade to
//! `text_query`.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::clients::{ChatModel, ChatRequest};
use crate::config::{LlmScenario, PromptSettings};
use crate::models::{Intent, IntentKind};

pub struct IntentClassifier {
    llm: Arc<dyn ChatModel>,
    prompts: Arc<PromptSettings>,
    scenario: LlmScenario,
    enabled: bool,
}

fn json_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{[^{}]*"intent_type"[^{}]*\}"#).expect("static regex"))
}

impl IntentClassifier {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        prompts: Arc<PromptSettings>,
        scenario: LlmScenario,
        enabled: bool,
    ) -> Self {
        IntentClassifier { llm, prompts, scenario, enabled }
    }

    pub async fn classify(&self, question: &str) -> Intent {
        let fallback = Intent {
            kind: IntentKind::TextQuery,
            confidence: 0.0,
            metadata: serde_json::Value::Null,
        };

        if !self.enabled {
            return fallback;
        }

        let user_prompt = self.prompts.intent_recognition_prompt.replace("{query}", question);
        let req = ChatRequest::for_scenario(&self.scenario, None, &user_prompt);

        match self.llm.complete(req).await {
            Ok(output) => parse_intent(&output).unwrap_or(fallback),
            Err(e) => {
                tracing::warn!("intent classification failed, defaulting to text_query: {}", e);
                fallback
            }
        }
    }
}

pub fn parse_intent(output: &str) -> Option<Intent> {
    let m = json_object_regex().find(output)?;
    let jv: serde_json::Value = serde_json::from_str(m.as_str()).ok()?;

    let kind = match jv["intent_type"].as_str()? {
        "graph_query" | "neo4j_query" => IntentKind::GraphQuery,
        "hybrid_query" => IntentKind::HybridQuery,
        "text_query" | "es_query" => IntentKind::TextQuery,
        _ => return None,
    };
    let confidence = jv["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);

    Some(Intent { kind, confidence, metadata: jv })
}

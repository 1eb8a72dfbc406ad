//! LLM intent routing: one classification call deciding which retrieval
//! path serves a question. Failures always degrade to `none` — the
//! retrieval path still runs.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::clients::{ChatModel, ChatRequest};
use crate::config::{LlmScenario, PromptSettings};
use crate::models::{ChatTurn, RoutingDecision};

use super::prompt;

pub struct IntentRouter {
    llm: Arc<dyn ChatModel>,
    prompts: Arc<PromptSettings>,
    scenario: LlmScenario,
}

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(graph|text|hybrid|none)\b").expect("static regex"))
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn ChatModel>, prompts: Arc<PromptSettings>, scenario: LlmScenario) -> Self {
        IntentRouter { llm, prompts, scenario }
    }

    pub async fn route(&self, question: &str, history: &[ChatTurn]) -> RoutingDecision {
        let user_prompt = self.build_prompt(question, history);
        let req = ChatRequest::for_scenario(
            &self.scenario,
            Some(&self.prompts.router_system_prompt),
            &user_prompt,
        );

        match self.llm.complete(req).await {
            Ok(output) => {
                let decision = parse_decision(&output);
                tracing::info!("router: question routed to '{}'", decision.as_str());
                decision
            }
            Err(e) => {
                tracing::warn!("router: llm call failed, degrading to none: {}", e);
                RoutingDecision::None
            }
        }
    }

    fn build_prompt(&self, question: &str, history: &[ChatTurn]) -> String {
        // Up to two previous turns, with framing markup removed so the
        // router sees clean text.
        let mut context = String::new();
        for turn in history.iter().rev().take(2).rev() {
            let content = if turn.role == "assistant" {
                prompt::strip_markup(&turn.content)
            } else {
                turn.content.clone()
            };
            let speaker = if turn.role == "assistant" { "助手" } else { "用户" };
            context.push_str(&format!("{}: {}\n", speaker, content));
        }
        if context.is_empty() {
            context.push_str("无历史对话");
        }

        self.prompts
            .router_prompt
            .replace("{history}", context.trim_end())
            .replace("{query}", question)
    }
}

/// First line matching `^(graph|text|hybrid|none)\b`, case-insensitively.
/// Anything else is `none`.
pub fn parse_decision(output: &str) -> RoutingDecision {
    for line in output.lines() {
        let line = line.trim();
        if let Some(m) = label_regex().captures(line) {
            return match m[1].to_lowercase().as_str() {
                "graph" => RoutingDecision::Graph,
                "text" => RoutingDecision::Text,
                "hybrid" => RoutingDecision::Hybrid,
                _ => RoutingDecision::None,
            };
        }
    }
    RoutingDecision::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_label() {
        assert_eq!(parse_decision("graph"), RoutingDecision::Graph);
        assert_eq!(parse_decision("text\n理由：……"), RoutingDecision::Text);
        assert_eq!(parse_decision("hybrid 需要两类知识"), RoutingDecision::Hybrid);
        assert_eq!(parse_decision("none"), RoutingDecision::None);
    }

    #[test]
    fn case_insensitive_and_skips_prose_lines() {
        assert_eq!(parse_decision("GRAPH"), RoutingDecision::Graph);
        assert_eq!(parse_decision("分析如下。\nHybrid: 两类都需要"), RoutingDecision::Hybrid);
    }

    #[test]
    fn word_boundary_is_respected() {
        // "textual" is not the label "text".
        assert_eq!(parse_decision("textual analysis follows"), RoutingDecision::None);
        assert_eq!(parse_decision("graphs are useful"), RoutingDecision::None);
    }

    #[test]
    fn garbage_and_empty_degrade_to_none() {
        assert_eq!(parse_decision(""), RoutingDecision::None);
        assert_eq!(parse_decision("我不知道该怎么路由"), RoutingDecision::None);
        assert_eq!(parse_decision("{\"decision\": 42}"), RoutingDecision::None);
    }
}

//! Augmented-prompt assembly.
//!
//! History is limited to the last two turns with framing markup stripped;
//! each block has a hard character bound and the final prompt is tail-cut
//! below the model's context window. All cuts are char-boundary safe.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::ChatTurn;

pub const HISTORY_MAX_CHARS: usize = 60_000;
pub const KNOWLEDGE_MAX_CHARS: usize = 8_000;
pub const PROMPT_MAX_CHARS: usize = 98_304 - 200;

/// Last two turns = up to four messages (user + assistant pairs).
const HISTORY_MAX_MESSAGES: usize = 4;

fn think_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn knowledge_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<knowledge>.*?</knowledge>").expect("static regex"))
}

fn blank_lines_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("static regex"))
}

/// Remove embedded `<think>…</think>` and `<knowledge>…</knowledge>`
/// blocks and squeeze the leftover blank lines. Stored assistant turns
/// carry the full framed stream; prompts must not.
pub fn strip_markup(content: &str) -> String {
    let without_think = think_block_regex().replace_all(content, "");
    let without_knowledge = knowledge_block_regex().replace_all(&without_think, "");
    let cleaned = without_knowledge
        .replace("<data>", "")
        .replace("</data>", "");
    blank_lines_regex()
        .replace_all(cleaned.trim(), "\n")
        .into_owned()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

pub struct PromptBuilder {
    system_prompt: String,
    template: String,
}

impl PromptBuilder {
    pub fn new(system_prompt: impl Into<String>, template: impl Into<String>) -> Self {
        PromptBuilder { system_prompt: system_prompt.into(), template: template.into() }
    }

    pub fn build(&self, history: &[ChatTurn], question: &str, knowledge: &str) -> String {
        let skip = history.len().saturating_sub(HISTORY_MAX_MESSAGES);
        let mut history_parts = Vec::new();
        for turn in &history[skip..] {
            let speaker = if turn.role == "user" { "用户" } else { "助手" };
            let cleaned = strip_markup(&turn.content);
            if !cleaned.trim().is_empty() {
                history_parts.push(format!("{}: {}", speaker, cleaned));
            }
        }
        let history_text = if history_parts.is_empty() {
            "无历史对话".to_string()
        } else {
            truncate_chars(&history_parts.join("\n"), HISTORY_MAX_CHARS)
        };

        let knowledge_text = if knowledge.trim().is_empty() {
            "无相关知识".to_string()
        } else {
            truncate_chars(knowledge, KNOWLEDGE_MAX_CHARS)
        };

        let prompt = self
            .template
            .replace("{system_prompt}", &self.system_prompt)
            .replace("{history}", &history_text)
            .replace("{knowledge}", &knowledge_text)
            .replace("{query}", question);

        truncate_chars(&prompt, PROMPT_MAX_CHARS)
    }
}

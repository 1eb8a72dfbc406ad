//! Graph retrieval: translate a question into graph-query statements and
//! stream framed reasoning plus a summary of the executed results.
//!
//! Stages: intent parse (LLM, streamed as think) → few-shot example lookup
//! (examples index) → batched query generation (LLM, streamed as think) →
//! execution (row-capped) → summary (LLM, streamed as data). Every stage
//! failure is recoverable: the retriever notes it in the think channel and
//! closes with an empty data block.

use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use regex::Regex;
use serde_json::{json, Value};

use crate::clients::{ChatModel, ChatRequest, Embedder, GraphEngine, TextIndex};
use crate::config::{LlmScenarios, PromptSettings, RetrievalSettings};
use crate::error::AppError;

use super::frames::FrameSink;
use super::orchestrator::FlowOutcome;

/// Hard cap on rows kept per executed statement.
const MAX_ROWS: usize = 100;
/// At most this many intents are pursued per question.
const MAX_INTENTS: usize = 3;

/// Marker the generation prompts demand before the JSON payload.
const JSON_MARKER: &str = "3.以下是json格式的解析结果：";

pub struct GraphRetriever {
    llm: Arc<dyn ChatModel>,
    es: Arc<dyn TextIndex>,
    graph: Arc<dyn GraphEngine>,
    embedder: Arc<dyn Embedder>,
    prompts: Arc<PromptSettings>,
    scenarios: Arc<LlmScenarios>,
    example_index: String,
    example_top_k: usize,
    enabled: bool,
}

struct IntentPlan {
    intent_item: String,
    examples: Vec<(String, String)>,
    cypher: String,
}

impl GraphRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn ChatModel>,
        es: Arc<dyn TextIndex>,
        graph: Arc<dyn GraphEngine>,
        embedder: Arc<dyn Embedder>,
        prompts: Arc<PromptSettings>,
        scenarios: Arc<LlmScenarios>,
        example_index: impl Into<String>,
        retrieval: &RetrievalSettings,
        enabled: bool,
    ) -> Self {
        GraphRetriever {
            llm,
            es,
            graph,
            embedder,
            prompts,
            scenarios,
            example_index: example_index.into(),
            example_top_k: retrieval.example_top_k.max(1),
            enabled,
        }
    }

    async fn stream_think_llm(
        &self,
        req: ChatRequest,
        sink: &FrameSink,
    ) -> Result<Option<String>, AppError> {
        let mut stream = self.llm.stream_chat(req).await?;
        let mut raw = String::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            raw.push_str(&chunk);
            if !sink.think(chunk).await {
                return Ok(None);
            }
        }
        Ok(Some(raw))
    }

    async fn parse_intents(
        &self,
        question: &str,
        sink: &FrameSink,
    ) -> Result<Option<Vec<String>>, AppError> {
        let user_prompt = format!("[用户问题]\n{}\n", question);
        let req = ChatRequest::for_scenario(
            &self.scenarios.intent,
            Some(&self.prompts.graph_intent_prompt),
            &user_prompt,
        );

        let Some(raw) = self.stream_think_llm(req, sink).await? else {
            return Ok(None);
        };

        let intents = extract_marked_array(&raw)
            .map(|items| {
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => map
                            .get("intent_item")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        Value::String(s) if !s.is_empty() => Some(s),
                        _ => None,
                    })
                    .take(MAX_INTENTS)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Some(intents))
    }

    async fn match_examples(&self, intent_item: &str) -> Vec<(String, String)> {
        let query = json!({ "match": { "question": intent_item } });
        let mut hits = match self
            .es
            .search(&self.example_index, query, self.example_top_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("example lookup failed for intent '{}': {}", intent_item, e);
                Vec::new()
            }
        };

        // Lexical miss — try dense similarity over the example questions.
        if hits.is_empty() {
            if let Ok(vectors) = self.embedder.embed(&[intent_item.to_string()]).await {
                if let Some(vector) = vectors.first() {
                    hits = self
                        .es
                        .knn(&self.example_index, "embedding_question", vector, self.example_top_k)
                        .await
                        .unwrap_or_default();
                }
            }
        }

        hits.into_iter()
            .filter_map(|hit| {
                let question = hit.source["question"].as_str()?.to_string();
                let answer = hit.source["cypher"]
                    .as_str()
                    .or_else(|| hit.source["answer"].as_str())?
                    .trim()
                    .to_string();
                if answer.is_empty() {
                    None
                } else {
                    Some((question, answer))
                }
            })
            .collect()
    }

    async fn generate_statements(
        &self,
        question: &str,
        plans: &mut [IntentPlan],
        sink: &FrameSink,
    ) -> Result<bool, AppError> {
        let mut intents_text = String::new();
        for (i, plan) in plans.iter().enumerate() {
            let mut examples_text = String::new();
            for (j, (q, c)) in plan.examples.iter().enumerate() {
                examples_text.push_str(&format!("  示例{}:\n  问题: {}\n  Cypher: {}\n\n", j + 1, q, c));
            }
            intents_text.push_str(&format!(
                "意图{}: {}\n参考示例:\n{}\n",
                i + 1,
                plan.intent_item,
                examples_text
            ));
        }

        let user_prompt = format!(
            "[用户原始问题]\n{}\n\n[需要生成Cypher的意图列表]\n{}\n\
             重要提示: 请严格参考示例中出现的节点标签、属性和关系类型进行Cypher生成，\
             如果要匹配节点属性，一定要使用 where 节点.属性 contains 'xx'，\
             严禁创建或使用示例中没有出现的节点标签、属性或关系类型。\n\
             请为每个意图生成对应的Cypher查询语句。",
            question, intents_text
        );
        let req = ChatRequest::for_scenario(
            &self.scenarios.query_generation,
            Some(&self.prompts.query_generation_prompt),
            &user_prompt,
        );

        let Some(raw) = self.stream_think_llm(req, sink).await? else {
            return Ok(false);
        };

        if let Some(items) = extract_marked_array(&raw) {
            for item in items {
                let Some(intent_item) = item["intent_item"].as_str() else {
                    continue;
                };
                let cypher = strip_code_fences(item["cypher"].as_str().unwrap_or_default());
                if let Some(plan) = plans.iter_mut().find(|p| p.intent_item == intent_item) {
                    plan.cypher = cypher;
                }
            }
        }
        Ok(true)
    }

    async fn execute_plans(&self, plans: &[IntentPlan]) -> (Vec<Value>, Vec<Value>) {
        let mut summarizable = Vec::new();
        let mut all_rows = Vec::new();

        for plan in plans {
            if plan.cypher.is_empty() {
                continue;
            }
            match self.graph.execute(&plan.cypher, json!({})).await {
                Ok(mut rows) => {
                    rows.truncate(MAX_ROWS);
                    tracing::info!(
                        "graph query returned {} rows for intent '{}'",
                        rows.len(),
                        plan.intent_item
                    );
                    all_rows.extend(rows.iter().cloned());
                    summarizable.push(json!({
                        "intent_item": plan.intent_item,
                        "cypher": plan.cypher,
                        "intent_result": rows,
                    }));
                }
                Err(e) => {
                    tracing::error!("graph query failed for intent '{}': {}", plan.intent_item, e);
                    summarizable.push(json!({
                        "intent_item": plan.intent_item,
                        "cypher": plan.cypher,
                        "intent_result": [],
                    }));
                }
            }
        }
        (summarizable, all_rows)
    }

    async fn stream_summary(
        &self,
        question: &str,
        results: &[Value],
        sink: &FrameSink,
    ) -> Result<bool, AppError> {
        let user_prompt = format!(
            "以下是业务图谱查询到的结果：\n{}\n\n以下是用户的问题，请直接回答：\n{}",
            serde_json::to_string(results).unwrap_or_default(),
            question
        );
        let req = ChatRequest::for_scenario(
            &self.scenarios.summary,
            Some(&self.prompts.summary_prompt),
            &user_prompt,
        );

        let mut stream = self.llm.stream_chat(req).await?;
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if !sink.data(chunk).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl GraphRetriever {
    /// Emit the full framed graph-retrieval sequence into `sink`.
    pub async fn emit(&self, question: &str, sink: FrameSink) -> FlowOutcome {
        if !self.enabled {
            if !sink.data("<data>\n图谱检索服务未启用，请检查配置\n</data>\n").await {
                return FlowOutcome::Cancelled;
            }
            return FlowOutcome::Completed;
        }

        if !sink.think("<think>\n").await {
            return FlowOutcome::Cancelled;
        }

        // Stage 1 — intent decomposition, reasoning streamed live.
        let intents = match self.parse_intents(question, &sink).await {
            Ok(Some(intents)) => intents,
            Ok(None) => return FlowOutcome::Cancelled,
            Err(e) => {
                tracing::error!("graph intent parse failed: {}", e);
                return close_empty(&sink, "\n意图解析失败，跳过图谱检索。\n</think>\n").await;
            }
        };
        if intents.is_empty() {
            if !sink.think("\n未能识别有效的查询意图。\n</think>\n").await {
                return FlowOutcome::Cancelled;
            }
            if !sink.data("<data>\n未能识别有效的查询意图\n</data>\n").await {
                return FlowOutcome::Cancelled;
            }
            return FlowOutcome::Completed;
        }

        // Stage 2 — few-shot examples per intent.
        let mut plans = Vec::new();
        for intent_item in intents {
            let examples = self.match_examples(&intent_item).await;
            tracing::info!("intent '{}' matched {} examples", intent_item, examples.len());
            plans.push(IntentPlan { intent_item, examples, cypher: String::new() });
        }

        if plans.iter().all(|p| p.examples.is_empty()) {
            // Empty examples index: degrade to parse-only, no generation.
            return close_empty(&sink, "\n未检索到可参考的查询示例，跳过查询生成。\n</think>\n")
                .await;
        }

        // Stage 3 — batched statement generation, streamed live.
        match self.generate_statements(question, &mut plans, &sink).await {
            Ok(true) => {}
            Ok(false) => return FlowOutcome::Cancelled,
            Err(e) => {
                tracing::error!("graph query generation failed: {}", e);
                return close_empty(&sink, "\n查询生成失败，跳过图谱检索。\n</think>\n").await;
            }
        }
        if !sink.think("\nCypher生成完成。\n</think>\n").await {
            return FlowOutcome::Cancelled;
        }

        // Stage 4 — execution.
        let (summarizable, all_rows) = self.execute_plans(&plans).await;

        // Stage 5 — summary streamed as the data block.
        if !sink.data("<data>\n").await {
            return FlowOutcome::Cancelled;
        }
        match self.stream_summary(question, &summarizable, &sink).await {
            Ok(true) => {}
            Ok(false) => return FlowOutcome::Cancelled,
            Err(e) => {
                tracing::error!("graph summary failed: {}", e);
                if !sink.data("未检索到相关业务信息").await {
                    return FlowOutcome::Cancelled;
                }
            }
        }
        if !sink.data("\n</data>\n").await {
            return FlowOutcome::Cancelled;
        }

        // Stage 6 — row manifest.
        if !all_rows.is_empty() {
            let note = format!("<knowledge>\n检索到{}条相关信息\n</knowledge>\n", all_rows.len());
            if !sink.knowledge(note).await {
                return FlowOutcome::Cancelled;
            }
        }

        FlowOutcome::Completed
    }
}

async fn close_empty(sink: &FrameSink, think_note: &str) -> FlowOutcome {
    if !sink.think(think_note).await {
        return FlowOutcome::Cancelled;
    }
    if !sink.data("<data>\n</data>\n").await {
        return FlowOutcome::Cancelled;
    }
    FlowOutcome::Completed
}

// ---------------------------------------------------------------------------
// LLM output parsing
// ---------------------------------------------------------------------------

fn array_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[\s\S]*\]").expect("static regex"))
}

/// Extract the JSON array following the fixed marker; falls back to the
/// first array anywhere in the text.
pub fn extract_marked_array(raw: &str) -> Option<Vec<Value>> {
    let candidate = match raw.split_once(JSON_MARKER) {
        Some((_, after)) => after,
        None => raw,
    };
    let m = array_regex().find(candidate)?;
    serde_json::from_str::<Vec<Value>>(m.as_str()).ok()
}

/// Remove a surrounding markdown code fence from a generated statement.
pub fn strip_code_fences(cypher: &str) -> String {
    let trimmed = cypher.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() > 2 {
        lines[1..lines.len() - 1].join("\n").trim().to_string()
    } else {
        trimmed.trim_matches('`').trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_array_after_marker() {
        let raw = "分析思路：问题只有一个意图。\n3.以下是json格式的解析结果：\n[{\"intent_item\": \"查询河北单位的网络\"}]";
        let items = extract_marked_array(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["intent_item"], "查询河北单位的网络");
    }

    #[test]
    fn falls_back_to_bare_array() {
        let raw = "[{\"intent_item\": \"a\"}, {\"intent_item\": \"b\"}]";
        assert_eq!(extract_marked_array(raw).unwrap().len(), 2);
    }

    #[test]
    fn missing_array_is_none() {
        assert!(extract_marked_array("没有任何JSON输出").is_none());
        assert!(extract_marked_array("").is_none());
    }

    #[test]
    fn strips_code_fences() {
        let fenced = "```cypher\nMATCH (u:Unit) RETURN u.name\n```";
        assert_eq!(strip_code_fences(fenced), "MATCH (u:Unit) RETURN u.name");

        let plain = "MATCH (n) RETURN n";
        assert_eq!(strip_code_fences(plain), plain);

        let bare_fence = "```MATCH (n) RETURN n```";
        assert_eq!(strip_code_fences(bare_fence), "MATCH (n) RETURN n");
    }
}

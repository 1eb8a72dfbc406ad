//! The streaming orchestrator: one task per request that routes the
//! question, fans out to the retrievers, forwards framed output through
//! the scene-appropriate filter and persists the transcript once the
//! stream has closed normally.
//!
//! Sub-flows (the text flow, the graph retriever) produce frames into
//! their own bounded channel; the orchestrator is the single consumer
//! forwarding onto the response channel. A failed forward means the
//! client is gone — the sub-flow is released and persistence is skipped.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clients::{ChatModel, ChatRequest, Embedder, GraphEngine, TextIndex};
use crate::config::{LlmScenarios, Settings};
use crate::models::{ChatTurn, Frame, RoutingDecision};
use crate::store::MessageStore;

use super::citation::{format_citation, CitationMatcher};
use super::frames::{frame_channel, FrameSink, StreamFilter};
use super::graph_retriever::GraphRetriever;
use super::intent::IntentClassifier;
use super::prompt::PromptBuilder;
use super::router::IntentRouter;
use super::text_retriever::TextRetriever;
use super::{
    ChatMode, AUGMENT_MARKER, DATA_CLOSE, DATA_OPEN, GRAPH_PHASE_NOTE, KNOWLEDGE_CLOSE,
    KNOWLEDGE_OPEN, TEXT_PHASE_NOTE, THINK_CLOSE, THINK_PREAMBLE,
};

/// How a flow (or sub-flow) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Completed,
    /// The client went away; the stream was not fully delivered.
    Cancelled,
    /// A terminal error frame was emitted.
    Errored,
}

#[derive(Debug, Clone)]
pub struct ChatStreamRequest {
    pub user_id: String,
    pub session_id: String,
    pub question: String,
    pub mode: ChatMode,
    pub enable_knowledge: bool,
    pub top_k: usize,
}

pub struct Orchestrator {
    llm: Arc<dyn ChatModel>,
    store: Arc<dyn MessageStore>,
    router: IntentRouter,
    intent: IntentClassifier,
    text_retriever: TextRetriever,
    graph_retriever: GraphRetriever,
    prompt_builder: PromptBuilder,
    citation: CitationMatcher,
    scenarios: Arc<LlmScenarios>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        es: Arc<dyn TextIndex>,
        graph: Arc<dyn GraphEngine>,
        store: Arc<dyn MessageStore>,
        settings: &Settings,
    ) -> Self {
        let prompts = Arc::new(settings.prompts.clone());
        let scenarios = Arc::new(settings.scenarios.clone());

        Orchestrator {
            router: IntentRouter::new(llm.clone(), prompts.clone(), scenarios.router.clone()),
            intent: IntentClassifier::new(
                llm.clone(),
                prompts.clone(),
                scenarios.intent.clone(),
                settings.intent_parser_enabled,
            ),
            text_retriever: TextRetriever::new(
                es.clone(),
                embedder.clone(),
                settings.es.knowledge_index.clone(),
                settings.retrieval.clone(),
                settings.knowledge_retrieval_enabled,
            ),
            graph_retriever: GraphRetriever::new(
                llm.clone(),
                es,
                graph,
                embedder,
                prompts.clone(),
                scenarios.clone(),
                settings.es.cypher_index.clone(),
                &settings.retrieval,
                settings.neo4j.enabled,
            ),
            prompt_builder: PromptBuilder::new(
                settings.prompts.system_prompt.clone(),
                settings.prompts.answer_template.clone(),
            ),
            citation: CitationMatcher::new(
                llm.clone(),
                prompts,
                scenarios.citation.clone(),
                settings.knowledge_matching_enabled,
            ),
            llm,
            store,
            scenarios,
        }
    }

    /// Drive one request to completion, emitting frames into `sink`.
    /// Persistence runs after the last frame and only on normal
    /// completion; its failures never affect the delivered stream.
    pub async fn run(self: Arc<Self>, req: ChatStreamRequest, sink: FrameSink) {
        let history: Vec<ChatTurn> = self
            .store
            .get_messages(&req.user_id, &req.session_id)
            .await
            .map(|messages| {
                messages
                    .into_iter()
                    .filter(|m| m.role == "user" || m.role == "assistant")
                    .map(|m| ChatTurn::new(m.role, m.content))
                    .collect()
            })
            .unwrap_or_else(|e| {
                tracing::warn!("history load failed, continuing without context: {}", e);
                Vec::new()
            });

        let mut transcript = String::new();
        let outcome = match req.mode {
            ChatMode::TextOnly => {
                let (handle, rx) = self.spawn_text_flow(
                    req.question.clone(),
                    history,
                    req.enable_knowledge,
                    req.top_k,
                );
                self.forward_subflow(handle, rx, StreamFilter::forward(), &sink, &mut transcript)
                    .await
                    .0
            }
            ChatMode::GraphOnly => {
                let (handle, rx) = self.spawn_graph_flow(req.question.clone());
                self.forward_subflow(handle, rx, StreamFilter::forward(), &sink, &mut transcript)
                    .await
                    .0
            }
            ChatMode::Hybrid => self.hybrid_scene(&req, &history, &sink, &mut transcript).await,
        };

        match outcome {
            FlowOutcome::Completed => self.persist(&req, &transcript).await,
            FlowOutcome::Cancelled => {
                tracing::info!(
                    "stream cancelled for session {}; nothing persisted",
                    req.session_id
                );
            }
            FlowOutcome::Errored => {
                tracing::warn!(
                    "stream ended in error for session {}; nothing persisted",
                    req.session_id
                );
            }
        }
    }

    // ── scene: hybrid ──────────────────────────────────────────────────

    async fn hybrid_scene(
        self: &Arc<Self>,
        req: &ChatStreamRequest,
        history: &[ChatTurn],
        sink: &FrameSink,
        transcript: &mut String,
    ) -> FlowOutcome {
        if !emit(sink, transcript, Frame::think(THINK_PREAMBLE)).await {
            return FlowOutcome::Cancelled;
        }

        let decision = self.router.route(&req.question, history).await;
        let decision_text = match decision {
            RoutingDecision::Graph => "需要检索网络业务知识图谱辅助回答，请稍等....\n",
            RoutingDecision::Text => "需要检索法规标准知识辅助回答，请稍等....\n",
            RoutingDecision::Hybrid => {
                "需要同时检索网络业务知识图谱以及法规标准知识辅助回答，请稍等....\n"
            }
            RoutingDecision::None => "大模型直接生成回答，请稍等....\n",
        };
        if !emit(sink, transcript, Frame::think(decision_text)).await {
            return FlowOutcome::Cancelled;
        }

        match decision {
            RoutingDecision::Graph => {
                let (handle, rx) = self.spawn_graph_flow(req.question.clone());
                self.forward_subflow(handle, rx, StreamFilter::drop_think_block(), sink, transcript)
                    .await
                    .0
            }

            RoutingDecision::Hybrid => {
                if !emit(sink, transcript, Frame::think(GRAPH_PHASE_NOTE)).await {
                    return FlowOutcome::Cancelled;
                }

                let (handle, rx) = self.spawn_graph_flow(req.question.clone());
                let (outcome, filter) = self
                    .forward_subflow(handle, rx, StreamFilter::capture_data(), sink, transcript)
                    .await;
                if outcome != FlowOutcome::Completed {
                    return outcome;
                }

                let scratch = filter.captured().trim().to_string();
                let report = if scratch.is_empty() {
                    "\n未检索到相关业务信息\n".to_string()
                } else {
                    format!("\n检索到的业务信息：\n{}\n", scratch)
                };
                if !emit(sink, transcript, Frame::think(report)).await {
                    return FlowOutcome::Cancelled;
                }
                if !emit(sink, transcript, Frame::think(TEXT_PHASE_NOTE)).await {
                    return FlowOutcome::Cancelled;
                }

                // The captured business data rides into the text path on
                // the question itself.
                let augmented = if scratch.is_empty() {
                    req.question.clone()
                } else {
                    format!("{}{}{}", req.question, AUGMENT_MARKER, scratch)
                };
                let (handle, rx) = self.spawn_text_flow(
                    augmented,
                    history.to_vec(),
                    req.enable_knowledge,
                    req.top_k,
                );
                self.forward_subflow(
                    handle,
                    rx,
                    StreamFilter::drop_preamble(THINK_PREAMBLE),
                    sink,
                    transcript,
                )
                .await
                .0
            }

            RoutingDecision::Text | RoutingDecision::None => {
                let (handle, rx) = self.spawn_text_flow(
                    req.question.clone(),
                    history.to_vec(),
                    req.enable_knowledge,
                    req.top_k,
                );
                self.forward_subflow(
                    handle,
                    rx,
                    StreamFilter::drop_preamble(THINK_PREAMBLE),
                    sink,
                    transcript,
                )
                .await
                .0
            }
        }
    }

    // ── sub-flow plumbing ──────────────────────────────────────────────

    fn spawn_text_flow(
        self: &Arc<Self>,
        question: String,
        history: Vec<ChatTurn>,
        enable_knowledge: bool,
        top_k: usize,
    ) -> (JoinHandle<FlowOutcome>, mpsc::Receiver<Frame>) {
        let (inner, rx) = frame_channel(32);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.text_flow(question, history, enable_knowledge, top_k, inner)
                .await
        });
        (handle, rx)
    }

    fn spawn_graph_flow(
        self: &Arc<Self>,
        question: String,
    ) -> (JoinHandle<FlowOutcome>, mpsc::Receiver<Frame>) {
        let (inner, rx) = frame_channel(32);
        let this = Arc::clone(self);
        let handle =
            tokio::spawn(async move { this.graph_retriever.emit(&question, inner).await });
        (handle, rx)
    }

    /// Forward a sub-flow's frames through `filter` onto the response
    /// channel, accumulating forwarded content into the transcript.
    async fn forward_subflow(
        &self,
        handle: JoinHandle<FlowOutcome>,
        mut rx: mpsc::Receiver<Frame>,
        mut filter: StreamFilter,
        sink: &FrameSink,
        transcript: &mut String,
    ) -> (FlowOutcome, StreamFilter) {
        while let Some(frame) = rx.recv().await {
            if let Some(frame) = filter.apply(frame) {
                transcript.push_str(&frame.content);
                if !sink.send(frame).await {
                    // Client gone: closing our receiver makes the
                    // producer's next send fail, unwinding it promptly.
                    drop(rx);
                    let _ = handle.await;
                    return (FlowOutcome::Cancelled, filter);
                }
            }
        }
        let outcome = handle.await.unwrap_or(FlowOutcome::Errored);
        (outcome, filter)
    }

    // ── text flow ──────────────────────────────────────────────────────

    /// Preamble → concurrent intent announcement + retrieval → prompt →
    /// streamed answer → post-stream citations.
    async fn text_flow(
        self: Arc<Self>,
        question: String,
        history: Vec<ChatTurn>,
        enable_knowledge: bool,
        top_k: usize,
        sink: FrameSink,
    ) -> FlowOutcome {
        if !sink.think(THINK_PREAMBLE).await {
            return FlowOutcome::Cancelled;
        }

        let mut knowledge = Vec::new();
        if enable_knowledge {
            // The announcement subtask runs concurrently with retrieval
            // and drains through a bounded queue.
            let (announce_tx, mut announce_rx) = mpsc::channel::<String>(4);
            {
                let this = Arc::clone(&self);
                let question = question.clone();
                tokio::spawn(async move {
                    let intent = this.intent.classify(&question).await;
                    let line = format!("用户查询意图识别为: {}\n", intent.kind.as_str());
                    let _ = announce_tx.send(line).await;
                });
            }

            knowledge = self.text_retriever.retrieve(&question, top_k).await;

            while let Some(line) = announce_rx.recv().await {
                if !sink.think(line).await {
                    return FlowOutcome::Cancelled;
                }
            }
            if !sink.think(format!("检索到{}条相关知识\n", knowledge.len())).await {
                return FlowOutcome::Cancelled;
            }
        }

        if !sink.think(THINK_CLOSE).await {
            return FlowOutcome::Cancelled;
        }
        if !sink.data(DATA_OPEN).await {
            return FlowOutcome::Cancelled;
        }

        let knowledge_str = knowledge
            .iter()
            .map(|k| k.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.prompt_builder.build(&history, &question, &knowledge_str);
        let req = ChatRequest::for_scenario(&self.scenarios.chat, None, &prompt);

        let mut stream = match self.llm.stream_chat(req).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("answering llm unavailable: {}", e);
                let _ = sink
                    .error(format!("<data>\n抱歉，处理您的请求时出现错误: {}\n</data>", e))
                    .await;
                return FlowOutcome::Errored;
            }
        };

        let mut reply = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => {
                    reply.push_str(&token);
                    if !sink.data(token).await {
                        return FlowOutcome::Cancelled;
                    }
                }
                Err(e) => {
                    tracing::error!("answering llm stream broke: {}", e);
                    let _ = sink
                        .error(format!("<data>\n抱歉，处理您的请求时出现错误: {}\n</data>", e))
                        .await;
                    return FlowOutcome::Errored;
                }
            }
        }

        if !sink.data(DATA_CLOSE).await {
            return FlowOutcome::Cancelled;
        }

        if enable_knowledge && !knowledge.is_empty() {
            let cited = self.citation.matched(&reply, &knowledge).await;
            if !cited.is_empty() {
                if !sink.knowledge(KNOWLEDGE_OPEN).await {
                    return FlowOutcome::Cancelled;
                }
                for item in &cited {
                    if !sink.knowledge(format_citation(item)).await {
                        return FlowOutcome::Cancelled;
                    }
                }
                if !sink.knowledge(KNOWLEDGE_CLOSE).await {
                    return FlowOutcome::Cancelled;
                }
            }
        }

        FlowOutcome::Completed
    }

    // ── persistence ────────────────────────────────────────────────────

    /// Persist the user turn and the assembled assistant turn (the full
    /// framed transcript, exactly as delivered).
    async fn persist(&self, req: &ChatStreamRequest, transcript: &str) {
        if let Err(e) = self
            .store
            .append_message(&req.user_id, &req.session_id, "user", &req.question)
            .await
        {
            tracing::error!("failed to persist user turn: {}", e);
        }
        if transcript.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .append_message(&req.user_id, &req.session_id, "assistant", transcript)
            .await
        {
            tracing::error!("failed to persist assistant turn: {}", e);
        }
    }
}

async fn emit(sink: &FrameSink, transcript: &mut String, frame: Frame) -> bool {
    transcript.push_str(&frame.content);
    sink.send(frame).await
}

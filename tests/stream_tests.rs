//! End-to-end pipeline scenarios over stub adapters: scene dispatch,
//! frame ordering, hybrid filtering, cancellation and degradation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use regsage_backend::clients::{
    ChatModel, ChatRequest, Embedder, GraphEngine, SearchHit, TextIndex, TokenStream,
};
use regsage_backend::config::Settings;
use regsage_backend::error::AppError;
use regsage_backend::models::{
    Frame, StoredMessage, FRAME_DATA, FRAME_ERROR, FRAME_KNOWLEDGE, FRAME_THINK,
};
use regsage_backend::pipeline::{
    frame_channel, ChatMode, ChatStreamRequest, Orchestrator, THINK_CLOSE, THINK_PREAMBLE,
};
use regsage_backend::store::MessageStore;

// ---------------------------------------------------------------------------
// Stub adapters
// ---------------------------------------------------------------------------

/// Scripted LLM: dispatches on prompt content the way the real prompts
/// are worded, so every pipeline stage gets a deterministic reply.
struct StubChat {
    route: &'static str,
    answer_tokens: Vec<&'static str>,
    fail_answering: bool,
    answer_prompts: Mutex<Vec<String>>,
}

impl StubChat {
    fn new(route: &'static str, answer_tokens: Vec<&'static str>) -> Self {
        StubChat {
            route,
            answer_tokens,
            fail_answering: false,
            answer_prompts: Mutex::new(Vec::new()),
        }
    }

    fn recorded_answer_prompts(&self) -> Vec<String> {
        self.answer_prompts.lock().unwrap().clone()
    }
}

fn tokens_stream(tokens: Vec<String>) -> TokenStream {
    futures_util::stream::iter(tokens.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl ChatModel for StubChat {
    async fn stream_chat(&self, req: ChatRequest) -> Result<TokenStream, AppError> {
        let system = req
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user = req
            .messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if system.contains("智能意图解析器") {
            return Ok(tokens_stream(vec![
                "正在分析问题的查询意图。\n".to_string(),
                "3.以下是json格式的解析结果：[{\"intent_item\": \"查询河北单位建设的网络\"}]"
                    .to_string(),
            ]));
        }
        if system.contains("Cypher查询生成专家") {
            return Ok(tokens_stream(vec![
                "参考示例生成查询。\n".to_string(),
                "3.以下是json格式的解析结果：[{\"intent_item\": \"查询河北单位建设的网络\", \
                 \"cypher\": \"MATCH (u:Unit)-[:UNIT_NET]->(n:Netname) WHERE u.name CONTAINS '河北' RETURN u.name, n.name\"}]"
                    .to_string(),
            ]));
        }
        if system.contains("总结摘要") {
            return Ok(tokens_stream(vec![
                "河北单位共建设".to_string(),
                "2个网络".to_string(),
            ]));
        }

        // Answering call.
        self.answer_prompts.lock().unwrap().push(user);
        if self.fail_answering {
            return Err(AppError::Llm { message: "upstream unreachable".into(), transient: false });
        }
        Ok(tokens_stream(
            self.answer_tokens.iter().map(|t| t.to_string()).collect(),
        ))
    }

    async fn complete(&self, req: ChatRequest) -> Result<String, AppError> {
        let user = req
            .messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if user.contains("只输出JSON数组") {
            return Ok("[1, 2]".to_string());
        }
        if user.contains("意图识别专家") {
            return Ok("{\"intent_type\": \"text_query\", \"confidence\": 0.9}".to_string());
        }
        if user.contains("检索路由器") {
            return Ok(self.route.to_string());
        }
        Ok(String::new())
    }
}

struct StubIndex {
    knowledge_index: String,
    example_index: String,
    knowledge_hits: Vec<SearchHit>,
    example_hits: Vec<SearchHit>,
    fail: bool,
    searched_indices: Mutex<Vec<String>>,
}

impl StubIndex {
    fn with_knowledge(settings: &Settings, knowledge_hits: Vec<SearchHit>) -> Self {
        StubIndex {
            knowledge_index: settings.es.knowledge_index.clone(),
            example_index: settings.es.cypher_index.clone(),
            knowledge_hits,
            example_hits: vec![SearchHit {
                id: "ex1".into(),
                score: 9.0,
                source: json!({
                    "question": "河北单位建设了哪些网络?",
                    "answer": "MATCH (u:Unit)-[:UNIT_NET]->(n:Netname) WHERE u.name CONTAINS '河北' RETURN u.name, n.name"
                }),
            }],
            fail: false,
            searched_indices: Mutex::new(Vec::new()),
        }
    }

    fn searched(&self) -> Vec<String> {
        self.searched_indices.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextIndex for StubIndex {
    async fn search(
        &self,
        index: &str,
        _query: Value,
        _size: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        self.searched_indices.lock().unwrap().push(index.to_string());
        if self.fail {
            return Err(AppError::text_index("cluster unreachable", true));
        }
        if index == self.example_index {
            return Ok(self.example_hits.clone());
        }
        if index == self.knowledge_index {
            return Ok(self.knowledge_hits.clone());
        }
        Ok(Vec::new())
    }

    async fn knn(
        &self,
        index: &str,
        _field: &str,
        _vector: &[f32],
        _k: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        if self.fail {
            return Err(AppError::text_index("cluster unreachable", true));
        }
        if index == self.knowledge_index {
            return Ok(self.knowledge_hits.clone());
        }
        Ok(Vec::new())
    }

    async fn index_doc(&self, _index: &str, _doc: Value, _id: Option<&str>) -> Result<(), AppError> {
        Ok(())
    }

    async fn delete_doc(&self, _index: &str, _id: &str) -> Result<(), AppError> {
        Ok(())
    }

    async fn delete_by_query(&self, _index: &str, _query: Value) -> Result<u64, AppError> {
        Ok(0)
    }

    async fn ping(&self) -> bool {
        !self.fail
    }
}

struct StubGraph {
    rows: Vec<Value>,
    statements: Mutex<Vec<String>>,
}

impl StubGraph {
    fn new(rows: Vec<Value>) -> Self {
        StubGraph { rows, statements: Mutex::new(Vec::new()) }
    }

    fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphEngine for StubGraph {
    async fn execute(&self, stmt: &str, _params: Value) -> Result<Vec<Value>, AppError> {
        self.statements.lock().unwrap().push(stmt.to_string());
        Ok(self.rows.clone())
    }

    async fn ping(&self) -> bool {
        true
    }
}

struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|_| vec![0.1_f32; 8]).collect())
    }
}

#[derive(Default)]
struct StubStore {
    appended: Mutex<Vec<(String, String, String, String)>>,
}

impl StubStore {
    fn appended(&self) -> Vec<(String, String, String, String)> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for StubStore {
    async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), AppError> {
        self.appended.lock().unwrap().push((
            user_id.to_string(),
            session_id.to_string(),
            role.to_string(),
            content.to_string(),
        ));
        Ok(())
    }

    async fn get_messages(
        &self,
        _user_id: &str,
        _session_id: &str,
    ) -> Result<Vec<StoredMessage>, AppError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Fixture {
    chat: Arc<StubChat>,
    index: Arc<StubIndex>,
    graph: Arc<StubGraph>,
    store: Arc<StubStore>,
    orchestrator: Arc<Orchestrator>,
}

fn knowledge_hits() -> Vec<SearchHit> {
    vec![
        SearchHit {
            id: "k1".into(),
            score: 12.0,
            source: json!({
                "title": "GB/T 22239-2019",
                "content": "第三级安全要求：应对网络边界进行访问控制。"
            }),
        },
        SearchHit {
            id: "k2".into(),
            score: 8.0,
            source: json!({
                "title": "GB/T 28448-2019",
                "content": "测评要求：应核查访问控制策略配置情况。"
            }),
        },
    ]
}

fn fixture_with(route: &'static str, fail_index: bool) -> Fixture {
    let settings = Settings::default();

    let chat = Arc::new(StubChat::new(route, vec!["等保三级", "要求网络边界具备访问控制能力。"]));
    let mut index = StubIndex::with_knowledge(&settings, knowledge_hits());
    index.fail = fail_index;
    let index = Arc::new(index);
    let graph = Arc::new(StubGraph::new(vec![
        json!({"u.name": "河北单位", "n.name": "办公网"}),
        json!({"u.name": "河北单位", "n.name": "生产网"}),
    ]));
    let store = Arc::new(StubStore::default());

    let orchestrator = Arc::new(Orchestrator::new(
        chat.clone(),
        Arc::new(StubEmbedder),
        index.clone(),
        graph.clone(),
        store.clone(),
        &settings,
    ));

    Fixture { chat, index, graph, store, orchestrator }
}

fn request(question: &str, mode: ChatMode) -> ChatStreamRequest {
    ChatStreamRequest {
        user_id: "u1".into(),
        session_id: "s1".into(),
        question: question.into(),
        mode,
        enable_knowledge: true,
        top_k: 5,
    }
}

async fn collect(fixture: &Fixture, req: ChatStreamRequest) -> Vec<Frame> {
    let (sink, mut rx) = frame_channel(64);
    let run = tokio::spawn(fixture.orchestrator.clone().run(req, sink));

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    run.await.unwrap();
    frames
}

fn concat(frames: &[Frame]) -> String {
    frames.iter().map(|f| f.content.as_str()).collect()
}

/// No think frame after the first data frame; knowledge frames, if any,
/// only after the last data frame.
fn assert_frame_ordering(frames: &[Frame]) {
    if let Some(first_data) = frames.iter().position(|f| f.message_type == FRAME_DATA) {
        assert!(
            frames[first_data..].iter().all(|f| f.message_type != FRAME_THINK),
            "think frame after data frame"
        );
    }
    if let Some(first_knowledge) = frames.iter().position(|f| f.message_type == FRAME_KNOWLEDGE) {
        let last_data = frames
            .iter()
            .rposition(|f| f.message_type == FRAME_DATA)
            .expect("knowledge without data");
        assert!(first_knowledge > last_data, "knowledge frame before last data frame");
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_only_with_knowledge() {
    let fixture = fixture_with("text", false);
    let frames = collect(&fixture, request("什么是等保三级？", ChatMode::TextOnly)).await;

    assert_eq!(frames[0].content, THINK_PREAMBLE);
    assert_eq!(frames[0].message_type, FRAME_THINK);
    assert_eq!(frames[1].content, "用户查询意图识别为: text_query\n");
    assert_eq!(frames[2].content, "检索到2条相关知识\n");
    assert_eq!(frames[3].content, THINK_CLOSE);
    assert_eq!(frames[4].content, "<data>\n");

    let data_text: String = frames
        .iter()
        .filter(|f| f.message_type == FRAME_DATA)
        .map(|f| f.content.as_str())
        .collect();
    assert!(data_text.contains("等保三级"));
    assert!(data_text.ends_with("\n</data>"));

    // Both candidates were cited: header + two entries + closer.
    let knowledge: Vec<&Frame> =
        frames.iter().filter(|f| f.message_type == FRAME_KNOWLEDGE).collect();
    assert_eq!(knowledge.len(), 4);
    assert!(knowledge[0].content.contains("相关的标准规范原文内容"));
    assert!(knowledge[1].content.contains("GB/T 22239-2019"));
    assert!(knowledge[2].content.contains("GB/T 28448-2019"));
    assert_eq!(knowledge[3].content, "</knowledge>");

    assert_frame_ordering(&frames);

    // Persisted: the user turn and the full framed transcript.
    let appended = fixture.store.appended();
    assert_eq!(appended.len(), 2);
    assert_eq!(appended[0].2, "user");
    assert_eq!(appended[0].3, "什么是等保三级？");
    assert_eq!(appended[1].2, "assistant");
    assert_eq!(appended[1].3, concat(&frames));
}

#[tokio::test]
async fn graph_only_runs_generated_statement() {
    let fixture = fixture_with("text", false);
    let frames = collect(&fixture, request("河北单位建设了哪些网络?", ChatMode::GraphOnly)).await;

    let text = concat(&frames);
    assert!(text.starts_with("<think>\n"));
    assert!(text.contains("Cypher生成完成。"));
    assert!(text.contains("<data>\n"));
    assert!(text.contains("河北单位共建设"));
    assert!(text.contains("检索到2条相关信息"));

    let executed = fixture.graph.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("MATCH (u:Unit)-[:UNIT_NET]->(n:Netname)"));
    assert!(executed[0].contains("CONTAINS '河北'"));

    // The full framed output is what gets persisted.
    let appended = fixture.store.appended();
    assert_eq!(appended.len(), 2);
    assert_eq!(appended[1].3, text);
}

#[tokio::test]
async fn hybrid_graph_branch_strips_inner_think() {
    let fixture = fixture_with("graph", false);
    let frames = collect(&fixture, request("A单位的集成商是谁？", ChatMode::Hybrid)).await;

    let text = concat(&frames);
    // Orchestrator narration survives.
    assert!(text.contains("需要检索网络业务知识图谱辅助回答"));
    // Inner reasoning and tag frames are gone.
    assert!(!text.contains("正在分析问题的查询意图"));
    assert!(!text.contains("参考示例生成查询"));
    assert!(!frames.iter().any(|f| f.content == "<think>\n"));
    // The summary (the inner data content) is forwarded.
    assert!(text.contains("河北单位共建设"));

    // No text retrieval ran.
    assert!(!fixture
        .index
        .searched()
        .iter()
        .any(|i| i == &fixture.index.knowledge_index));
}

#[tokio::test]
async fn hybrid_hybrid_branch_augments_question() {
    let fixture = fixture_with("hybrid", false);
    let question = "河北单位建设了哪些网络? 等保三级网络建设要求是什么？";
    let frames = collect(&fixture, request(question, ChatMode::Hybrid)).await;

    let text = concat(&frames);
    assert!(text.contains("现在开始业务知识图谱检索"));
    assert!(text.contains("检索到的业务信息："));
    assert!(text.contains("现在开始法规标准检索"));

    // The captured graph data rides into the answering prompt.
    let prompts = fixture.chat.recorded_answer_prompts();
    assert_eq!(prompts.len(), 1);
    let expected = format!("{}以下是检索到的具体业务信息：河北单位共建设2个网络", question);
    assert!(prompts[0].contains(&expected), "answering prompt missing augmented question");

    // The text answer streams after the graph phase.
    assert!(text.contains("等保三级"));
    // The orchestrator preamble appears exactly once.
    assert_eq!(text.matches(THINK_PREAMBLE).count(), 1);
}

#[tokio::test]
async fn hybrid_text_branch_deduplicates_preamble() {
    let fixture = fixture_with("text", false);
    let frames = collect(&fixture, request("什么是等保三级？", ChatMode::Hybrid)).await;

    let text = concat(&frames);
    assert_eq!(text.matches(THINK_PREAMBLE).count(), 1);
    assert!(text.contains("需要检索法规标准知识辅助回答"));
    assert!(text.contains("等保三级"));
    assert_frame_ordering(&frames);
}

#[tokio::test]
async fn cancellation_skips_persistence() {
    let fixture = fixture_with("text", false);
    let (sink, mut rx) = frame_channel(1);
    let run = tokio::spawn(
        fixture
            .orchestrator
            .clone()
            .run(request("什么是等保三级？", ChatMode::TextOnly), sink),
    );

    // Read two frames, then hang up mid-stream.
    let _ = rx.recv().await.expect("first frame");
    let _ = rx.recv().await.expect("second frame");
    drop(rx);

    run.await.unwrap();
    assert!(fixture.store.appended().is_empty(), "cancelled stream must not persist");
}

#[tokio::test]
async fn text_index_outage_degrades_gracefully() {
    let fixture = fixture_with("text", true);
    let frames = collect(&fixture, request("什么是等保三级？", ChatMode::TextOnly)).await;

    assert!(frames.iter().all(|f| f.message_type != FRAME_ERROR));
    assert!(frames.iter().all(|f| f.message_type != FRAME_KNOWLEDGE));
    assert!(concat(&frames).contains("检索到0条相关知识"));
    assert!(concat(&frames).contains("等保三级"));

    // Best-effort reply still persisted.
    assert_eq!(fixture.store.appended().len(), 2);
}

#[tokio::test]
async fn answering_failure_emits_single_error_frame() {
    let settings = Settings::default();
    let mut chat = StubChat::new("text", vec![]);
    chat.fail_answering = true;
    let chat = Arc::new(chat);
    let index = Arc::new(StubIndex::with_knowledge(&settings, knowledge_hits()));
    let store = Arc::new(StubStore::default());
    let orchestrator = Arc::new(Orchestrator::new(
        chat,
        Arc::new(StubEmbedder),
        index,
        Arc::new(StubGraph::new(Vec::new())),
        store.clone(),
        &settings,
    ));
    let fixture_store = store;

    let (sink, mut rx) = frame_channel(64);
    let run = tokio::spawn(orchestrator.run(request("什么是等保三级？", ChatMode::TextOnly), sink));
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    run.await.unwrap();

    let errors: Vec<&Frame> = frames.iter().filter(|f| f.message_type == FRAME_ERROR).collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].content.contains("抱歉，处理您的请求时出现错误"));
    assert_eq!(frames.last().unwrap().message_type, FRAME_ERROR);

    // Nothing persisted after a terminal error.
    assert!(fixture_store.appended().is_empty());
}

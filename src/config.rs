//! Environment-driven configuration.
//!
//! Settings are grouped per backend (`REDIS_*`, `MYSQL_*`, `ES_*`,
//! `NEO4J_*`, `LLM_*`, `EMBEDDING_*`) plus prompt templates (`PROMPT_*`),
//! per-scenario LLM overrides and feature flags. Every key has a default;
//! an unparseable value is a fatal `ConfigError` at startup.

use crate::error::AppError;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("invalid value for {}: {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Backend settings
// ---------------------------------------------------------------------------

/// Cache tier settings. The tier itself runs in-process (see
/// `clients::kv`); `REDIS_*` remains the recognized key group and
/// `REDIS_ENABLED=false` switches the tier off entirely.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    pub enabled: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
            enabled: true,
        }
    }
}

impl RedisSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(RedisSettings {
            host: env_or("REDIS_HOST", &d.host),
            port: env_parse("REDIS_PORT", d.port)?,
            db: env_parse("REDIS_DB", d.db)?,
            password: env_opt("REDIS_PASSWORD"),
            enabled: env_flag("REDIS_ENABLED", d.enabled),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        MySqlSettings {
            host: "localhost".into(),
            port: 3306,
            user: "chatuser".into(),
            password: "ChangeMe123!".into(),
            database: "chatdb".into(),
        }
    }
}

impl MySqlSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(MySqlSettings {
            host: env_or("MYSQL_HOST", &d.host),
            port: env_parse("MYSQL_PORT", d.port)?,
            user: env_or("MYSQL_USER", &d.user),
            password: env_or("MYSQL_PASSWORD", &d.password),
            database: env_or("MYSQL_DATABASE", &d.database),
        })
    }

    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct EsSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Regulation passages (`kb_vector_store`).
    pub knowledge_index: String,
    /// Conversation transcripts (`conversation_history`).
    pub conversation_index: String,
    /// Few-shot graph-query examples (`qa_system`).
    pub cypher_index: String,
    pub timeout_secs: u64,
}

impl Default for EsSettings {
    fn default() -> Self {
        EsSettings {
            host: "localhost".into(),
            port: 9200,
            username: "elastic".into(),
            password: "password01".into(),
            knowledge_index: "kb_vector_store".into(),
            conversation_index: "conversation_history".into(),
            cypher_index: "qa_system".into(),
            timeout_secs: 30,
        }
    }
}

impl EsSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(EsSettings {
            host: env_or("ES_HOST", &d.host),
            port: env_parse("ES_PORT", d.port)?,
            username: env_or("ES_USERNAME", &d.username),
            password: env_or("ES_PASSWORD", &d.password),
            knowledge_index: env_or("ES_KNOWLEDGE_INDEX", &d.knowledge_index),
            conversation_index: env_or("ES_CONVERSATION_INDEX", &d.conversation_index),
            cypher_index: env_or("ES_CYPHER_INDEX", &d.cypher_index),
            timeout_secs: env_parse("ES_TIMEOUT", d.timeout_secs)?,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Neo4jSettings {
    /// HTTP endpoint of the graph engine (transactional commit API).
    pub http_url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Neo4jSettings {
            http_url: "http://localhost:7474".into(),
            database: "neo4j".into(),
            user: "neo4j".into(),
            password: "ChangeMe123!".into(),
            enabled: true,
            timeout_secs: 15,
        }
    }
}

impl Neo4jSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(Neo4jSettings {
            http_url: env_or("NEO4J_HTTP_URL", &d.http_url),
            database: env_or("NEO4J_DATABASE", &d.database),
            user: env_or("NEO4J_USER", &d.user),
            password: env_or("NEO4J_PASSWORD", &d.password),
            enabled: env_flag("NEO4J_ENABLED", d.enabled),
            timeout_secs: env_parse("NEO4J_TIMEOUT", d.timeout_secs)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        LlmSettings {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            api_key: String::new(),
            model_name: "qwen-plus".into(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl LlmSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(LlmSettings {
            base_url: env_or("LLM_BASE_URL", &d.base_url),
            api_key: env_or("LLM_API_KEY", &d.api_key),
            model_name: env_or("LLM_MODEL_NAME", &d.model_name),
            timeout_secs: env_parse("LLM_TIMEOUT", d.timeout_secs)?,
            max_retries: env_parse("LLM_MAX_RETRIES", d.max_retries)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub base_url: String,
    pub model_name: String,
    pub timeout_secs: u64,
    /// Dense vector dimensionality of the deployment.
    pub dimensions: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        EmbeddingSettings {
            base_url: "http://localhost:8000".into(),
            model_name: "bge-large-zh".into(),
            timeout_secs: 30,
            dimensions: 1024,
        }
    }
}

impl EmbeddingSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(EmbeddingSettings {
            base_url: env_or("EMBEDDING_BASE_URL", &d.base_url),
            model_name: env_or("EMBEDDING_MODEL_NAME", &d.model_name),
            timeout_secs: env_parse("EMBEDDING_TIMEOUT", d.timeout_secs)?,
            dimensions: env_parse("EMBEDDING_DIMENSIONS", d.dimensions)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Retrieval tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub lexical_weight: f64,
    pub vector_weight: f64,
    pub top_k: usize,
    /// Few-shot examples fetched per graph intent.
    pub example_top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        RetrievalSettings {
            lexical_weight: 0.4,
            vector_weight: 0.6,
            top_k: 5,
            example_top_k: 3,
        }
    }
}

impl RetrievalSettings {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(RetrievalSettings {
            lexical_weight: env_parse("RETRIEVAL_LEXICAL_WEIGHT", d.lexical_weight)?,
            vector_weight: env_parse("RETRIEVAL_VECTOR_WEIGHT", d.vector_weight)?,
            top_k: env_parse("RETRIEVAL_TOP_K", d.top_k)?,
            example_top_k: env_parse("RETRIEVAL_EXAMPLE_TOP_K", d.example_top_k)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-scenario LLM overrides
// ---------------------------------------------------------------------------

/// Model/temperature/token overrides for one LLM usage scenario. A missing
/// model falls back to `LLM_MODEL_NAME`.
#[derive(Debug, Clone)]
pub struct LlmScenario {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmScenario {
    fn from_env(prefix: &str, temperature: f32, max_tokens: u32) -> Result<Self, AppError> {
        Ok(LlmScenario {
            model: env_opt(&format!("{}_MODEL", prefix)),
            temperature: env_parse(&format!("{}_TEMPERATURE", prefix), temperature)?,
            max_tokens: env_parse(&format!("{}_MAX_TOKENS", prefix), max_tokens)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LlmScenarios {
    pub router: LlmScenario,
    pub intent: LlmScenario,
    pub query_generation: LlmScenario,
    pub chat: LlmScenario,
    pub summary: LlmScenario,
    pub citation: LlmScenario,
}

impl Default for LlmScenarios {
    fn default() -> Self {
        LlmScenarios {
            router: LlmScenario { model: None, temperature: 0.0, max_tokens: 500 },
            intent: LlmScenario { model: None, temperature: 0.0, max_tokens: 1024 },
            query_generation: LlmScenario { model: None, temperature: 0.0, max_tokens: 2048 },
            chat: LlmScenario { model: None, temperature: 0.7, max_tokens: 4096 },
            summary: LlmScenario { model: None, temperature: 0.0, max_tokens: 2048 },
            citation: LlmScenario { model: None, temperature: 0.0, max_tokens: 1000 },
        }
    }
}

impl LlmScenarios {
    fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(LlmScenarios {
            router: LlmScenario::from_env("LLM_ROUTER", d.router.temperature, d.router.max_tokens)?,
            intent: LlmScenario::from_env("LLM_INTENT", d.intent.temperature, d.intent.max_tokens)?,
            query_generation: LlmScenario::from_env(
                "LLM_QUERY_GEN",
                d.query_generation.temperature,
                d.query_generation.max_tokens,
            )?,
            chat: LlmScenario::from_env("LLM_CHAT", d.chat.temperature, d.chat.max_tokens)?,
            summary: LlmScenario::from_env("LLM_SUMMARY", d.summary.temperature, d.summary.max_tokens)?,
            citation: LlmScenario::from_env(
                "LLM_CITATION",
                d.citation.temperature,
                d.citation.max_tokens,
            )?,
        })
    }
}

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

const DEFAULT_SYSTEM_PROMPT: &str =
    "你是一个有帮助的中文网络等级保护智能助手，请用简洁、清晰的方式回答。";

const DEFAULT_ROUTER_SYSTEM_PROMPT: &str = "你是一个严谨的检索路由助手，只按要求的格式输出。";

const DEFAULT_ROUTER_PROMPT: &str = "\
你是检索路由器。请根据用户问题和历史对话，判断应该使用哪类检索：
- graph: 业务图谱库（单位、网络、系统、设备、安全产品、集成商等具体业务数据）
- text: 法规标准库（法规、标准、条款等权威文档）
- hybrid: 需要同时检索业务数据与法规标准进行对照
- none: 无需检索（问候语、闲聊等）

--- 历史对话 ---
{history}

用户问题: {query}

请在第一行只输出一个标签（graph/text/hybrid/none），然后另起一行给出简要理由。";

const DEFAULT_INTENT_RECOGNITION_PROMPT: &str = "\
你是一个意图识别专家。请分析用户的查询，判断其意图类型。

可能的意图类型：
1. text_query - 通用知识查询（法规、标准、概念等）
2. graph_query - 图数据库查询（关系、路径、层级、网络拓扑等）
3. hybrid_query - 混合查询

用户查询: {query}

只输出JSON格式: {\"intent_type\": \"xxx\", \"confidence\": 0.xx}";

const DEFAULT_GRAPH_INTENT_PROMPT: &str = "\
你是图数据库的'智能意图解析器'。
请根据输入的上下文，完成图查询的意图拆解，并对每个意图进行详细分析。
你需要进行流式输出，其中分析思路需要展示到前端页面。
请先详细说明你的分析思路，分析思路请完全以流利的中文自然语言进行描述，然后输出最终严格的JSON结果。
最后的JSON结果，必须严格按照以下格式输出标识符（不要有任何变化）：
'3.以下是json格式的解析结果：'
[{\"intent_item\": \"意图描述字符串\"}, {\"intent_item\": \"意图描述字符串\"}, ...]
说明:
- intent_item: 图查询的意图拆解的意图描述
- 最多给出3个意图；若用户问题非常明确，则仅输出1个意图，能不拆分的尽量不拆分。";

const DEFAULT_QUERY_GENERATION_PROMPT: &str = "\
你是图数据库的Cypher查询生成专家。
请根据多个用户意图和提供的示例，为每个意图生成一条完整可执行的Cypher查询语句。
要求：
1. 为每个意图生成对应的Cypher语句，必须可以直接执行
2. 参考每个意图对应的示例中的Cypher语法和模式
3. 输出格式必须为严格的JSON格式，标识符为：'3.以下是json格式的解析结果：'
4. JSON格式：[{\"intent_item\": \"意图描述\", \"cypher\": \"Cypher语句\"}, ...]
5. 如果某个意图不明确或无法生成有效的Cypher，该意图的cypher字段返回空字符串
6. 请先简要说明分析思路，然后输出JSON结果（在JSON之前必须输出标识符）";

const DEFAULT_SUMMARY_PROMPT: &str = "\
请直接使用查询到的结果对用户的问题作出回答，查询结果不需要进行筛选，\
也不需要逐条分析，微小的错误请忽略，名称不统一也请忽略，\
回答的方式是先生成100个字的总结摘要，然后再进行详细回答。\n\
以下是根据业务图谱查询到的结果作出的回答：";

const DEFAULT_ANSWER_TEMPLATE: &str = "\
{system_prompt}

以下是历史对话，请基于上下文回答用户的新问题。

--- 历史对话开始 ---
{history}
--- 历史对话结束 ---

--- 相关知识 ---
{knowledge}
--- 知识结束 ---

用户: {query}

助手:";

const DEFAULT_CITATION_PROMPT: &str = "\
请分析助手的回答，从候选知识列表中找出回答实际引用到的条目。

助手回答:
{answer}

候选知识:
{candidates}

只输出JSON数组，包含被引用条目的编号，例如: [1, 3]。若没有引用任何条目，输出 []。";

/// Prompt templates, each overridable via `PROMPT_*`.
#[derive(Debug, Clone)]
pub struct PromptSettings {
    pub system_prompt: String,
    pub router_system_prompt: String,
    pub router_prompt: String,
    pub intent_recognition_prompt: String,
    pub graph_intent_prompt: String,
    pub query_generation_prompt: String,
    pub summary_prompt: String,
    pub answer_template: String,
    pub citation_prompt: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        PromptSettings {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            router_system_prompt: DEFAULT_ROUTER_SYSTEM_PROMPT.into(),
            router_prompt: DEFAULT_ROUTER_PROMPT.into(),
            intent_recognition_prompt: DEFAULT_INTENT_RECOGNITION_PROMPT.into(),
            graph_intent_prompt: DEFAULT_GRAPH_INTENT_PROMPT.into(),
            query_generation_prompt: DEFAULT_QUERY_GENERATION_PROMPT.into(),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.into(),
            answer_template: DEFAULT_ANSWER_TEMPLATE.into(),
            citation_prompt: DEFAULT_CITATION_PROMPT.into(),
        }
    }
}

impl PromptSettings {
    fn from_env() -> Self {
        let d = Self::default();
        PromptSettings {
            system_prompt: env_or("PROMPT_SYSTEM", &d.system_prompt),
            router_system_prompt: env_or("PROMPT_ROUTER_SYSTEM", &d.router_system_prompt),
            router_prompt: env_or("PROMPT_ROUTER", &d.router_prompt),
            intent_recognition_prompt: env_or("PROMPT_INTENT_RECOGNITION", &d.intent_recognition_prompt),
            graph_intent_prompt: env_or("PROMPT_GRAPH_INTENT", &d.graph_intent_prompt),
            query_generation_prompt: env_or("PROMPT_QUERY_GENERATION", &d.query_generation_prompt),
            summary_prompt: env_or("PROMPT_SUMMARY", &d.summary_prompt),
            answer_template: env_or("PROMPT_ANSWER_TEMPLATE", &d.answer_template),
            citation_prompt: env_or("PROMPT_CITATION", &d.citation_prompt),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub redis: RedisSettings,
    pub mysql: MySqlSettings,
    pub es: EsSettings,
    pub neo4j: Neo4jSettings,
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub scenarios: LlmScenarios,
    pub prompts: PromptSettings,

    pub knowledge_matching_enabled: bool,
    pub intent_parser_enabled: bool,
    pub knowledge_retrieval_enabled: bool,

    pub log_level: String,
    pub log_file_path: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            redis: RedisSettings::default(),
            mysql: MySqlSettings::default(),
            es: EsSettings::default(),
            neo4j: Neo4jSettings::default(),
            llm: LlmSettings::default(),
            embedding: EmbeddingSettings::default(),
            retrieval: RetrievalSettings::default(),
            scenarios: LlmScenarios::default(),
            prompts: PromptSettings::default(),
            knowledge_matching_enabled: true,
            intent_parser_enabled: true,
            knowledge_retrieval_enabled: true,
            log_level: "info".into(),
            log_file_path: None,
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let d = Self::default();
        Ok(Settings {
            redis: RedisSettings::from_env()?,
            mysql: MySqlSettings::from_env()?,
            es: EsSettings::from_env()?,
            neo4j: Neo4jSettings::from_env()?,
            llm: LlmSettings::from_env()?,
            embedding: EmbeddingSettings::from_env()?,
            retrieval: RetrievalSettings::from_env()?,
            scenarios: LlmScenarios::from_env()?,
            prompts: PromptSettings::from_env(),
            knowledge_matching_enabled: env_flag("KNOWLEDGE_MATCHING_ENABLED", true),
            intent_parser_enabled: env_flag("INTENT_PARSER_ENABLED", true),
            knowledge_retrieval_enabled: env_flag("KNOWLEDGE_RETRIEVAL_ENABLED", true),
            log_level: env_or("LOG_LEVEL", &d.log_level),
            log_file_path: env_opt("LOG_FILE_PATH"),
            host: env_or("HOST", &d.host),
            port: env_parse("PORT", d.port)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_conventions() {
        let s = Settings::default();
        assert_eq!(s.es.knowledge_index, "kb_vector_store");
        assert_eq!(s.es.conversation_index, "conversation_history");
        assert_eq!(s.es.cypher_index, "qa_system");
        assert_eq!(s.llm.timeout_secs, 120);
        assert_eq!(s.embedding.timeout_secs, 30);
        assert_eq!(s.neo4j.timeout_secs, 15);
        assert!((s.retrieval.lexical_weight - 0.4).abs() < f64::EPSILON);
        assert!((s.retrieval.vector_weight - 0.6).abs() < f64::EPSILON);
        assert_eq!(s.retrieval.top_k, 5);
    }

    #[test]
    fn scenario_defaults() {
        let s = LlmScenarios::default();
        assert_eq!(s.router.max_tokens, 500);
        assert!(s.router.temperature.abs() < f32::EPSILON);
        assert_eq!(s.citation.max_tokens, 1000);
    }

    #[test]
    fn mysql_url_shape() {
        let m = MySqlSettings::default();
        assert!(m.url().starts_with("mysql://chatuser:"));
        assert!(m.url().ends_with("/chatdb"));
    }

    #[test]
    fn prompt_templates_carry_placeholders() {
        let p = PromptSettings::default();
        assert!(p.router_prompt.contains("{query}"));
        assert!(p.router_prompt.contains("{history}"));
        assert!(p.answer_template.contains("{system_prompt}"));
        assert!(p.answer_template.contains("{knowledge}"));
        assert!(p.citation_prompt.contains("{candidates}"));
        assert!(p.graph_intent_prompt.contains("3.以下是json格式的解析结果："));
    }
}

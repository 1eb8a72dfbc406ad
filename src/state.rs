//! Process-wide application state: configuration, the connection pool,
//! adapter singletons, the session store and the orchestrator. Built once
//! at startup; cheap to clone into handlers.

use std::sync::Arc;
use std::time::Instant;

use sqlx::MySqlPool;

use crate::clients::{
    EmbeddingClient, Embedder, EsClient, GraphClient, GraphEngine, KvStore, LlmClient, TextIndex,
};
use crate::config::Settings;
use crate::pipeline::Orchestrator;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: MySqlPool,
    pub kv: Option<Arc<KvStore>>,
    pub es: Arc<dyn TextIndex>,
    pub graph: Arc<dyn GraphEngine>,
    pub llm_configured: bool,
    pub store: Arc<SessionStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub start_time: Instant,
}

impl AppState {
    pub fn init(settings: Settings, db: MySqlPool) -> Self {
        let llm_client = LlmClient::new(&settings.llm);
        let llm_configured = llm_client.configured();

        let llm: Arc<dyn crate::clients::ChatModel> = Arc::new(llm_client);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(&settings.embedding));
        let es: Arc<dyn TextIndex> = Arc::new(EsClient::new(&settings.es));
        let graph: Arc<dyn GraphEngine> = Arc::new(GraphClient::new(&settings.neo4j));

        let kv = settings.redis.enabled.then(|| Arc::new(KvStore::new()));
        let store = Arc::new(SessionStore::new(
            db.clone(),
            kv.clone(),
            es.clone(),
            settings.es.conversation_index.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            llm,
            embedder,
            es.clone(),
            graph.clone(),
            store.clone(),
            &settings,
        ));

        AppState {
            settings: Arc::new(settings),
            db,
            kv,
            es,
            graph,
            llm_configured,
            store,
            orchestrator,
            start_time: Instant::now(),
        }
    }
}

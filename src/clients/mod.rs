//! External service adapters.
//!
//! Each backend sits behind a narrow object-safe trait so the pipeline can
//! be exercised with stubs injected at construction time. Concrete
//! implementations talk HTTP via a shared `reqwest` client.

pub mod embedding;
pub mod es;
pub mod graph;
pub mod kv;
pub mod llm;

pub use embedding::{Embedder, EmbeddingClient};
pub use es::{EsClient, SearchHit, TextIndex};
pub use graph::{GraphClient, GraphEngine};
pub use kv::KvStore;
pub use llm::{ChatModel, ChatRequest, LlmClient, TokenStream};

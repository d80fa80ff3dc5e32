//! Per-session conversation history: bounded, age-limited, isolated.

pub mod relevance;
pub mod store;
pub mod types;

pub use relevance::{KeywordOverlapPolicy, RecencyPolicy, RelevancePolicy};
pub use store::SessionStore;
pub use types::{Message, MessageRole, SessionInfo, SessionStoreStats};

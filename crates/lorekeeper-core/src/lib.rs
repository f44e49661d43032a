//! Lorekeeper core library
//!
//! The ReAct agent core, the agent protocol/orchestration layer, and the
//! three-tier memory engine described in the design doc.

pub mod agent;
pub mod agents;
pub mod bm25;
pub mod config;
pub mod emotion;
pub mod errors;
pub mod llm;
pub mod memory;
pub mod message;
pub mod persona;
pub mod query_rewriter;
pub mod ranker;
pub mod react;
pub mod schema;
pub mod storage;

pub use agent::{AgentMessage, AgentProtocol, AgentRegistry, AgentResponse};
pub use config::Config;
pub use persona::Persona;
pub use react::AgentResult;

//! # flowsmith
//!
//! Turns natural-language automation requests into verified n8n workflow
//! documents with a three-role agent pipeline.
//!
//! ## Architecture
//!
//! ```text
//!   request ──► KnowledgeRetriever ──► Planner ──► Generator ──► Supervisor
//!                                        ▲                           │
//!                                        └──── feedback (≤ 3 rounds) ┘
//!                                                                    │ approved
//!                                                                    ▼
//!                                                       StructuralValidator
//!                                                        (one auto-fix pass)
//! ```
//!
//! The Planner and Generator share one completion backend; the Supervisor
//! verifies against a second, independently configured one.
//!
//! ## Modules
//! - `orchestrator`: the round state machine and its result/error types
//! - `agents`: Planner, Generator, Supervisor and the per-round context
//! - `llm`: completion backends (Anthropic, OpenAI-compatible)
//! - `retry` / `complexity`: rate-limit retry and timeout sizing
//! - `knowledge` / `validation`: retriever and validator collaborators
//! - `cost` / `events`: usage ledger and progress events

pub mod agents;
pub mod complexity;
pub mod config;
pub mod cost;
pub mod events;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod retry;
pub mod util;
pub mod validation;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use orchestrator::{
    OrchestrationOptions, OrchestrationRequest, OrchestrationResult, Orchestrator, PipelineError,
};
pub use workflow::WorkflowDocument;

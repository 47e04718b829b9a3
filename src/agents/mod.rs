//! Agents module - the three roles of the generation pipeline.
//!
//! # Roles
//! - **Planner**: decides which documented entities the workflow needs
//! - **Generator**: builds a candidate document restricted to the Plan
//! - **Supervisor**: rejects candidates that use undocumented entities
//!
//! Each role is a plain struct holding its backend and counters. Per-request
//! state travels in [`PipelineContext`]; budgets, events and cost accounting
//! travel in [`AgentScope`].

mod context;
mod generator;
mod plan;
mod planner;
pub mod postprocess;
mod supervisor;
mod types;

pub use context::{AgentScope, PipelineContext};
pub use generator::{detect_trigger_need, parse_candidate, Generated, Generator, TriggerHint};
pub use plan::{AvailableEntity, MissingEntity, Plan, PlanAnalysis, RequiredEntity};
pub use planner::Planner;
pub use supervisor::{
    deterministic_invented, detect_local_defects, LocalDefect, Supervisor, SAFE_ENTITY_TYPES,
};
pub use types::{
    AgentError, AgentRole, GeneratorStatsSnapshot, InventedEntity, PlannerStatsSnapshot,
    SupervisionVerdict, SupervisorStatsSnapshot, ValidEntity,
};

//! Core types shared by the Planner, Generator and Supervisor.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::plan::Plan;
use crate::llm::LlmError;

/// Which agent issued a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Generator,
    Supervisor,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Generator => write!(f, "generator"),
            AgentRole::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// Errors that can occur in agent operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The plan needs entities but the knowledge base documents none of them.
    #[error("Plan requires {required} entities but none are available in the knowledge base")]
    PlanInvalid { required: usize, plan: Box<Plan> },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// An entity the verifier confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidEntity {
    pub name: String,
    pub entity_type: String,
}

/// An entity used by a candidate that the knowledge base does not back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventedEntity {
    /// Node name in the candidate
    pub name: String,
    pub claimed_type: String,
    pub reason: String,
    pub suggested_fix: Option<String>,
}

impl InventedEntity {
    /// One-line instruction for the next round.
    pub fn fix_instruction(&self) -> String {
        match self.suggested_fix {
            Some(ref fix) => format!(
                "Node '{}' uses undocumented type '{}': {}",
                self.name, self.claimed_type, fix
            ),
            None => format!(
                "Node '{}' uses undocumented type '{}' ({}); replace it with a documented entity or n8n-nodes-base.httpRequest",
                self.name, self.claimed_type, self.reason
            ),
        }
    }
}

/// Outcome of one supervision pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionVerdict {
    pub approved: bool,
    pub valid_entities: Vec<ValidEntity>,
    pub invented_entities: Vec<InventedEntity>,
    pub feedback: String,
    /// Numbered fix instructions carried into the next round
    pub suggested_fixes: Vec<String>,
    /// Verifier's 0-100 quality estimate; informational only
    pub quality_score: Option<f64>,
    pub attempt: u32,
    /// No further rounds will follow this rejection
    pub terminal: bool,
    /// Rejected by local rules without consulting the verifier
    pub local_only: bool,
}

impl SupervisionVerdict {
    pub fn needs_regeneration(&self) -> bool {
        !self.approved && !self.terminal
    }

    pub fn invented_names(&self) -> Vec<String> {
        self.invented_entities.iter().map(|e| e.name.clone()).collect()
    }
}

/// Planner counters.
#[derive(Debug, Default)]
pub struct PlannerStats {
    plans: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlannerStatsSnapshot {
    pub plans: u64,
    pub invalid: u64,
}

impl PlannerStats {
    pub(crate) fn record(&self, invalid: bool) {
        self.plans.fetch_add(1, Ordering::Relaxed);
        if invalid {
            self.invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PlannerStatsSnapshot {
        PlannerStatsSnapshot {
            plans: self.plans.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

/// Generator counters.
#[derive(Debug, Default)]
pub struct GeneratorStats {
    generated: AtomicU64,
    with_knowledge: AtomicU64,
    failed: AtomicU64,
    context_documents: AtomicU64,
    generation_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GeneratorStatsSnapshot {
    pub generated: u64,
    pub with_knowledge: u64,
    pub failed: u64,
    pub avg_context_documents: f64,
    pub avg_generation_ms: f64,
}

impl GeneratorStats {
    pub(crate) fn record_success(&self, context_documents: usize, elapsed_ms: u64) {
        self.generated.fetch_add(1, Ordering::Relaxed);
        if context_documents > 0 {
            self.with_knowledge.fetch_add(1, Ordering::Relaxed);
        }
        self.context_documents
            .fetch_add(context_documents as u64, Ordering::Relaxed);
        self.generation_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GeneratorStatsSnapshot {
        let generated = self.generated.load(Ordering::Relaxed);
        let avg = |total: u64| {
            if generated == 0 {
                0.0
            } else {
                total as f64 / generated as f64
            }
        };
        GeneratorStatsSnapshot {
            generated,
            with_knowledge: self.with_knowledge.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_context_documents: avg(self.context_documents.load(Ordering::Relaxed)),
            avg_generation_ms: avg(self.generation_ms.load(Ordering::Relaxed)),
        }
    }
}

/// Supervisor counters.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    validations: AtomicU64,
    approved: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SupervisorStatsSnapshot {
    pub validations: u64,
    pub approved: u64,
    pub rejected: u64,
    /// Percentage of validations approved
    pub approval_rate: f64,
}

impl SupervisorStats {
    pub(crate) fn record(&self, approved: bool) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if approved {
            self.approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SupervisorStatsSnapshot {
        let validations = self.validations.load(Ordering::Relaxed);
        let approved = self.approved.load(Ordering::Relaxed);
        SupervisorStatsSnapshot {
            validations,
            approved,
            rejected: self.rejected.load(Ordering::Relaxed),
            approval_rate: if validations == 0 {
                0.0
            } else {
                approved as f64 * 100.0 / validations as f64
            },
        }
    }
}

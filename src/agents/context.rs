//! Per-request state handed to the agents.
//!
//! [`PipelineContext`] is what the agents reason over: retrieved knowledge
//! plus whatever feedback earlier rounds produced. It is rebuilt for each
//! round by extension; a round never edits the context of the previous one.
//!
//! [`AgentScope`] is how the agents reach the outside world: the time budget
//! of the current round, the retry policy, the event emitter and the cost
//! ledger.

use std::sync::Arc;

use crate::cost::UsageLedger;
use crate::events::{EventEmitter, PipelineEvent};
use crate::knowledge::RetrievedContext;
use crate::llm::{CompletionBackend, CompletionRequest, LlmError};
use crate::retry::{call_with_retry, CallBudget, RetryPolicy};

use super::types::{AgentRole, InventedEntity, SupervisionVerdict};

/// Knowledge plus carried-over feedback for one round.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    /// Retrieved once per request and shared by every round
    pub knowledge: Arc<RetrievedContext>,
    /// Fix instructions the next Plan and Candidate must address
    pub previous_errors: Vec<String>,
    /// Free-text feedback from the last rejection
    pub supervisor_feedback: Option<String>,
    /// Every entity rejected as invented so far
    pub invented_entities: Vec<InventedEntity>,
    /// 1-based round this context was built for
    pub round: u32,
}

impl PipelineContext {
    pub fn new(knowledge: RetrievedContext, prior_errors: Vec<String>) -> Self {
        Self {
            knowledge: Arc::new(knowledge),
            previous_errors: crate::util::dedup_trimmed(prior_errors),
            supervisor_feedback: None,
            invented_entities: Vec::new(),
            round: 1,
        }
    }

    /// Context for the round after a rejection.
    pub fn with_feedback(&self, verdict: &SupervisionVerdict) -> Self {
        let previous_errors = crate::util::dedup_trimmed(
            self.previous_errors
                .iter()
                .chain(verdict.suggested_fixes.iter()),
        );

        let mut invented_entities = self.invented_entities.clone();
        for entity in &verdict.invented_entities {
            let known = invented_entities
                .iter()
                .any(|e| e.claimed_type == entity.claimed_type && e.name == entity.name);
            if !known {
                invented_entities.push(entity.clone());
            }
        }

        let feedback = verdict.feedback.trim();
        Self {
            knowledge: Arc::clone(&self.knowledge),
            previous_errors,
            supervisor_feedback: (!feedback.is_empty())
                .then(|| feedback.to_string())
                .or_else(|| self.supervisor_feedback.clone()),
            invented_entities,
            round: self.round + 1,
        }
    }

    /// Context for a structural auto-fix pass: same round, validation errors appended.
    pub fn with_validation_errors(&self, errors: &[String]) -> Self {
        Self {
            previous_errors: crate::util::dedup_trimmed(
                self.previous_errors.iter().chain(errors.iter()),
            ),
            ..self.clone()
        }
    }

    pub fn has_feedback(&self) -> bool {
        !self.previous_errors.is_empty()
            || self.supervisor_feedback.is_some()
            || !self.invented_entities.is_empty()
    }

    pub fn invented_types(&self) -> Vec<&str> {
        self.invented_entities
            .iter()
            .map(|e| e.claimed_type.as_str())
            .collect()
    }
}

/// Budget, policy and reporting hooks for agent calls in one round.
#[derive(Clone)]
pub struct AgentScope {
    pub session_id: Option<String>,
    pub budget: CallBudget,
    pub retry: RetryPolicy,
    pub events: EventEmitter,
    pub ledger: Option<Arc<dyn UsageLedger>>,
}

impl AgentScope {
    /// Call `backend`, parse its text with `parse`, and retry per policy.
    ///
    /// Every completed HTTP exchange is charged to the ledger, including
    /// those whose output fails to parse. Returns the parsed value and the
    /// model that served it.
    pub async fn complete_parsed<T, P>(
        &self,
        role: AgentRole,
        backend: &dyn CompletionBackend,
        request: &CompletionRequest,
        parse: P,
    ) -> Result<(T, String), LlmError>
    where
        P: Fn(&str) -> Result<T, LlmError>,
    {
        let parse = &parse;
        call_with_retry(
            &self.retry,
            &self.budget,
            |timeout| {
                let request = request.clone().with_timeout(timeout);
                async move {
                    let completion = backend.complete(&request).await?;
                    self.record_usage(role, backend.name(), &completion.model, &completion.usage);
                    let value = parse(&completion.text)?;
                    Ok((value, completion.model))
                }
            },
            |retry, _error, delay| {
                self.events.emit(PipelineEvent::RateLimitBackoff {
                    role,
                    retry,
                    delay_ms: delay.as_millis() as u64,
                })
            },
        )
        .await
    }

    fn record_usage(
        &self,
        role: AgentRole,
        backend: &str,
        model: &str,
        usage: &crate::cost::TokenUsage,
    ) {
        let (Some(ledger), Some(session_id)) = (self.ledger.as_ref(), self.session_id.as_deref())
        else {
            return;
        };
        ledger.record_call(session_id, role, backend, model, usage);
    }
}

impl std::fmt::Debug for AgentScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentScope")
            .field("session_id", &self.session_id)
            .field("budget", &self.budget)
            .field("retry", &self.retry)
            .field("events", &self.events)
            .field("ledger", &self.ledger.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(fixes: &[&str], invented: &[(&str, &str)], feedback: &str) -> SupervisionVerdict {
        SupervisionVerdict {
            approved: false,
            valid_entities: Vec::new(),
            invented_entities: invented
                .iter()
                .map(|(name, ty)| InventedEntity {
                    name: name.to_string(),
                    claimed_type: ty.to_string(),
                    reason: "undocumented".to_string(),
                    suggested_fix: None,
                })
                .collect(),
            feedback: feedback.to_string(),
            suggested_fixes: fixes.iter().map(|s| s.to_string()).collect(),
            quality_score: None,
            attempt: 1,
            terminal: false,
            local_only: false,
        }
    }

    #[test]
    fn with_feedback_builds_a_new_context() {
        let first = PipelineContext::new(RetrievedContext::default(), vec!["prior".to_string()]);
        let second = first.with_feedback(&verdict(
            &["replace Veo"],
            &[("Veo", "n8n-nodes-base.veo")],
            "Veo is not documented",
        ));

        assert_eq!(first.round, 1);
        assert!(first.supervisor_feedback.is_none());
        assert!(first.invented_entities.is_empty());

        assert_eq!(second.round, 2);
        assert_eq!(second.previous_errors, vec!["prior", "replace Veo"]);
        assert_eq!(second.supervisor_feedback.as_deref(), Some("Veo is not documented"));
        assert_eq!(second.invented_types(), vec!["n8n-nodes-base.veo"]);
        assert!(Arc::ptr_eq(&first.knowledge, &second.knowledge));
    }

    #[test]
    fn feedback_accumulates_without_duplicates() {
        let ctx = PipelineContext::new(RetrievedContext::default(), Vec::new())
            .with_feedback(&verdict(&["fix A"], &[("Veo", "n8n-nodes-base.veo")], "first"))
            .with_feedback(&verdict(&["fix A", "fix B"], &[("Veo", "n8n-nodes-base.veo")], ""));
        assert_eq!(ctx.round, 3);
        assert_eq!(ctx.previous_errors, vec!["fix A", "fix B"]);
        assert_eq!(ctx.invented_entities.len(), 1);
        assert_eq!(ctx.supervisor_feedback.as_deref(), Some("first"));
    }

    #[test]
    fn validation_errors_keep_the_round() {
        let ctx = PipelineContext::new(RetrievedContext::default(), Vec::new());
        let fixed = ctx.with_validation_errors(&["Node 'X' has no type".to_string()]);
        assert_eq!(fixed.round, 1);
        assert!(fixed.has_feedback());
        assert!(!ctx.has_feedback());
    }
}

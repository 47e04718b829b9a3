//! Orchestrator - drives the Plan → Generate → Supervise cycle.
//!
//! # States
//! ```text
//! RetrieveContext → Plan → Generate → Supervise
//!     Supervise approved          → StructuralValidate
//!     Supervise rejected, < max   → Plan (next round, feedback merged)
//!     Supervise rejected, == max  → TerminalRejection
//! StructuralValidate valid        → Done
//! StructuralValidate invalid      → AutoFix (Generate + Supervise once) → Done
//! ```
//!
//! Each round gets its own deadline, sized from the complexity tier of that
//! round's Plan. The request's cancellation token reaches every backend call.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{
    AgentError, AgentScope, Generated, Generator, InventedEntity, PipelineContext, Plan, Planner,
    Supervisor,
};
use crate::complexity::{ComplexityTier, TimeoutPolicy};
use crate::config::Config;
use crate::cost::{SessionCost, UsageLedger};
use crate::events::{EventEmitter, EventSink, PipelineEvent};
use crate::knowledge::{EntityTypeExtractor, KnowledgeRetriever, RetrievalOptions};
use crate::llm::{backend_from_config, LlmError, LlmErrorKind};
use crate::retry::{CallBudget, RetryPolicy};
use crate::validation::{StructuralValidator, ValidationReport};
use crate::workflow::WorkflowDocument;

/// A round may use this many per-call bounds in total.
const ROUND_BUDGET_FACTOR: u32 = 3;

/// Validation errors passed to the auto-fix generation.
const AUTO_FIX_ERRORS: usize = 5;

/// Pipeline stage an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Planning,
    Generation,
    Supervision,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Planning => write!(f, "planning"),
            Stage::Generation => write!(f, "generation"),
            Stage::Supervision => write!(f, "supervision"),
        }
    }
}

/// Why a request produced no workflow.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Plan requires {required} entities but none are available in the knowledge base")]
    PlanInvalid { required: usize, plan: Box<Plan> },

    #[error("Planning failed: {0}")]
    PlanningFailed(LlmError),

    #[error("Generation failed: {0}")]
    GenerationFailed(LlmError),

    #[error("Supervision failed: {0}")]
    SupervisionFailed(LlmError),

    #[error("Workflow rejected after {attempts} attempts: {feedback}")]
    TerminalRejection {
        attempts: u32,
        feedback: String,
        invented: Vec<InventedEntity>,
        /// Last candidate, for callers that want to inspect it
        candidate: Box<WorkflowDocument>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("{stage} timed out: {source}")]
    TimedOut { stage: Stage, source: LlmError },
}

impl PipelineError {
    fn from_agent(stage: Stage, error: AgentError) -> Self {
        let error = match error {
            AgentError::PlanInvalid { required, plan } => {
                return PipelineError::PlanInvalid { required, plan }
            }
            AgentError::Llm(e) => e,
        };
        match error.kind {
            LlmErrorKind::Cancelled => PipelineError::Cancelled,
            LlmErrorKind::Timeout => PipelineError::TimedOut {
                stage,
                source: error,
            },
            LlmErrorKind::ClientError if matches!(error.status_code, Some(401) | Some(403)) => {
                PipelineError::Configuration(error.message)
            }
            _ => match stage {
                Stage::Planning => PipelineError::PlanningFailed(error),
                Stage::Generation => PipelineError::GenerationFailed(error),
                Stage::Supervision => PipelineError::SupervisionFailed(error),
            },
        }
    }
}

/// Per-request switches.
#[derive(Debug, Clone)]
pub struct OrchestrationOptions {
    pub auto_fix: bool,
    /// Overrides the orchestrator's round limit
    pub max_rounds: Option<u32>,
    /// Errors the first Plan and Candidate must already address
    pub prior_errors: Vec<String>,
    pub cancel: Option<CancellationToken>,
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            auto_fix: true,
            max_rounds: None,
            prior_errors: Vec::new(),
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub text: String,
    pub session_id: Option<String>,
    pub options: OrchestrationOptions,
}

impl OrchestrationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            options: OrchestrationOptions::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_options(mut self, options: OrchestrationOptions) -> Self {
        self.options = options;
        self
    }
}

/// What the retrieved knowledge looked like.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSummary {
    pub documents: usize,
    pub detected_entities: Vec<String>,
    /// Retriever's estimate; the Plan's tier is reported separately
    pub complexity: Option<ComplexityTier>,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    pub session_id: String,
    pub duration: Duration,
    pub model: String,
    pub verifier_model: String,
    pub used_knowledge: bool,
    pub cost: Option<SessionCost>,
}

/// An approved workflow and how it was reached.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub workflow: WorkflowDocument,
    pub validation: ValidationReport,
    pub context: ContextSummary,
    /// Supervision rounds used
    pub attempts: u32,
    pub generate_calls: u32,
    pub auto_fixed: bool,
    /// Tier of the final round's Plan
    pub complexity: ComplexityTier,
    pub metadata: ResultMetadata,
    pub warnings: Vec<String>,
}

/// Outcome of the supervision loop.
struct Approved {
    generated: Generated,
    plan: Plan,
    ctx: PipelineContext,
    tier: ComplexityTier,
    attempts: u32,
}

pub struct Orchestrator {
    retriever: Arc<dyn KnowledgeRetriever>,
    planner: Planner,
    generator: Generator,
    supervisor: Supervisor,
    validator: Arc<dyn StructuralValidator>,
    ledger: Option<Arc<dyn UsageLedger>>,
    sink: Option<Arc<dyn EventSink>>,
    timeouts: TimeoutPolicy,
    retry: RetryPolicy,
    retrieval: RetrievalOptions,
    max_rounds: u32,
    auto_fix: bool,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn KnowledgeRetriever>,
        planner: Planner,
        generator: Generator,
        supervisor: Supervisor,
        validator: Arc<dyn StructuralValidator>,
    ) -> Self {
        Self {
            retriever,
            planner,
            generator,
            supervisor,
            validator,
            ledger: None,
            sink: None,
            timeouts: TimeoutPolicy::default(),
            retry: RetryPolicy::default(),
            retrieval: RetrievalOptions::default(),
            max_rounds: 3,
            auto_fix: true,
        }
    }

    /// Wire agents to the backends named in `config`.
    pub fn from_config(
        config: &Config,
        retriever: Arc<dyn KnowledgeRetriever>,
        extractor: Arc<dyn EntityTypeExtractor>,
        validator: Arc<dyn StructuralValidator>,
    ) -> Self {
        let generation_backend = backend_from_config(&config.generator);
        let verifier_backend = backend_from_config(&config.supervisor);

        let planner = Planner::new(
            generation_backend.clone(),
            &config.generator.model,
            extractor.clone(),
        )
        .with_max_output_tokens(config.generator.max_output_tokens);
        let generator = Generator::new(generation_backend, &config.generator.model)
            .with_max_output_tokens(config.generator.max_output_tokens);
        let supervisor = Supervisor::new(verifier_backend, &config.supervisor.model, extractor)
            .with_max_output_tokens(config.supervisor.max_output_tokens);

        Self::new(retriever, planner, generator, supervisor, validator)
            .with_timeouts(config.timeouts)
            .with_retry(config.retry)
            .with_max_rounds(config.max_rounds)
            .with_auto_fix(config.auto_fix)
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn scope(
        &self,
        session_id: &str,
        events: &EventEmitter,
        bound: Duration,
        round_started: Instant,
        cancel: &CancellationToken,
    ) -> AgentScope {
        AgentScope {
            session_id: Some(session_id.to_string()),
            budget: CallBudget::new(
                bound,
                round_started + bound * ROUND_BUDGET_FACTOR,
                cancel.clone(),
            ),
            retry: self.retry,
            events: events.clone(),
            ledger: self.ledger.clone(),
        }
    }

    /// Run one request to completion.
    ///
    /// # Errors
    /// See [`PipelineError`]. A structural validation failure is not an
    /// error: it is reported in the result's `validation` and `warnings`.
    pub async fn run(
        &self,
        request: OrchestrationRequest,
    ) -> Result<OrchestrationResult, PipelineError> {
        let started = Instant::now();
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let events = EventEmitter::new(self.sink.clone(), session_id.clone());
        let cancel = request.options.cancel.clone().unwrap_or_default();
        let max_rounds = request.options.max_rounds.unwrap_or(self.max_rounds).max(1);
        let auto_fix = self.auto_fix && request.options.auto_fix;

        if let Some(ref ledger) = self.ledger {
            ledger.start_session(&session_id);
        }
        tracing::info!(session_id = %session_id, max_rounds, auto_fix, "Starting workflow generation");

        let knowledge = self
            .retriever
            .get_context(&request.text, &self.retrieval)
            .await;
        events.emit(PipelineEvent::ContextRetrieved {
            documents: knowledge.documents.len(),
            detected_entities: knowledge.detected_entities.len(),
            fallback: knowledge.fallback,
        });
        tracing::info!(
            session_id = %session_id,
            documents = knowledge.documents.len(),
            fallback = knowledge.fallback,
            "Context retrieved"
        );
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let ctx = PipelineContext::new(knowledge, request.options.prior_errors.clone());
        let approved = self
            .supervision_loop(&request.text, ctx, max_rounds, &session_id, &events, &cancel)
            .await?;
        let Approved {
            generated,
            plan,
            ctx,
            tier,
            attempts,
        } = approved;
        let mut generate_calls = attempts;
        let mut workflow = generated.workflow;
        let mut warnings = plan.validation_warnings();

        let mut validation = self.validate(&workflow, &events).await;
        let mut auto_fixed = false;
        if !validation.valid && auto_fix {
            generate_calls += 1;
            match self
                .run_auto_fix(
                    &request.text,
                    &ctx,
                    &plan,
                    tier,
                    &validation,
                    max_rounds,
                    &session_id,
                    &events,
                    &cancel,
                )
                .await
            {
                Ok(Some((fixed, report))) => {
                    workflow = fixed;
                    validation = report;
                    auto_fixed = true;
                }
                Ok(None) => warnings.push("Auto-fix did not produce a valid approved workflow".to_string()),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Auto-fix failed");
                    warnings.push(format!("Auto-fix failed: {}", e));
                }
            }
        }
        if !validation.valid {
            warnings.push(format!(
                "Structural validation failed: {}",
                validation.errors.join("; ")
            ));
        }
        warnings.extend(validation.warnings.iter().cloned());

        let duration = started.elapsed();
        events.emit(PipelineEvent::Completed {
            attempts,
            duration_ms: duration.as_millis() as u64,
        });
        tracing::info!(
            session_id = %session_id,
            attempts,
            generate_calls,
            auto_fixed,
            valid = validation.valid,
            duration_ms = duration.as_millis() as u64,
            "Workflow generation completed"
        );

        let knowledge = &ctx.knowledge;
        Ok(OrchestrationResult {
            workflow,
            validation,
            context: ContextSummary {
                documents: knowledge.documents.len(),
                detected_entities: knowledge.detected_entities.clone(),
                complexity: knowledge.complexity_hint,
                fallback: knowledge.fallback,
            },
            attempts,
            generate_calls,
            auto_fixed,
            complexity: tier,
            metadata: ResultMetadata {
                cost: self.ledger.as_ref().and_then(|l| l.session_cost(&session_id)),
                session_id,
                duration,
                model: generated.model,
                verifier_model: self.supervisor.model().to_string(),
                used_knowledge: !knowledge.documents.is_empty(),
            },
            warnings,
        })
    }

    async fn supervision_loop(
        &self,
        request: &str,
        mut ctx: PipelineContext,
        max_rounds: u32,
        session_id: &str,
        events: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<Approved, PipelineError> {
        loop {
            let round = ctx.round;
            let round_started = Instant::now();

            // Tier is unknown until the Plan exists.
            let planning_scope = self.scope(
                session_id,
                events,
                self.timeouts.for_tier(ComplexityTier::Medium),
                round_started,
                cancel,
            );
            let plan = match self.planner.plan(request, &ctx, &planning_scope).await {
                Ok(plan) => plan,
                Err(AgentError::PlanInvalid { required, plan }) => {
                    events.emit(PipelineEvent::PlanRejected {
                        round,
                        required,
                        reason: "no required entity is documented".to_string(),
                    });
                    return Err(PipelineError::PlanInvalid { required, plan });
                }
                Err(e) => return Err(PipelineError::from_agent(Stage::Planning, e)),
            };

            let tier = plan.complexity();
            let bound = self.timeouts.for_tier(tier);
            events.emit(PipelineEvent::PlanCreated {
                round,
                required: plan.required_entities.len(),
                available: plan.available_entities.len(),
                missing: plan.missing_entities.len(),
                complexity: tier,
            });
            tracing::info!(session_id = %session_id, round, complexity = %tier, bound_secs = bound.as_secs(), "Round sized");
            let scope = self.scope(session_id, events, bound, round_started, cancel);

            events.emit(PipelineEvent::GenerationStarted {
                round,
                auto_fix: false,
                timeout_secs: bound.as_secs(),
            });
            let generated = self
                .generator
                .generate(request, &ctx, &plan, &scope)
                .await
                .map_err(|e| PipelineError::from_agent(Stage::Generation, e))?;
            events.emit(PipelineEvent::GenerationFinished {
                round,
                nodes: generated.workflow.nodes.len(),
                duration_ms: generated.duration.as_millis() as u64,
            });

            events.emit(PipelineEvent::SupervisionStarted { round, max_rounds });
            let verdict = self
                .supervisor
                .supervise(&generated.workflow, request, &ctx, &plan, round, max_rounds, &scope)
                .await
                .map_err(|e| PipelineError::from_agent(Stage::Supervision, e))?;

            if verdict.approved {
                events.emit(PipelineEvent::SupervisionApproved {
                    round,
                    quality_score: verdict.quality_score,
                });
                return Ok(Approved {
                    generated,
                    plan,
                    ctx,
                    tier,
                    attempts: round,
                });
            }

            let terminal = !verdict.needs_regeneration();
            events.emit(PipelineEvent::SupervisionRejected {
                round,
                invented: verdict.invented_names(),
                feedback: verdict.feedback.clone(),
                terminal,
            });
            if terminal {
                tracing::error!(
                    session_id = %session_id,
                    round,
                    invented = verdict.invented_entities.len(),
                    "Workflow rejected, no rounds left"
                );
                return Err(PipelineError::TerminalRejection {
                    attempts: round,
                    feedback: verdict.feedback,
                    invented: verdict.invented_entities,
                    candidate: Box::new(generated.workflow),
                });
            }

            tracing::warn!(session_id = %session_id, round, "Workflow rejected, retrying with feedback");
            events.emit(PipelineEvent::SupervisionRetry {
                next_round: round + 1,
                feedback: verdict.feedback.clone(),
            });
            ctx = ctx.with_feedback(&verdict);
        }
    }

    async fn validate(&self, workflow: &WorkflowDocument, events: &EventEmitter) -> ValidationReport {
        let report = self.validator.validate(workflow).await;
        events.emit(PipelineEvent::ValidationFinished {
            valid: report.valid,
            errors: report.errors.len(),
            warnings: report.warnings.len(),
        });
        report
    }

    /// One regeneration against the same Plan with the validation errors as
    /// feedback. Returns the replacement only if it is approved and valid.
    #[allow(clippy::too_many_arguments)]
    async fn run_auto_fix(
        &self,
        request: &str,
        ctx: &PipelineContext,
        plan: &Plan,
        tier: ComplexityTier,
        report: &ValidationReport,
        max_rounds: u32,
        session_id: &str,
        events: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<Option<(WorkflowDocument, ValidationReport)>, PipelineError> {
        let errors = report.top_errors(AUTO_FIX_ERRORS);
        events.emit(PipelineEvent::AutoFixStarted {
            errors: errors.len(),
        });
        tracing::info!(session_id = %session_id, errors = errors.len(), "Structural validation failed, attempting auto-fix");

        let fix_ctx = ctx.with_validation_errors(&errors);
        let bound = self.timeouts.for_tier(tier);
        let scope = self.scope(session_id, events, bound, Instant::now(), cancel);

        events.emit(PipelineEvent::GenerationStarted {
            round: fix_ctx.round,
            auto_fix: true,
            timeout_secs: bound.as_secs(),
        });
        let generated = self
            .generator
            .generate(request, &fix_ctx, plan, &scope)
            .await
            .map_err(|e| PipelineError::from_agent(Stage::Generation, e))?;
        events.emit(PipelineEvent::GenerationFinished {
            round: fix_ctx.round,
            nodes: generated.workflow.nodes.len(),
            duration_ms: generated.duration.as_millis() as u64,
        });

        events.emit(PipelineEvent::SupervisionStarted {
            round: fix_ctx.round,
            max_rounds,
        });
        let verdict = self
            .supervisor
            .supervise(&generated.workflow, request, &fix_ctx, plan, max_rounds, max_rounds, &scope)
            .await
            .map_err(|e| PipelineError::from_agent(Stage::Supervision, e))?;
        if !verdict.approved {
            events.emit(PipelineEvent::SupervisionRejected {
                round: fix_ctx.round,
                invented: verdict.invented_names(),
                feedback: verdict.feedback,
                terminal: true,
            });
            tracing::warn!(session_id = %session_id, "Auto-fixed workflow rejected, keeping the original");
            return Ok(None);
        }
        events.emit(PipelineEvent::SupervisionApproved {
            round: fix_ctx.round,
            quality_score: verdict.quality_score,
        });

        let fixed_report = self.validate(&generated.workflow, events).await;
        if !fixed_report.valid {
            tracing::warn!(session_id = %session_id, errors = fixed_report.errors.len(), "Auto-fixed workflow still invalid, keeping the original");
            return Ok(None);
        }
        Ok(Some((generated.workflow, fixed_report)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostLedger;
    use crate::knowledge::{KnowledgeDocument, PatternTypeExtractor, RetrievedContext};
    use crate::llm::Completion;
    use crate::test_support::{RecordingSink, ScriptedBackend, ScriptedValidator, StaticRetriever};
    use crate::validation::BasicStructuralValidator;

    const PLAN: &str = r#"{"analysis": {"description": "Forward webhooks to Slack"},
      "requiredNodes": [
        {"name": "Webhook", "type": "n8n-nodes-base.webhook", "purpose": "entry", "exists": true, "verified": true},
        {"name": "Slack", "type": "n8n-nodes-base.slack", "purpose": "notify", "exists": true, "verified": true}
      ],
      "availableNodes": [{"name": "Webhook", "type": "n8n-nodes-base.webhook"}, {"name": "Slack", "type": "n8n-nodes-base.slack"}],
      "executionFlow": ["Webhook receives", "Slack posts"], "readyToGenerate": true}"#;

    const GOOD: &str = r#"{"name": "Hook to Slack", "nodes": [
        {"name": "Webhook", "type": "n8n-nodes-base.webhook", "parameters": {}},
        {"name": "Slack", "type": "n8n-nodes-base.slack", "parameters": {}}
      ], "connections": {"Webhook": {"main": [[{"node": "Slack", "type": "main", "index": 0}]]}}}"#;

    const INVENTED: &str = r#"{"name": "Hook to Veo", "nodes": [
        {"name": "Webhook", "type": "n8n-nodes-base.webhook", "parameters": {}},
        {"name": "Veo", "type": "n8n-nodes-base.veo3", "parameters": {}}
      ], "connections": {"Webhook": {"main": [[{"node": "Veo", "type": "main", "index": 0}]]}}}"#;

    const APPROVE: &str = r#"{"approved": true, "validNodes": [], "inventedNodes": [], "feedback": "", "score": 90}"#;

    fn knowledge() -> RetrievedContext {
        RetrievedContext {
            documents: vec![
                KnowledgeDocument {
                    title: "Webhook".to_string(),
                    entity_type: Some("n8n-nodes-base.webhook".to_string()),
                    score: 0.9,
                    ..Default::default()
                },
                KnowledgeDocument {
                    title: "Slack".to_string(),
                    entity_type: Some("n8n-nodes-base.slack".to_string()),
                    score: 0.8,
                    ..Default::default()
                },
            ],
            detected_entities: vec!["Slack".to_string()],
            complexity_hint: Some(ComplexityTier::Medium),
            ..Default::default()
        }
    }

    struct Harness {
        main: Arc<ScriptedBackend>,
        verifier: Arc<ScriptedBackend>,
        orchestrator: Orchestrator,
    }

    fn harness(
        knowledge: RetrievedContext,
        main_replies: &[&str],
        verifier_replies: &[&str],
        validator: Arc<dyn StructuralValidator>,
    ) -> Harness {
        let main = Arc::new(ScriptedBackend::replies(main_replies));
        let verifier = Arc::new(ScriptedBackend::replies(verifier_replies));
        let extractor: Arc<dyn EntityTypeExtractor> = Arc::new(PatternTypeExtractor::new().unwrap());
        let orchestrator = Orchestrator::new(
            Arc::new(StaticRetriever::new(knowledge)),
            Planner::new(main.clone(), "claude-haiku-4-5", extractor.clone()),
            Generator::new(main.clone(), "claude-haiku-4-5"),
            Supervisor::new(verifier.clone(), "claude-sonnet-4-5", extractor),
            validator,
        );
        Harness {
            main,
            verifier,
            orchestrator,
        }
    }

    fn request() -> OrchestrationRequest {
        OrchestrationRequest::new("When a webhook fires, post the payload to Slack").with_session("s-1")
    }

    #[tokio::test]
    async fn fallback_context_stops_before_generation() {
        let h = harness(
            RetrievedContext::fallback(),
            &[PLAN, GOOD],
            &[APPROVE],
            Arc::new(BasicStructuralValidator),
        );
        let err = h.orchestrator.run(request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PlanInvalid { required: 2, .. }));
        assert_eq!(h.main.call_count(), 1);
        assert_eq!(h.verifier.call_count(), 0);
        assert_eq!(h.orchestrator.generator().stats().generated, 0);
    }

    #[tokio::test]
    async fn approved_on_first_attempt() {
        let h = harness(knowledge(), &[PLAN, GOOD], &[APPROVE], Arc::new(BasicStructuralValidator));
        let result = h.orchestrator.run(request()).await.unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.generate_calls, 1);
        assert!(!result.auto_fixed);
        assert!(result.validation.valid);
        assert_eq!(result.complexity, ComplexityTier::Simple);
        assert_eq!(result.context.complexity, Some(ComplexityTier::Medium));
        assert_eq!(result.context.documents, 2);
        assert_eq!(result.metadata.session_id, "s-1");
        assert_eq!(result.metadata.verifier_model, "claude-sonnet-4-5");
        assert!(result.metadata.used_knowledge);
        let types = result.workflow.entity_types();
        assert_eq!(types, vec!["n8n-nodes-base.webhook", "n8n-nodes-base.slack"]);
    }

    #[tokio::test]
    async fn invented_entity_triggers_a_second_round_with_feedback() {
        let h = harness(
            knowledge(),
            &[PLAN, INVENTED, PLAN, GOOD],
            &[APPROVE, APPROVE],
            Arc::new(BasicStructuralValidator),
        );
        let result = h.orchestrator.run(request()).await.unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.generate_calls, 2);
        assert_eq!(h.main.call_count(), 4);
        assert_eq!(h.verifier.call_count(), 2);

        let prompts = h.main.prompts();
        assert!(!prompts[0].system.contains("n8n-nodes-base.veo3"));
        assert!(prompts[2].system.contains("n8n-nodes-base.veo3"));
        assert!(prompts[3].prompt.contains("n8n-nodes-base.veo3"));
        assert!(result.workflow.node("Veo").is_none());
    }

    #[tokio::test]
    async fn terminal_rejection_carries_the_last_candidate() {
        let h = harness(
            knowledge(),
            &[PLAN, INVENTED, PLAN, INVENTED, PLAN, INVENTED],
            &[APPROVE, APPROVE, APPROVE],
            Arc::new(BasicStructuralValidator),
        );
        match h.orchestrator.run(request()).await.unwrap_err() {
            PipelineError::TerminalRejection {
                attempts,
                invented,
                candidate,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(invented.len(), 1);
                assert_eq!(invented[0].claimed_type, "n8n-nodes-base.veo3");
                assert!(candidate.node("Veo").is_some());
            }
            other => panic!("expected TerminalRejection, got {other:?}"),
        }
        assert_eq!(h.orchestrator.generator().stats().generated, 3);
        assert_eq!(h.verifier.call_count(), 3);
    }

    #[tokio::test]
    async fn round_limit_can_be_lowered_per_request() {
        let h = harness(
            knowledge(),
            &[PLAN, INVENTED, PLAN, GOOD],
            &[APPROVE, APPROVE],
            Arc::new(BasicStructuralValidator),
        );
        let options = OrchestrationOptions {
            max_rounds: Some(1),
            ..Default::default()
        };
        let err = h.orchestrator.run(request().with_options(options)).await.unwrap_err();
        assert!(matches!(err, PipelineError::TerminalRejection { attempts: 1, .. }));
        assert_eq!(h.main.call_count(), 2);
    }

    #[tokio::test]
    async fn events_do_not_change_the_outcome() {
        let replies = [PLAN, INVENTED, PLAN, GOOD];
        let silent = harness(knowledge(), &replies, &[APPROVE, APPROVE], Arc::new(BasicStructuralValidator));
        let observed = harness(knowledge(), &replies, &[APPROVE, APPROVE], Arc::new(BasicStructuralValidator));
        let sink = Arc::new(RecordingSink::default());
        let observed_orchestrator = observed.orchestrator.with_event_sink(sink.clone());

        let a = silent.orchestrator.run(request()).await.unwrap();
        let b = observed_orchestrator.run(request()).await.unwrap();

        assert_eq!(a.attempts, b.attempts);
        assert_eq!(a.generate_calls, b.generate_calls);
        assert_eq!(a.workflow.entity_types(), b.workflow.entity_types());
        assert_eq!(
            sink.names(),
            vec![
                "context_retrieved",
                "plan_created",
                "generation_started",
                "generation_finished",
                "supervision_started",
                "supervision_rejected",
                "supervision_retry",
                "plan_created",
                "generation_started",
                "generation_finished",
                "supervision_started",
                "supervision_approved",
                "validation_finished",
                "completed",
            ]
        );
        assert!(sink.events().iter().all(|(session, _)| session == "s-1"));
    }

    #[tokio::test]
    async fn invalid_structure_gets_one_auto_fix() {
        let invalid = ValidationReport {
            valid: false,
            errors: vec!["Node 'Slack' is missing a channel".to_string()],
            ..Default::default()
        };
        let h = harness(
            knowledge(),
            &[PLAN, GOOD, GOOD],
            &[APPROVE, APPROVE],
            Arc::new(ScriptedValidator::new(vec![invalid])),
        );
        let result = h.orchestrator.run(request()).await.unwrap();

        assert!(result.auto_fixed);
        assert!(result.validation.valid);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.generate_calls, 2);
        // Auto-fix re-enters Generate without re-planning.
        let prompts = h.main.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[2].prompt.contains("Node 'Slack' is missing a channel"));
    }

    #[tokio::test]
    async fn auto_fix_disabled_returns_invalid_candidate_with_warning() {
        let invalid = ValidationReport {
            valid: false,
            errors: vec!["Node 'Slack' is missing a channel".to_string()],
            ..Default::default()
        };
        let h = harness(
            knowledge(),
            &[PLAN, GOOD],
            &[APPROVE],
            Arc::new(ScriptedValidator::new(vec![invalid])),
        );
        let options = OrchestrationOptions {
            auto_fix: false,
            ..Default::default()
        };
        let result = h.orchestrator.run(request().with_options(options)).await.unwrap();

        assert!(!result.validation.valid);
        assert!(!result.auto_fixed);
        assert_eq!(result.generate_calls, 1);
        assert!(result.warnings.iter().any(|w| w.starts_with("Structural validation failed")));
    }

    #[tokio::test]
    async fn rejected_auto_fix_keeps_the_original() {
        let invalid = ValidationReport {
            valid: false,
            errors: vec!["Node 'Slack' is missing a channel".to_string()],
            ..Default::default()
        };
        let reject = r#"{"approved": false, "inventedNodes": [], "feedback": "Slack node lost its channel"}"#;
        let h = harness(
            knowledge(),
            &[PLAN, GOOD, GOOD],
            &[APPROVE, reject],
            Arc::new(ScriptedValidator::new(vec![invalid])),
        );
        let result = h.orchestrator.run(request()).await.unwrap();

        assert!(!result.auto_fixed);
        assert!(!result.validation.valid);
        assert_eq!(result.generate_calls, 2);
        assert_eq!(h.verifier.call_count(), 2);
        assert!(result
            .warnings
            .iter()
            .any(|w| w == "Auto-fix did not produce a valid approved workflow"));
        assert!(result.warnings.iter().any(|w| w.starts_with("Structural validation failed")));
    }

    #[tokio::test]
    async fn auto_fix_still_invalid_keeps_the_original() {
        let invalid = || ValidationReport {
            valid: false,
            errors: vec!["Node 'Slack' is missing a channel".to_string()],
            ..Default::default()
        };
        let renamed = GOOD.replace("Hook to Slack", "Second try");
        let h = harness(
            knowledge(),
            &[PLAN, GOOD, renamed.as_str()],
            &[APPROVE, APPROVE],
            Arc::new(ScriptedValidator::new(vec![invalid(), invalid()])),
        );
        let result = h.orchestrator.run(request()).await.unwrap();

        assert!(!result.auto_fixed);
        assert_eq!(result.workflow.name, "Hook to Slack");
        assert_eq!(result.validation.errors, invalid().errors);
        assert!(result
            .warnings
            .iter()
            .any(|w| w == "Auto-fix did not produce a valid approved workflow"));
    }

    fn rate_limited() -> Result<Completion, LlmError> {
        Err(LlmError::rate_limited("slow down".to_string(), None))
    }

    fn scripted_harness(main: Vec<Result<Completion, LlmError>>) -> Harness {
        let main = Arc::new(ScriptedBackend::new(main));
        let verifier = Arc::new(ScriptedBackend::replies(&[APPROVE]));
        let extractor: Arc<dyn EntityTypeExtractor> = Arc::new(PatternTypeExtractor::new().unwrap());
        let orchestrator = Orchestrator::new(
            Arc::new(StaticRetriever::new(knowledge())),
            Planner::new(main.clone(), "claude-haiku-4-5", extractor.clone()),
            Generator::new(main.clone(), "claude-haiku-4-5"),
            Supervisor::new(verifier.clone(), "claude-sonnet-4-5", extractor),
            Arc::new(BasicStructuralValidator),
        );
        Harness {
            main,
            verifier,
            orchestrator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_fails_planning() {
        let h = scripted_harness((0..4).map(|_| rate_limited()).collect());
        let started = Instant::now();
        let err = h.orchestrator.run(request()).await.unwrap_err();

        match err {
            PipelineError::PlanningFailed(e) => assert_eq!(e.kind, LlmErrorKind::RateLimited),
            other => panic!("expected PlanningFailed, got {other:?}"),
        }
        assert_eq!(h.main.call_count(), 4);
        assert_eq!(h.verifier.call_count(), 0);
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_fails_generation() {
        let mut script = vec![Ok(ScriptedBackend::reply(PLAN))];
        script.extend((0..4).map(|_| rate_limited()));
        let h = scripted_harness(script);
        let err = h.orchestrator.run(request()).await.unwrap_err();

        match err {
            PipelineError::GenerationFailed(e) => assert_eq!(e.kind, LlmErrorKind::RateLimited),
            other => panic!("expected GenerationFailed, got {other:?}"),
        }
        assert_eq!(h.main.call_count(), 5);
        assert_eq!(h.verifier.call_count(), 0);
        assert_eq!(h.orchestrator.generator().stats().failed, 1);
    }

    #[tokio::test]
    async fn cancelled_request_stops_before_planning() {
        let h = harness(knowledge(), &[PLAN, GOOD], &[APPROVE], Arc::new(BasicStructuralValidator));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = OrchestrationOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let err = h.orchestrator.run(request().with_options(options)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(h.main.call_count(), 0);
    }

    #[tokio::test]
    async fn usage_is_charged_to_the_session() {
        let ledger = Arc::new(CostLedger::new());
        let h = harness(knowledge(), &[PLAN, GOOD], &[APPROVE], Arc::new(BasicStructuralValidator));
        let orchestrator = h.orchestrator.with_ledger(ledger.clone());

        let result = orchestrator.run(request()).await.unwrap();
        let cost = result.metadata.cost.expect("cost recorded");
        assert_eq!(cost.total_calls, 3);
        assert_eq!(cost.by_role.len(), 3);
        assert!(cost.cost_nano > 0);
        assert_eq!(ledger.calls("s-1").len(), 3);
    }

    #[test]
    fn auth_failures_surface_as_configuration_errors() {
        let err = PipelineError::from_agent(
            Stage::Planning,
            AgentError::Llm(LlmError::client_error(401, "invalid x-api-key".to_string())),
        );
        assert!(matches!(err, PipelineError::Configuration(_)));

        let err = PipelineError::from_agent(
            Stage::Generation,
            AgentError::Llm(LlmError::unavailable(Some(529), "overloaded".to_string())),
        );
        assert!(matches!(err, PipelineError::GenerationFailed(_)));
    }
}

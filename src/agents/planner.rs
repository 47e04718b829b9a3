//! Planner agent: decides which entities a workflow needs before anything is generated.
//!
//! The Planner sees the documented entities extracted from the retrieved
//! context and any feedback from earlier rounds. Its output is a [`Plan`];
//! a plan that needs entities while none are available is a hard stop.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use super::context::{AgentScope, PipelineContext};
use super::plan::Plan;
use super::supervisor::{SAFE_ENTITY_TYPES, SUPERVISION_DOCUMENTS};
use super::types::{AgentError, AgentRole, PlannerStats, PlannerStatsSnapshot};
use crate::knowledge::{documented_entities, DocumentedEntity, EntityTypeExtractor};
use crate::llm::{CompletionBackend, CompletionRequest};

/// Documents scanned for entity types when building the prompt.
const PROMPT_DOCUMENTS: usize = 20;

const PLAN_SCHEMA: &str = r#"{
  "analysis": {"description": "...", "functionalities": ["..."], "complexity": "simple|medium|complex"},
  "reasoning": ["step by step thinking"],
  "requiredNodes": [{"name": "...", "type": "exact type string", "purpose": "...", "exists": true, "verified": true}],
  "availableNodes": [{"name": "...", "type": "..."}],
  "missingNodes": [{"name": "...", "reason": "...", "alternative": "n8n-nodes-base.httpRequest"}],
  "executionFlow": ["1. ...", "2. ..."],
  "recommendations": ["..."],
  "warnings": ["..."],
  "readyToGenerate": true
}"#;

pub struct Planner {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_output_tokens: u32,
    extractor: Arc<dyn EntityTypeExtractor>,
    stats: PlannerStats,
}

impl Planner {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        extractor: Arc<dyn EntityTypeExtractor>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            max_output_tokens: 8000,
            extractor,
            stats: PlannerStats::default(),
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn stats(&self) -> PlannerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Produce a Plan for `request` in the current round.
    ///
    /// # Errors
    /// - `PlanInvalid` when entities are required but none are available
    /// - `Llm` when the backend fails after retries or never returns a parseable plan
    pub async fn plan(
        &self,
        request: &str,
        ctx: &PipelineContext,
        scope: &AgentScope,
    ) -> Result<Plan, AgentError> {
        let documented = documented_entities(
            &ctx.knowledge.documents,
            self.extractor.as_ref(),
            PROMPT_DOCUMENTS,
        );
        let system = build_system_prompt(ctx, &documented);
        let prompt = format!(
            "<user_request>{}</user_request>\n\nProduce the execution plan for this request (JSON only):",
            request.trim()
        );
        let completion_request = CompletionRequest::new(system, prompt, &self.model)
            .with_max_output_tokens(self.max_output_tokens)
            .with_temperature(0.3);

        let (plan, _model) = scope
            .complete_parsed(
                AgentRole::Planner,
                self.backend.as_ref(),
                &completion_request,
                Plan::parse,
            )
            .await?;

        // Checked against the same document window the Supervisor uses.
        let vetted = documented_entities(
            &ctx.knowledge.documents,
            self.extractor.as_ref(),
            SUPERVISION_DOCUMENTS,
        );
        let plan = reconcile(plan, ctx, &vetted);
        tracing::info!(
            round = ctx.round,
            required = plan.required_entities.len(),
            available = plan.available_entities.len(),
            missing = plan.missing_entities.len(),
            "Plan created"
        );
        for warning in plan.validation_warnings() {
            tracing::warn!(round = ctx.round, "Plan warning: {}", warning);
        }

        if plan.is_hard_stop() {
            self.stats.record(true);
            tracing::error!(
                required = plan.required_entities.len(),
                documents = ctx.knowledge.documents.len(),
                "No required entity is available in the knowledge base"
            );
            return Err(AgentError::PlanInvalid {
                required: plan.required_entities.len(),
                plan: Box::new(plan),
            });
        }
        self.stats.record(false);
        Ok(plan)
    }
}

/// Align the model's claims with what retrieval actually returned.
///
/// An entity exists only if its type was found in the retrieved documents or
/// is one of [`SAFE_ENTITY_TYPES`]; `verified` means documented. Available
/// entities are filtered the same way, so a plan built on made-up types
/// becomes a hard stop.
fn reconcile(mut plan: Plan, ctx: &PipelineContext, documented: &[DocumentedEntity]) -> Plan {
    let knowledge = &ctx.knowledge;
    if knowledge.fallback && knowledge.documents.is_empty() {
        plan.available_entities.clear();
        for entity in &mut plan.required_entities {
            entity.exists = false;
            entity.verified = false;
        }
        return plan;
    }

    let known: HashSet<&str> = documented.iter().map(|e| e.entity_type.as_str()).collect();
    let backed = |ty: &str| known.contains(ty) || SAFE_ENTITY_TYPES.contains(&ty);
    for entity in &mut plan.required_entities {
        entity.verified = known.contains(entity.entity_type.as_str());
        if entity.exists && !backed(&entity.entity_type) {
            tracing::warn!(
                round = ctx.round,
                "Plan claims undocumented type {} exists, marking it missing",
                entity.entity_type
            );
            entity.exists = false;
        }
    }
    plan.available_entities.retain(|e| backed(&e.entity_type));
    plan
}

fn build_system_prompt(ctx: &PipelineContext, documented: &[DocumentedEntity]) -> String {
    let mut out = String::from(
        "You are an n8n expert who PLANS minimal, efficient workflows before they are built.\n\
Identify the fewest entities that satisfy the request and prefer the documented ones below.\n",
    );

    if documented.is_empty() {
        out.push_str("\nNo documented entities were retrieved for this request.\n");
    } else {
        out.push_str("\n## Documented entities (exact types)\n");
        for entity in documented {
            let _ = writeln!(out, "- {}\n  TYPE: \"{}\"", entity.name, entity.entity_type);
        }
    }

    let detected = &ctx.knowledge.detected_entities;
    let _ = writeln!(
        out,
        "\n## Entities detected in the request\n{}",
        if detected.is_empty() { "none".to_string() } else { detected.join(", ") }
    );

    out.push_str(
        "\n## Rules\n\
1. Use the minimum number of nodes. Do not add Set or Code nodes unless asked.\n\
2. If the request reacts to something new, use the native trigger entity when documented.\n\
3. A documented entity must be used natively, never through an HTTP call.\n\
4. An entity that is not documented goes in missingNodes with alternative n8n-nodes-base.httpRequest.\n\
5. Copy type strings exactly. LangChain types keep the @n8n/ prefix.\n\
6. availableNodes lists only required entities that appear in the documented list.\n",
    );

    if ctx.has_feedback() {
        out.push_str("\n## Feedback from the previous attempt\n");
        if let Some(ref feedback) = ctx.supervisor_feedback {
            let _ = writeln!(out, "{}", feedback);
        }
        for (i, error) in ctx.previous_errors.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, error);
        }
        let invented = ctx.invented_types();
        if !invented.is_empty() {
            let _ = writeln!(out, "Rejected as invented, do not plan them again: {}", invented.join(", "));
        }
    }

    let _ = write!(out, "\nAnswer with one JSON object of this shape:\n{}\n", PLAN_SCHEMA);
    out
}

//! Supervisor agent: decides whether a candidate may leave the pipeline.
//!
//! Two layers. Local rules catch structural defects without a backend call.
//! The verifier backend then checks every node against the documented
//! entities, and a deterministic gate rejects any type the Plan never allowed,
//! whatever the verifier says.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;

use super::context::{AgentScope, PipelineContext};
use super::plan::Plan;
use super::types::{
    AgentError, AgentRole, InventedEntity, SupervisionVerdict, SupervisorStats,
    SupervisorStatsSnapshot, ValidEntity,
};
use crate::knowledge::{documented_entities, DocumentedEntity, EntityTypeExtractor};
use crate::llm::{CompletionBackend, CompletionRequest, LlmError};
use crate::util::parse_json_lenient;
use crate::workflow::WorkflowDocument;

/// Types accepted in any candidate, documented or not.
pub const SAFE_ENTITY_TYPES: &[&str] = &[
    "n8n-nodes-base.httpRequest",
    "n8n-nodes-base.code",
    "n8n-nodes-base.if",
    "n8n-nodes-base.switch",
    "n8n-nodes-base.merge",
    "n8n-nodes-base.set",
];

/// Documents scanned for entity types during supervision.
pub(crate) const SUPERVISION_DOCUMENTS: usize = 100;

const SYSTEM_PROMPT: &str = "You audit n8n workflow documents for invented node types. \
You answer with a single JSON object.";

/// A structural defect found without consulting the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDefect {
    pub node: String,
    pub field: &'static str,
    pub reason: &'static str,
}

impl LocalDefect {
    pub fn fix_instruction(&self) -> String {
        format!("Fix field \"{}\" on node \"{}\": {}", self.field, self.node, self.reason)
    }
}

/// Root-level `authentication`, and root-level `continueOnFail` that is not
/// mirrored under `parameters.options`.
pub fn detect_local_defects(doc: &WorkflowDocument) -> Vec<LocalDefect> {
    let mut defects = Vec::new();
    for node in &doc.nodes {
        if node.root_field("authentication").is_some() {
            defects.push(LocalDefect {
                node: node.name.clone(),
                field: "authentication",
                reason: "there is no root authentication field; use credentials or nothing",
            });
        }
        if node.root_field("continueOnFail").is_some() && node.nested_continue_on_fail().is_none() {
            defects.push(LocalDefect {
                node: node.name.clone(),
                field: "continueOnFail",
                reason: "continueOnFail belongs in parameters.options, not at the node root",
            });
        }
    }
    defects
}

/// Nodes whose type is not in [`SAFE_ENTITY_TYPES`] and is not both allowed
/// by the Plan and found in `documented`.
///
/// The Plan alone never vouches for a type: what the Planner marked as
/// existing is checked again against the retrieved documents.
pub fn deterministic_invented(
    doc: &WorkflowDocument,
    plan: &Plan,
    documented: &[DocumentedEntity],
) -> Vec<InventedEntity> {
    let documented_types: HashSet<&str> =
        documented.iter().map(|e| e.entity_type.as_str()).collect();
    let planned: HashSet<&str> = plan.allowed_types().into_iter().collect();
    doc.nodes
        .iter()
        .filter(|node| {
            let ty = node.entity_type.as_str();
            !SAFE_ENTITY_TYPES.contains(&ty)
                && !(planned.contains(ty) && documented_types.contains(ty))
        })
        .map(|node| InventedEntity {
            name: node.name.clone(),
            claimed_type: node.entity_type.clone(),
            reason: if node.entity_type.is_empty() {
                "node declares no type".to_string()
            } else if planned.contains(node.entity_type.as_str()) {
                "type is not found in the documentation".to_string()
            } else {
                "type is not among the plan's allowed entities".to_string()
            },
            suggested_fix: None,
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifierReport {
    #[serde(default)]
    approved: bool,
    #[serde(default)]
    valid_nodes: Vec<RawEntity>,
    #[serde(default)]
    invented_nodes: Vec<RawEntity>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "qualityScore")]
    score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    suggested_fix: Option<String>,
}

fn parse_report(text: &str) -> Result<VerifierReport, LlmError> {
    let value = parse_json_lenient(text)
        .map_err(|e| LlmError::parse_error(format!("Verifier output is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(LlmError::parse_error("Verifier output must be a JSON object".to_string()));
    }
    serde_json::from_value(value)
        .map_err(|e| LlmError::parse_error(format!("Verifier output has an unexpected shape: {}", e)))
}

pub struct Supervisor {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_output_tokens: u32,
    extractor: Arc<dyn EntityTypeExtractor>,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        extractor: Arc<dyn EntityTypeExtractor>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            max_output_tokens: 2000,
            extractor,
            stats: SupervisorStats::default(),
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stats(&self) -> SupervisorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Judge `candidate` in round `attempt` of `max_attempts`.
    ///
    /// A rejection in the last round is terminal. Local defects in an earlier
    /// round reject immediately without a verifier call.
    ///
    /// # Errors
    /// Verifier backend failures after retries.
    #[allow(clippy::too_many_arguments)]
    pub async fn supervise(
        &self,
        candidate: &WorkflowDocument,
        request: &str,
        ctx: &PipelineContext,
        plan: &Plan,
        attempt: u32,
        max_attempts: u32,
        scope: &AgentScope,
    ) -> Result<SupervisionVerdict, AgentError> {
        let defects = detect_local_defects(candidate);
        let last_round = attempt >= max_attempts;

        if !defects.is_empty() && !last_round {
            let fixes: Vec<String> = defects.iter().map(LocalDefect::fix_instruction).collect();
            tracing::warn!(
                attempt,
                defects = defects.len(),
                "Candidate has local defects, rejecting without verifier"
            );
            self.stats.record(false);
            return Ok(SupervisionVerdict {
                approved: false,
                valid_entities: Vec::new(),
                invented_entities: Vec::new(),
                feedback: numbered("Validation errors detected:", &fixes),
                suggested_fixes: fixes,
                quality_score: None,
                attempt,
                terminal: false,
                local_only: true,
            });
        }

        let documented = documented_entities(
            &ctx.knowledge.documents,
            self.extractor.as_ref(),
            SUPERVISION_DOCUMENTS,
        );
        let prompt = build_prompt(request, candidate, plan, &documented)?;
        let completion_request = CompletionRequest::new(SYSTEM_PROMPT, prompt, &self.model)
            .with_max_output_tokens(self.max_output_tokens)
            .with_temperature(0.0);

        let (report, _model) = scope
            .complete_parsed(
                AgentRole::Supervisor,
                self.backend.as_ref(),
                &completion_request,
                parse_report,
            )
            .await?;

        // Only retrieval and the safe set vouch for an entity, never the Plan.
        let vouched: HashSet<&str> = documented
            .iter()
            .flat_map(|e| [e.name.as_str(), e.entity_type.as_str()])
            .chain(ctx.knowledge.detected_entities.iter().map(String::as_str))
            .chain(SAFE_ENTITY_TYPES.iter().copied())
            .collect();

        let mut invented = deterministic_invented(candidate, plan, &documented);
        for claimed in report.invented_nodes {
            if vouched.contains(claimed.name.as_str()) || vouched.contains(claimed.entity_type.as_str()) {
                tracing::debug!("Ignoring verifier claim on documented entity {}", claimed.entity_type);
                continue;
            }
            let duplicate = invented
                .iter()
                .any(|e| e.name == claimed.name && e.claimed_type == claimed.entity_type);
            if !duplicate {
                invented.push(InventedEntity {
                    name: claimed.name,
                    claimed_type: claimed.entity_type,
                    reason: claimed
                        .reason
                        .unwrap_or_else(|| "not found in the documentation".to_string()),
                    suggested_fix: claimed.suggested_fix,
                });
            }
        }

        let approved = report.approved && defects.is_empty() && invented.is_empty();
        let terminal = !approved && last_round;

        let mut suggested_fixes: Vec<String> =
            invented.iter().map(InventedEntity::fix_instruction).collect();
        suggested_fixes.extend(defects.iter().map(LocalDefect::fix_instruction));

        let feedback = match report.feedback.map(|f| f.trim().to_string()) {
            Some(f) if !f.is_empty() => f,
            _ if approved => String::new(),
            _ => numbered("The candidate was rejected:", &suggested_fixes),
        };
        if let Some(ref reasoning) = report.reasoning {
            tracing::debug!(attempt, "Verifier reasoning: {}", reasoning);
        }

        self.stats.record(approved);
        tracing::info!(
            attempt,
            approved,
            terminal,
            invented = invented.len(),
            "Supervision finished"
        );

        Ok(SupervisionVerdict {
            approved,
            valid_entities: report
                .valid_nodes
                .into_iter()
                .map(|v| ValidEntity {
                    name: v.name,
                    entity_type: v.entity_type,
                })
                .collect(),
            invented_entities: invented,
            feedback,
            suggested_fixes,
            quality_score: report.score,
            attempt,
            terminal,
            local_only: false,
        })
    }
}

fn numbered(heading: &str, items: &[String]) -> String {
    let mut out = heading.to_string();
    for (i, item) in items.iter().enumerate() {
        let _ = write!(out, "\n{}. {}", i + 1, item);
    }
    out
}

fn build_prompt(
    request: &str,
    candidate: &WorkflowDocument,
    plan: &Plan,
    documented: &[DocumentedEntity],
) -> Result<String, LlmError> {
    let rendered = serde_json::to_string_pretty(candidate)
        .map_err(|e| LlmError::parse_error(format!("Cannot render candidate: {}", e)))?;

    let mut out = String::new();
    let _ = writeln!(out, "<user_request>\n{}\n</user_request>\n", request.trim());
    out.push_str("## Documented entities\n");
    if documented.is_empty() {
        out.push_str("(none retrieved)\n");
    }
    for entity in documented {
        let _ = writeln!(out, "- {}: {}", entity.name, entity.entity_type);
    }
    let _ = writeln!(out, "\n## Always valid\n{}", SAFE_ENTITY_TYPES.join(", "));
    let allowed: Vec<&str> = plan
        .allowed_types()
        .into_iter()
        .filter(|ty| documented.iter().any(|e| e.entity_type == *ty))
        .collect();
    if !allowed.is_empty() {
        let _ = writeln!(out, "\n## Allowed by the plan\n{}", allowed.join(", "));
    }
    out.push_str(
        "\n## Rules\n\
1. A node whose exact type appears above is valid.\n\
2. Any other type is invented: list it in inventedNodes and set approved to false.\n\
3. Give each invented node a reason and, where possible, a suggestedFix naming a documented replacement.\n\
4. Rate overall quality from 0 to 100 in score.\n\
\nAnswer with JSON of this shape:\n\
{\"approved\": true, \"validNodes\": [{\"name\": \"...\", \"type\": \"...\"}], \
\"inventedNodes\": [{\"name\": \"...\", \"type\": \"...\", \"reason\": \"...\", \"suggestedFix\": \"...\"}], \
\"feedback\": \"...\", \"reasoning\": \"...\", \"score\": 0}\n\n## Candidate\n",
    );
    out.push_str(&rendered);
    Ok(out)
}

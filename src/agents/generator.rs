//! Generator agent: turns a Plan into a candidate workflow document.
//!
//! The prompt pins the model to the entities the Plan allows. Whatever the
//! model returns is parsed leniently, must contain at least one node, and is
//! then run through [`postprocess`](super::postprocess::postprocess).

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::context::{AgentScope, PipelineContext};
use super::plan::Plan;
use super::postprocess::postprocess;
use super::types::{AgentError, AgentRole, GeneratorStats, GeneratorStatsSnapshot};
use crate::knowledge::KnowledgeDocument;
use crate::llm::{CompletionBackend, CompletionRequest, LlmError};
use crate::util::{parse_json_lenient, truncate_chars};
use crate::workflow::WorkflowDocument;

const PROMPT_DOCUMENTS: usize = 20;
const DOCUMENT_EXCERPT_CHARS: usize = 600;
const FALLBACK_ENTITY: &str = "n8n-nodes-base.httpRequest";

const SYSTEM_PROMPT: &str = "You build n8n workflow documents. You answer with a single JSON object \
with the keys name, nodes, connections and settings. You only use node types you were explicitly allowed to use.";

/// A post-processed candidate and how it was produced.
#[derive(Debug, Clone)]
pub struct Generated {
    pub workflow: WorkflowDocument,
    pub model: String,
    pub duration: Duration,
}

/// Suggested entry point for a request that reads like it needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHint {
    pub entity_type: &'static str,
    pub reason: &'static str,
}

const TRIGGER_RULES: &[(&[&str], TriggerHint)] = &[
    (
        &["every day", "every hour", "every week", "every month", "daily", "weekly", "monthly", "hourly", "each morning", "schedule"],
        TriggerHint {
            entity_type: "n8n-nodes-base.scheduleTrigger",
            reason: "the request describes a recurring schedule",
        },
    ),
    (
        &["form submission", "submits a form", "form is submitted", "form"],
        TriggerHint {
            entity_type: "n8n-nodes-base.formTrigger",
            reason: "the request starts from a form",
        },
    ),
    (
        &["webhook", "api call", "http request", "incoming request"],
        TriggerHint {
            entity_type: "n8n-nodes-base.webhook",
            reason: "the request starts from an inbound HTTP call",
        },
    ),
    (
        &["new email", "email arrives", "receive an email", "receives an email", "when an email"],
        TriggerHint {
            entity_type: "n8n-nodes-base.emailReadImap",
            reason: "the request reacts to incoming email",
        },
    ),
    (
        &["chatbot", "chat message", "chat"],
        TriggerHint {
            entity_type: "n8n-nodes-base.webhook",
            reason: "the request reacts to chat messages",
        },
    ),
];

/// First matching trigger rule for the request, if any.
pub fn detect_trigger_need(request: &str) -> Option<TriggerHint> {
    let lowered = request.to_lowercase();
    TRIGGER_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, hint)| *hint)
}

/// Parse model output into a workflow document with at least one node.
pub fn parse_candidate(text: &str) -> Result<WorkflowDocument, LlmError> {
    let mut value = parse_json_lenient(text)
        .map_err(|e| LlmError::parse_error(format!("Candidate is not valid JSON: {}", e)))?;
    // Some models wrap the document: {"workflow": {...}}
    if value.get("nodes").is_none() {
        if let Some(inner) = value.get_mut("workflow").filter(|w| w.is_object()) {
            value = inner.take();
        }
    }
    let doc: WorkflowDocument = serde_json::from_value(value)
        .map_err(|e| LlmError::parse_error(format!("Candidate has an unexpected shape: {}", e)))?;
    if doc.nodes.is_empty() {
        return Err(LlmError::parse_error("Candidate has no nodes".to_string()));
    }
    Ok(doc)
}

pub struct Generator {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_output_tokens: u32,
    stats: GeneratorStats,
}

impl Generator {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            max_output_tokens: 8000,
            stats: GeneratorStats::default(),
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stats(&self) -> GeneratorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Produce one post-processed candidate for `plan`.
    ///
    /// # Errors
    /// Backend failures after retries, and output that never parses into a
    /// document with nodes.
    pub async fn generate(
        &self,
        request: &str,
        ctx: &PipelineContext,
        plan: &Plan,
        scope: &AgentScope,
    ) -> Result<Generated, AgentError> {
        let started = Instant::now();
        let prompt = build_prompt(request, ctx, plan);
        let completion_request = CompletionRequest::new(SYSTEM_PROMPT, prompt, &self.model)
            .with_max_output_tokens(self.max_output_tokens)
            .with_temperature(0.1);

        let result = scope
            .complete_parsed(
                AgentRole::Generator,
                self.backend.as_ref(),
                &completion_request,
                parse_candidate,
            )
            .await;

        let (doc, model) = match result {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.record_failure();
                tracing::warn!(round = ctx.round, error = %e, "Generation failed");
                return Err(e.into());
            }
        };

        let workflow = postprocess(doc);
        let duration = started.elapsed();
        self.stats
            .record_success(ctx.knowledge.documents.len(), duration.as_millis() as u64);
        tracing::info!(
            round = ctx.round,
            nodes = workflow.nodes.len(),
            duration_ms = duration.as_millis() as u64,
            "Generated candidate"
        );
        Ok(Generated {
            workflow,
            model,
            duration,
        })
    }
}

fn render_documents(out: &mut String, documents: &[KnowledgeDocument]) {
    let mut ranked: Vec<&KnowledgeDocument> = documents.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (i, doc) in ranked.into_iter().take(PROMPT_DOCUMENTS).enumerate() {
        let _ = writeln!(out, "\n[{}] {}", i + 1, doc.title);
        if let Some(ref ty) = doc.entity_type {
            let _ = writeln!(out, "Type: {}", ty);
        }
        if let Some(ref url) = doc.url {
            let _ = writeln!(out, "Source: {}", url);
        }
        if !doc.integrations.is_empty() {
            let shown: Vec<&str> = doc.integrations.iter().take(5).map(String::as_str).collect();
            let _ = writeln!(out, "Uses: {}", shown.join(", "));
        }
        let _ = writeln!(out, "{}", truncate_chars(&doc.content, DOCUMENT_EXCERPT_CHARS));
    }
}

fn build_prompt(request: &str, ctx: &PipelineContext, plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<user_request>\n{}\n</user_request>", request.trim());

    let knowledge = &ctx.knowledge;
    if !knowledge.documents.is_empty() {
        out.push_str("\n## Documentation\nUse ONLY node types shown in these documents.\n");
        render_documents(&mut out, &knowledge.documents);
    }
    if !knowledge.detected_entities.is_empty() {
        let _ = writeln!(out, "\nDetected in the request: {}", knowledge.detected_entities.join(", "));
    }
    if !knowledge.suggested_flow.is_empty() {
        let _ = writeln!(out, "Suggested flow: {}", knowledge.suggested_flow.join(" → "));
    }

    out.push_str("\n## Plan\n");
    if !plan.analysis.description.is_empty() {
        let _ = writeln!(out, "{}", plan.analysis.description);
    }
    for entity in &plan.required_entities {
        let status = if entity.is_allowed() { "ALLOWED" } else { "FORBIDDEN" };
        let _ = writeln!(
            out,
            "- {} [{}] type=\"{}\" purpose: {}",
            entity.name, status, entity.entity_type, entity.purpose
        );
    }
    if !plan.missing_entities.is_empty() {
        out.push_str("\nMissing entities, replace each with its alternative:\n");
        for missing in &plan.missing_entities {
            let _ = writeln!(
                out,
                "- {} ({}) -> {}",
                missing.name,
                missing.reason,
                missing.alternative.as_deref().unwrap_or(FALLBACK_ENTITY)
            );
        }
    }
    if !plan.execution_flow.is_empty() {
        out.push_str("\nExecution flow:\n");
        for (i, step) in plan.execution_flow.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, step);
        }
    }
    if !plan.warnings.is_empty() {
        let _ = writeln!(out, "\nPlan warnings: {}", plan.warnings.join("; "));
    }

    if !ctx.previous_errors.is_empty() {
        out.push_str("\n## Errors to fix from the previous attempt\n");
        for (i, error) in ctx.previous_errors.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, error);
        }
    }
    let invented = ctx.invented_types();
    if !invented.is_empty() {
        let _ = writeln!(out, "\nThese types were rejected as invented, never use them: {}", invented.join(", "));
    }

    let allowed = plan.allowed_types();
    out.push_str("\n## Rules\n");
    let _ = writeln!(
        out,
        "- Use exactly these types and nothing else: {}",
        if allowed.is_empty() { FALLBACK_ENTITY.to_string() } else { allowed.join(", ") }
    );
    let _ = writeln!(
        out,
        "- For any missing service use {} against its public API.",
        FALLBACK_ENTITY
    );
    out.push_str("- Zero invented nodes. Copy type strings exactly, including case and the @n8n/ prefix.\n");
    match detect_trigger_need(request) {
        Some(hint) if allowed.contains(&hint.entity_type) => {
            let _ = writeln!(out, "- Start with a {} node: {}.", hint.entity_type, hint.reason);
        }
        Some(hint) => {
            let _ = writeln!(out, "- Start with an allowed trigger node: {}.", hint.reason);
        }
        None => {}
    }
    out.push_str(
        "- Error handling goes in parameters.options.continueOnFail, never at the node root. \
Never put authentication at the node root.\n",
    );
    out.push_str("\nReply with the workflow JSON only.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::RetrievedContext;
    use crate::test_support::{scope, ScriptedBackend};

    fn plan() -> Plan {
        Plan::parse(
            r#"{"requiredNodes": [
                {"name": "Webhook", "type": "n8n-nodes-base.webhook", "exists": true},
                {"name": "Slack", "type": "n8n-nodes-base.slack", "exists": true},
                {"name": "Veo", "type": "n8n-nodes-base.veo", "exists": false}
            ],
            "availableNodes": [{"name": "Webhook", "type": "n8n-nodes-base.webhook"}],
            "missingNodes": [{"name": "Veo", "reason": "undocumented"}],
            "executionFlow": ["receive", "notify"]}"#,
        )
        .unwrap()
    }

    const CANDIDATE: &str = r#"Here you go:
```json
{"name": "Form to Slack", "nodes": [
  {"name": "Webhook", "type": "n8n-nodes-base.webhook", "parameters": {}},
  {"name": "Slack", "type": "n8n-nodes-base.slack", "continueOnFail": true, "parameters": {}}
], "connections": {"Webhook": {"main": [[{"node": "Slack", "type": "main", "index": 0}]]}}}
```"#;

    #[test]
    fn prompt_marks_allowed_and_forbidden_entities() {
        let ctx = PipelineContext::new(RetrievedContext::default(), vec!["Node 'X' missing".to_string()]);
        let prompt = build_prompt("Post webhook data to Slack", &ctx, &plan());
        assert!(prompt.contains("Webhook [ALLOWED]"));
        assert!(prompt.contains("Veo [FORBIDDEN]"));
        assert!(prompt.contains("Veo (undocumented) -> n8n-nodes-base.httpRequest"));
        assert!(prompt.contains("1. Node 'X' missing"));
        assert!(prompt.contains("Start with a n8n-nodes-base.webhook node"));
        assert!(prompt.contains("Use exactly these types and nothing else: n8n-nodes-base.webhook, n8n-nodes-base.slack"));
    }

    #[test]
    fn trigger_detection() {
        assert_eq!(
            detect_trigger_need("Send a report every day at 9").map(|h| h.entity_type),
            Some("n8n-nodes-base.scheduleTrigger")
        );
        assert_eq!(detect_trigger_need("Translate this text"), None);
    }

    #[test]
    fn candidate_parsing() {
        let doc = parse_candidate(CANDIDATE).unwrap();
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.connection_count(), 1);

        let wrapped = parse_candidate(r#"{"workflow": {"nodes": [{"name": "A", "type": "n8n-nodes-base.set"}]}}"#).unwrap();
        assert_eq!(wrapped.nodes[0].name, "A");

        let empty = parse_candidate(r#"{"nodes": []}"#).unwrap_err();
        assert_eq!(empty.kind, crate::llm::LlmErrorKind::ParseError);
    }

    #[tokio::test]
    async fn generate_postprocesses_the_candidate() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(ScriptedBackend::reply(CANDIDATE))]));
        let generator = Generator::new(backend.clone(), "claude-haiku-4-5");
        let ctx = PipelineContext::new(RetrievedContext::default(), Vec::new());

        let generated = generator
            .generate("Post webhook data to Slack", &ctx, &plan(), &scope())
            .await
            .unwrap();

        let slack = generated.workflow.node("Slack").unwrap();
        assert!(slack.root_field("continueOnFail").is_none());
        assert_eq!(slack.nested_continue_on_fail(), Some(&serde_json::json!(true)));
        assert!(generated.workflow.nodes.iter().all(|n| n.id.is_some()));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(generator.stats().generated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_output_is_retried_then_fails() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(ScriptedBackend::reply("no json here")),
            Ok(ScriptedBackend::reply("still nothing")),
            Ok(ScriptedBackend::reply("{\"nodes\": []}")),
            Ok(ScriptedBackend::reply("nope")),
        ]));
        let generator = Generator::new(backend.clone(), "claude-haiku-4-5");
        let ctx = PipelineContext::new(RetrievedContext::default(), Vec::new());

        let err = generator
            .generate("anything", &ctx, &plan(), &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(ref e) if e.kind == crate::llm::LlmErrorKind::ParseError));
        assert_eq!(backend.call_count(), 4);
        assert_eq!(generator.stats().failed, 1);
    }
}

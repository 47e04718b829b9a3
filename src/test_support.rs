//! Deterministic doubles for the pipeline's collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentScope;
use crate::cost::TokenUsage;
use crate::events::{EventEmitter, EventSink, PipelineEvent};
use crate::knowledge::{KnowledgeRetriever, RetrievalOptions, RetrievedContext};
use crate::llm::{Completion, CompletionBackend, CompletionRequest, LlmError};
use crate::retry::{CallBudget, RetryPolicy};
use crate::validation::{BasicStructuralValidator, StructuralValidator, ValidationReport};
use crate::workflow::WorkflowDocument;

/// Backend that replays queued results in order and logs every request.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Completion, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A backend answering each call with the next text.
    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(Self::reply(t))).collect())
    }

    /// A completion with fixed usage; the model is filled from the request.
    pub fn reply(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            usage: TokenUsage::new(1000, 500),
            model: String::new(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(mut completion)) => {
                if completion.model.is_empty() {
                    completion.model = request.model.clone();
                }
                Ok(completion)
            }
            Some(Err(e)) => Err(e),
            None => Err(LlmError::unavailable(None, "script exhausted".to_string())),
        }
    }
}

/// Retriever returning the same context for every request.
pub(crate) struct StaticRetriever {
    context: RetrievedContext,
}

impl StaticRetriever {
    pub fn new(context: RetrievedContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticRetriever {
    async fn get_context(&self, _text: &str, _options: &RetrievalOptions) -> RetrievedContext {
        self.context.clone()
    }
}

/// Sink that keeps every event it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(String, PipelineEvent)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, PipelineEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.name())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, session_id: &str, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap()
            .push((session_id.to_string(), event.clone()));
    }
}

/// Validator replaying queued reports, then deferring to the basic checks.
pub(crate) struct ScriptedValidator {
    reports: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedValidator {
    pub fn new(reports: Vec<ValidationReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
        }
    }
}

#[async_trait]
impl StructuralValidator for ScriptedValidator {
    async fn validate(&self, doc: &WorkflowDocument) -> ValidationReport {
        let next = self.reports.lock().unwrap().pop_front();
        next.unwrap_or_else(|| BasicStructuralValidator.check(doc))
    }
}

/// A generous scope with no events, ledger or cancellation.
pub(crate) fn scope() -> AgentScope {
    AgentScope {
        session_id: None,
        budget: CallBudget::new(
            Duration::from_secs(60),
            Instant::now() + Duration::from_secs(600),
            CancellationToken::new(),
        ),
        retry: RetryPolicy::default(),
        events: EventEmitter::disabled(),
        ledger: None,
    }
}

//! Progress events emitted while a request moves through the pipeline.
//!
//! Sinks are injected per orchestrator; there is no process-wide hook. A
//! pipeline without a sink behaves identically, it just reports nothing.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::agents::AgentRole;
use crate::complexity::ComplexityTier;

/// A pipeline state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ContextRetrieved {
        documents: usize,
        detected_entities: usize,
        fallback: bool,
    },
    PlanCreated {
        round: u32,
        required: usize,
        available: usize,
        missing: usize,
        complexity: ComplexityTier,
    },
    /// Plan needs entities but none are documented; the request stops here.
    PlanRejected {
        round: u32,
        required: usize,
        reason: String,
    },
    GenerationStarted {
        round: u32,
        auto_fix: bool,
        timeout_secs: u64,
    },
    GenerationFinished {
        round: u32,
        nodes: usize,
        duration_ms: u64,
    },
    SupervisionStarted {
        round: u32,
        max_rounds: u32,
    },
    SupervisionApproved {
        round: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality_score: Option<f64>,
    },
    SupervisionRejected {
        round: u32,
        invented: Vec<String>,
        feedback: String,
        terminal: bool,
    },
    SupervisionRetry {
        next_round: u32,
        feedback: String,
    },
    RateLimitBackoff {
        role: AgentRole,
        retry: u32,
        delay_ms: u64,
    },
    ValidationFinished {
        valid: bool,
        errors: usize,
        warnings: usize,
    },
    AutoFixStarted {
        errors: usize,
    },
    Completed {
        attempts: u32,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    /// Stable event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::ContextRetrieved { .. } => "context_retrieved",
            PipelineEvent::PlanCreated { .. } => "plan_created",
            PipelineEvent::PlanRejected { .. } => "plan_rejected",
            PipelineEvent::GenerationStarted { .. } => "generation_started",
            PipelineEvent::GenerationFinished { .. } => "generation_finished",
            PipelineEvent::SupervisionStarted { .. } => "supervision_started",
            PipelineEvent::SupervisionApproved { .. } => "supervision_approved",
            PipelineEvent::SupervisionRejected { .. } => "supervision_rejected",
            PipelineEvent::SupervisionRetry { .. } => "supervision_retry",
            PipelineEvent::RateLimitBackoff { .. } => "rate_limit_backoff",
            PipelineEvent::ValidationFinished { .. } => "validation_finished",
            PipelineEvent::AutoFixStarted { .. } => "auto_fix_started",
            PipelineEvent::Completed { .. } => "completed",
        }
    }
}

/// Receiver of pipeline progress. Fire-and-forget: must not block or fail.
pub trait EventSink: Send + Sync {
    fn emit(&self, session_id: &str, event: &PipelineEvent);
}

/// Per-request handle carrying the optional sink and the session it reports for.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
    session_id: String,
}

impl EventEmitter {
    pub fn new(sink: Option<Arc<dyn EventSink>>, session_id: impl Into<String>) -> Self {
        Self {
            sink,
            session_id: session_id.into(),
        }
    }

    /// An emitter that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(ref sink) = self.sink {
            sink.emit(&self.session_id, &event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("session_id", &self.session_id)
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

/// An event tagged with its session, as delivered to broadcast subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Fans events out to any number of subscribers over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, session_id: &str, event: &PipelineEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event: event.clone(),
        });
    }
}

/// Writes every event to the `tracing` log at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, session_id: &str, event: &PipelineEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => tracing::info!(session_id = %session_id, event = event.name(), "{}", payload),
            Err(e) => tracing::error!("Failed to serialize pipeline event: {}", e),
        }
    }
}

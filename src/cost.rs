//! Token usage, model pricing, and the per-session cost ledger.
//!
//! Costs are kept in nanodollars (1 USD = 1_000_000_000 nanodollars) to avoid
//! floating-point drift, and reported in cents.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentRole;

/// Model pricing in nanodollars per token.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars
    pub input_nano_per_token: u64,
    /// Cost per output token in nanodollars
    pub output_nano_per_token: u64,
}

/// Token usage from a completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Check if there's any usage to compute cost from.
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }
}

/// Normalize model names to canonical form for pricing lookup.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    // Provider prefixes such as "anthropic/" or "openai/" are irrelevant here.
    let trimmed = trimmed.rsplit('/').next().unwrap_or(trimmed);

    match trimmed {
        s if s.contains("claude-haiku-4") || s.contains("claude-4-5-haiku") => "claude-haiku-4",
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }

        s if s.contains("gpt-5-mini") => "gpt-5-mini",
        s if s.contains("gpt-5-nano") => "gpt-5-nano",
        s if s.contains("gpt-5") => "gpt-5",
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4.1-mini") => "gpt-4.1-mini",
        s if s.contains("gpt-4.1") => "gpt-4.1",

        _ => trimmed,
    }
}

/// Get pricing for a model. Returns None if model is unknown.
///
/// Formula: $X per 1M tokens = X * 1000 nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    let (input, output) = match normalize_model(model) {
        // Claude Haiku 4.5: $1/1M input, $5/1M output
        "claude-haiku-4" => (1_000, 5_000),
        "claude-sonnet-4" | "claude-3-5-sonnet" => (3_000, 15_000),
        "claude-opus-4" => (15_000, 75_000),
        "claude-3-5-haiku" => (800, 4_000),

        // GPT-5: $1.25/1M input, $10/1M output
        "gpt-5" => (1_250, 10_000),
        "gpt-5-mini" => (250, 2_000),
        "gpt-5-nano" => (50, 400),
        "gpt-4o" => (2_500, 10_000),
        "gpt-4o-mini" => (150, 600),
        "gpt-4.1" => (2_000, 8_000),
        "gpt-4.1-mini" => (400, 1_600),

        _ => return None,
    };
    Some(ModelPricing {
        input_nano_per_token: input,
        output_nano_per_token: output,
    })
}

/// Cost in nanodollars; unknown models cost 0 and log a warning.
pub fn cost_nano_from_usage(model: &str, usage: &TokenUsage) -> u64 {
    if !usage.has_usage() {
        return 0;
    }

    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation, using 0 cost");
        return 0;
    };

    usage
        .input_tokens
        .saturating_mul(pricing.input_nano_per_token)
        .saturating_add(
            usage
                .output_tokens
                .saturating_mul(pricing.output_nano_per_token),
        )
}

/// Round nanodollars to the nearest cent.
pub fn nano_to_cents(cost_nano: u64) -> u64 {
    (cost_nano + 5_000_000) / 10_000_000
}

pub fn cost_cents_from_usage(model: &str, usage: &TokenUsage) -> u64 {
    nano_to_cents(cost_nano_from_usage(model, usage))
}

/// Sink for per-call token usage.
///
/// Implementations must tolerate unknown session ids: recording against a
/// session that was never started is logged and ignored.
pub trait UsageLedger: Send + Sync {
    fn start_session(&self, session_id: &str);

    fn record_call(
        &self,
        session_id: &str,
        role: AgentRole,
        backend: &str,
        model: &str,
        usage: &TokenUsage,
    );

    /// Totals so far, for ledgers that keep them.
    fn session_cost(&self, _session_id: &str) -> Option<SessionCost> {
        None
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub role: AgentRole,
    pub backend: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_nano: u64,
    pub at: DateTime<Utc>,
}

/// Aggregate usage for one role within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUsage {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nano: u64,
}

/// Snapshot of a session's spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCost {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub total_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nano: u64,
    pub cost_cents: u64,
    pub by_role: BTreeMap<AgentRole, RoleUsage>,
}

#[derive(Debug)]
struct SessionEntry {
    started_at: DateTime<Utc>,
    by_role: BTreeMap<AgentRole, RoleUsage>,
    calls: Vec<CallRecord>,
}

/// In-memory cost ledger shared by all sessions.
#[derive(Debug, Default)]
pub struct CostLedger {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_cost(&self, session_id: &str) -> Option<SessionCost> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sessions.get(session_id)?;
        let mut cost = SessionCost {
            session_id: session_id.to_string(),
            started_at: entry.started_at,
            total_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_nano: 0,
            cost_cents: 0,
            by_role: entry.by_role.clone(),
        };
        for usage in entry.by_role.values() {
            cost.total_calls += usage.calls;
            cost.input_tokens += usage.input_tokens;
            cost.output_tokens += usage.output_tokens;
            cost.cost_nano += usage.cost_nano;
        }
        cost.cost_cents = nano_to_cents(cost.cost_nano);
        Some(cost)
    }

    /// Recorded calls for a session, oldest first.
    pub fn calls(&self, session_id: &str) -> Vec<CallRecord> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .map(|entry| entry.calls.clone())
            .unwrap_or_default()
    }

    /// Human-readable cost breakdown for a session.
    pub fn report(&self, session_id: &str) -> Option<String> {
        let cost = self.session_cost(session_id)?;
        let mut out = String::new();
        let _ = writeln!(out, "Cost report for session {}", cost.session_id);
        for (role, usage) in &cost.by_role {
            let _ = writeln!(
                out,
                "  {:<10} {:>3} call(s) {:>8} in {:>8} out  ${:.4}",
                role.to_string(),
                usage.calls,
                usage.input_tokens,
                usage.output_tokens,
                usage.cost_nano as f64 / 1e9
            );
        }
        let _ = write!(
            out,
            "  total      {:>3} call(s) {:>8} in {:>8} out  ${:.4}",
            cost.total_calls,
            cost.input_tokens,
            cost.output_tokens,
            cost.cost_nano as f64 / 1e9
        );
        Some(out)
    }

    /// Drop sessions started more than `max_age` ago. Returns how many were removed.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, entry| entry.started_at >= cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!("Removed {} expired cost sessions", removed);
        }
        removed
    }
}

impl UsageLedger for CostLedger {
    fn start_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                started_at: Utc::now(),
                by_role: BTreeMap::new(),
                calls: Vec::new(),
            });
    }

    fn record_call(
        &self,
        session_id: &str,
        role: AgentRole,
        backend: &str,
        model: &str,
        usage: &TokenUsage,
    ) {
        let cost_nano = cost_nano_from_usage(model, usage);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = sessions.get_mut(session_id) else {
            tracing::warn!(session_id = %session_id, role = %role, "Usage recorded for unknown session, ignoring");
            return;
        };

        let totals = entry.by_role.entry(role).or_default();
        totals.calls += 1;
        totals.input_tokens += usage.input_tokens;
        totals.output_tokens += usage.output_tokens;
        totals.cost_nano += cost_nano;

        entry.calls.push(CallRecord {
            role,
            backend: backend.to_string(),
            model: model.to_string(),
            usage: *usage,
            cost_nano,
            at: Utc::now(),
        });

        tracing::debug!(
            session_id = %session_id,
            role = %role,
            backend = %backend,
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Recorded call cost"
        );
    }

    fn session_cost(&self, session_id: &str) -> Option<SessionCost> {
        CostLedger::session_cost(self, session_id)
    }
}

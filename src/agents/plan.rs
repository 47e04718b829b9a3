//! The Planner's structured output, validated at the parse boundary.
//!
//! Model output is deserialized into permissive `Raw*` shapes first and then
//! normalised into [`Plan`]. Anything the rest of the pipeline relies on
//! (entity names, declared types, the complexity label) is checked here.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::complexity::{is_branching_type, ComplexityTier};
use crate::knowledge::local_type_name;
use crate::llm::LlmError;
use crate::util::parse_json_lenient;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAnalysis {
    pub description: String,
    pub functionalities: Vec<String>,
    /// Complexity as reported by the model; the pipeline derives its own
    pub complexity: Option<ComplexityTier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredEntity {
    pub name: String,
    pub entity_type: String,
    pub purpose: String,
    /// Documented in the knowledge base
    pub exists: bool,
    pub verified: bool,
}

impl RequiredEntity {
    /// May the Generator use this entity's type.
    pub fn is_allowed(&self) -> bool {
        self.exists && !self.entity_type.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableEntity {
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEntity {
    pub name: String,
    pub reason: String,
    /// Mandated replacement, usually a generic HTTP call
    pub alternative: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub analysis: PlanAnalysis,
    pub reasoning: Vec<String>,
    pub required_entities: Vec<RequiredEntity>,
    pub available_entities: Vec<AvailableEntity>,
    pub missing_entities: Vec<MissingEntity>,
    pub execution_flow: Vec<String>,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub ready_to_generate: bool,
}

impl Plan {
    /// Parse and validate the Planner backend's text output.
    ///
    /// # Errors
    /// `ParseError` when the text holds no JSON object, or a required entity
    /// has neither a name nor a type.
    pub fn parse(text: &str) -> Result<Self, LlmError> {
        let value = parse_json_lenient(text)
            .map_err(|e| LlmError::parse_error(format!("Plan is not valid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(LlmError::parse_error("Plan must be a JSON object".to_string()));
        }
        let raw: RawPlan = serde_json::from_value(value)
            .map_err(|e| LlmError::parse_error(format!("Plan has an unexpected shape: {}", e)))?;
        raw.validate()
    }

    /// Required entities present but none available: generation must not run.
    pub fn is_hard_stop(&self) -> bool {
        !self.required_entities.is_empty() && self.available_entities.is_empty()
    }

    /// Types the Generator may use, in plan order.
    pub fn allowed_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.required_entities
            .iter()
            .filter(|e| e.is_allowed())
            .map(|e| e.entity_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn has_branching(&self) -> bool {
        self.required_entities
            .iter()
            .any(|e| is_branching_type(&e.entity_type))
    }

    /// Reference complexity tier for sizing time bounds.
    pub fn complexity(&self) -> ComplexityTier {
        ComplexityTier::classify(
            self.required_entities.len(),
            self.missing_entities.len(),
            self.has_branching(),
        )
    }

    /// Non-fatal issues worth surfacing alongside the plan.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.required_entities.is_empty() {
            warnings.push("Plan identifies no required entities".to_string());
        }
        if !self.missing_entities.is_empty() {
            warnings.push(format!(
                "{} entities missing from the knowledge base, alternatives proposed",
                self.missing_entities.len()
            ));
        }
        let unverified = self.required_entities.iter().filter(|e| !e.verified).count();
        if unverified > 0 {
            warnings.push(format!("{} required entities not verified", unverified));
        }
        if self.execution_flow.is_empty() {
            warnings.push("Plan defines no execution flow".to_string());
        }
        warnings
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default)]
    analysis: Option<RawAnalysis>,
    #[serde(default)]
    reasoning: Value,
    #[serde(default, alias = "requiredEntities")]
    required_nodes: Option<Vec<RawRequired>>,
    #[serde(default, alias = "availableEntities")]
    available_nodes: Option<Vec<RawAvailable>>,
    #[serde(default, alias = "missingEntities")]
    missing_nodes: Option<Vec<RawMissing>>,
    #[serde(default)]
    execution_flow: Value,
    #[serde(default)]
    recommendations: Value,
    #[serde(default)]
    warnings: Value,
    #[serde(default)]
    ready_to_generate: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    functionalities: Value,
    #[serde(default)]
    complexity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRequired {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    exists: Option<bool>,
    #[serde(default)]
    verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawAvailable {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMissing {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    alternative: Option<String>,
}

fn clean(value: Option<String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Render a scalar, list or object as display lines.
fn lines(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items.iter().map(inline).filter(|l| !l.is_empty()).collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, inline(v)))
            .collect(),
        other => vec![other.to_string()],
    }
}

fn inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items.iter().map(inline).collect::<Vec<_>>().join(", "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, inline(v)))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl RawPlan {
    fn validate(self) -> Result<Plan, LlmError> {
        let mut required_entities = Vec::new();
        for (idx, raw) in self.required_nodes.unwrap_or_default().into_iter().enumerate() {
            let entity_type = clean(raw.entity_type);
            let mut name = clean(raw.name);
            if name.is_empty() {
                if entity_type.is_empty() {
                    return Err(LlmError::parse_error(format!(
                        "required entity #{} has neither name nor type",
                        idx + 1
                    )));
                }
                name = local_type_name(&entity_type).to_string();
            }
            required_entities.push(RequiredEntity {
                name,
                entity_type,
                purpose: clean(raw.purpose),
                exists: raw.exists.unwrap_or(false),
                verified: raw.verified.unwrap_or(false),
            });
        }

        let available_entities = self
            .available_nodes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| {
                let entity_type = clean(raw.entity_type);
                let name = clean(raw.name);
                (!(name.is_empty() && entity_type.is_empty()))
                    .then_some(AvailableEntity { name, entity_type })
            })
            .collect();

        let missing_entities = self
            .missing_nodes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| {
                let name = clean(raw.name);
                (!name.is_empty()).then(|| MissingEntity {
                    name,
                    reason: clean(raw.reason),
                    alternative: raw.alternative.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
                })
            })
            .collect();

        let analysis = match self.analysis {
            Some(raw) => PlanAnalysis {
                description: clean(raw.description),
                functionalities: lines(&raw.functionalities),
                complexity: raw.complexity.as_deref().and_then(ComplexityTier::from_label),
            },
            None => PlanAnalysis::default(),
        };

        Ok(Plan {
            analysis,
            reasoning: lines(&self.reasoning),
            required_entities,
            available_entities,
            missing_entities,
            execution_flow: lines(&self.execution_flow),
            recommendations: lines(&self.recommendations),
            warnings: lines(&self.warnings),
            ready_to_generate: self.ready_to_generate.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"```json
{
  "analysis": {"description": "Forward form posts to Slack", "functionalities": ["receive", "notify"], "complexity": "simple"},
  "reasoning": {"step1_understand": "webhook then slack", "step3_nodes_needed": ["Webhook", "Slack"]},
  "requiredNodes": [
    {"name": "Webhook", "type": "n8n-nodes-base.webhook", "purpose": "entry", "exists": true, "verified": true},
    {"name": "Slack", "type": "n8n-nodes-base.slack", "purpose": "notify", "exists": true, "verified": false}
  ],
  "availableNodes": [{"name": "Webhook", "type": "n8n-nodes-base.webhook"}, {"name": "Slack", "type": "n8n-nodes-base.slack"}],
  "missingNodes": [],
  "executionFlow": ["Webhook receives", "Slack posts"],
  "readyToGenerate": true,
  "warnings": []
}
```"#;

    #[test]
    fn parses_fenced_plan() {
        let plan = Plan::parse(SAMPLE).unwrap();
        assert_eq!(plan.required_entities.len(), 2);
        assert_eq!(plan.allowed_types(), vec!["n8n-nodes-base.webhook", "n8n-nodes-base.slack"]);
        assert_eq!(plan.analysis.complexity, Some(ComplexityTier::Simple));
        assert_eq!(plan.reasoning[1], "step3_nodes_needed: Webhook, Slack");
        assert!(plan.ready_to_generate);
        assert!(!plan.is_hard_stop());
        assert_eq!(plan.complexity(), ComplexityTier::Simple);
        assert_eq!(plan.validation_warnings(), vec!["1 required entities not verified"]);
    }

    #[test]
    fn hard_stop_when_nothing_available() {
        let plan = Plan::parse(
            r#"{"requiredNodes": [{"name": "Veo", "type": "n8n-nodes-base.veo", "exists": false}], "availableNodes": []}"#,
        )
        .unwrap();
        assert!(plan.is_hard_stop());
        assert!(plan.allowed_types().is_empty());
    }

    #[test]
    fn unnamed_entities_take_type_name_or_fail() {
        let plan = Plan::parse(r#"{"requiredNodes": [{"type": "n8n-nodes-base.if", "exists": true}]}"#).unwrap();
        assert_eq!(plan.required_entities[0].name, "if");
        assert!(plan.has_branching());

        let err = Plan::parse(r#"{"requiredNodes": [{"purpose": "???"}]}"#).unwrap_err();
        assert_eq!(err.kind, crate::llm::LlmErrorKind::ParseError);
    }

    #[test]
    fn unknown_complexity_label_is_dropped() {
        let plan = Plan::parse(r#"{"analysis": {"complexity": "galaxy-brain"}}"#).unwrap();
        assert_eq!(plan.analysis.complexity, None);
        assert!(!plan.is_hard_stop());
    }

    #[test]
    fn non_json_output_is_a_parse_error() {
        let err = Plan::parse("I cannot help with that.").unwrap_err();
        assert_eq!(err.kind, crate::llm::LlmErrorKind::ParseError);
    }
}

//! Structural validation of candidate documents.
//!
//! The Orchestrator validates every approved candidate before returning it.
//! The validator is a collaborator behind [`StructuralValidator`];
//! [`BasicStructuralValidator`] covers the graph-level checks that need no
//! knowledge of individual entity parameters.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowDocument;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMetadata {
    pub node_count: usize,
    pub connection_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub metadata: ValidationMetadata,
}

impl ValidationReport {
    /// The first `n` errors, for a fix prompt.
    pub fn top_errors(&self, n: usize) -> Vec<String> {
        self.errors.iter().take(n).cloned().collect()
    }
}

#[async_trait]
pub trait StructuralValidator: Send + Sync {
    async fn validate(&self, doc: &WorkflowDocument) -> ValidationReport;
}

/// Graph checks: nodes present and uniquely named, types declared, every
/// connection endpoint exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStructuralValidator;

fn looks_like_trigger(entity_type: &str) -> bool {
    let lowered = entity_type.to_lowercase();
    lowered.contains("trigger") || lowered.ends_with(".webhook") || lowered.ends_with(".cron")
}

impl BasicStructuralValidator {
    pub fn check(&self, doc: &WorkflowDocument) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut suggestions = Vec::new();

        if doc.nodes.is_empty() {
            errors.push("Workflow has no nodes".to_string());
        }

        let mut names = HashSet::new();
        for (idx, node) in doc.nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                errors.push(format!("Node #{} has no name", idx + 1));
            } else if !names.insert(node.name.as_str()) {
                errors.push(format!("Duplicate node name '{}'", node.name));
            }
            if node.entity_type.trim().is_empty() {
                errors.push(format!("Node '{}' has no type", node.name));
            }
        }

        for (source, target) in doc.edges() {
            if !names.contains(source) {
                errors.push(format!("Connection from unknown node '{}'", source));
            }
            if !names.contains(target.node.as_str()) {
                errors.push(format!(
                    "Connection from '{}' targets unknown node '{}'",
                    source, target.node
                ));
            }
        }

        if !doc.nodes.is_empty() && !doc.nodes.iter().any(|n| looks_like_trigger(&n.entity_type)) {
            warnings.push("Workflow has no trigger node".to_string());
            suggestions.push("Start the workflow with a trigger or webhook node".to_string());
        }
        if doc.nodes.len() > 1 && doc.connection_count() == 0 {
            warnings.push("Workflow nodes are not connected".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            suggestions,
            metadata: ValidationMetadata {
                node_count: doc.nodes.len(),
                connection_count: doc.connection_count(),
            },
        }
    }
}

#[async_trait]
impl StructuralValidator for BasicStructuralValidator {
    async fn validate(&self, doc: &WorkflowDocument) -> ValidationReport {
        self.check(doc)
    }
}

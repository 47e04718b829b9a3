//! Candidate workflow documents.
//!
//! The model is deliberately loose about node parameters (free-form JSON)
//! and strict about the parts the pipeline reasons over: node names, declared
//! types, and the connection graph. Unrecognised root-level keys on a node
//! are preserved in `extra` so defects like a root `authentication` field
//! stay visible to the Supervisor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outgoing connections of one node: connection kind ("main", "ai_tool", ...)
/// to an ordered list of output slots, each listing its targets.
pub type NodeOutputs = BTreeMap<String, Vec<Vec<ConnectionTarget>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// Source node name to its outputs
    #[serde(default)]
    pub connections: BTreeMap<String, NodeOutputs>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    /// Declared entity type, e.g. `n8n-nodes-base.slack`
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_version: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    /// Any other root-level keys the model emitted
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub node: String,
    #[serde(rename = "type", default = "default_connection_kind")]
    pub kind: String,
    #[serde(default)]
    pub index: u32,
}

fn default_connection_kind() -> String {
    "main".to_string()
}

impl WorkflowNode {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            entity_type: entity_type.into(),
            type_version: None,
            position: None,
            parameters: Map::new(),
            notes: None,
            credentials: None,
            extra: Map::new(),
        }
    }

    /// A key the node carries at its root outside the known fields.
    pub fn root_field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// `parameters.options.continueOnFail`, if set.
    pub fn nested_continue_on_fail(&self) -> Option<&Value> {
        self.parameters
            .get("options")
            .and_then(Value::as_object)
            .and_then(|options| options.get("continueOnFail"))
    }
}

impl WorkflowDocument {
    pub fn new(name: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        Self {
            name: name.into(),
            nodes,
            connections: BTreeMap::new(),
            settings: Map::new(),
            extra: Map::new(),
        }
    }

    /// Add a `main` edge from `from` output 0 to `to`.
    pub fn connect(mut self, from: &str, to: &str) -> Self {
        let outputs = self
            .connections
            .entry(from.to_string())
            .or_default()
            .entry("main".to_string())
            .or_default();
        if outputs.is_empty() {
            outputs.push(Vec::new());
        }
        outputs[0].push(ConnectionTarget {
            node: to.to_string(),
            kind: default_connection_kind(),
            index: 0,
        });
        self
    }

    pub fn node(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Distinct declared entity types, in first-seen order.
    pub fn entity_types(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.nodes
            .iter()
            .map(|n| n.entity_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Every edge as `(source node, target)`.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &ConnectionTarget)> {
        self.connections.iter().flat_map(|(source, outputs)| {
            outputs
                .values()
                .flatten()
                .flatten()
                .map(move |target| (source.as_str(), target))
        })
    }

    pub fn connection_count(&self) -> usize {
        self.edges().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_typical_document_and_keeps_unknown_root_keys() {
        let raw = json!({
            "name": "Notify on form",
            "nodes": [
                {
                    "id": "a1",
                    "name": "Webhook",
                    "type": "n8n-nodes-base.webhook",
                    "typeVersion": 2,
                    "position": [250, 300],
                    "parameters": {"path": "form"}
                },
                {
                    "name": "Slack",
                    "type": "n8n-nodes-base.slack",
                    "typeVersion": 2.1,
                    "position": [450, 300],
                    "parameters": {},
                    "authentication": "oAuth2",
                    "continueOnFail": true
                }
            ],
            "connections": {
                "Webhook": {"main": [[{"node": "Slack", "type": "main", "index": 0}]]}
            },
            "settings": {"executionOrder": "v1"}
        });

        let doc: WorkflowDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[0].type_version, Some(2.0));
        assert_eq!(doc.nodes[1].id, None);
        assert_eq!(doc.nodes[1].root_field("authentication"), Some(&json!("oAuth2")));
        assert_eq!(doc.connection_count(), 1);
        assert_eq!(doc.entity_types(), vec!["n8n-nodes-base.webhook", "n8n-nodes-base.slack"]);

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["nodes"][1]["continueOnFail"], true);
        assert_eq!(back["nodes"][0]["typeVersion"], 2.0);
    }

    #[test]
    fn missing_connections_default_to_empty() {
        let doc: WorkflowDocument = serde_json::from_value(json!({
            "nodes": [{"name": "Manual", "type": "n8n-nodes-base.manualTrigger"}]
        }))
        .unwrap();
        assert!(doc.connections.is_empty());
        assert_eq!(doc.connection_count(), 0);
    }

    #[test]
    fn connect_builds_main_edges() {
        let doc = WorkflowDocument::new(
            "t",
            vec![
                WorkflowNode::new("A", "n8n-nodes-base.manualTrigger"),
                WorkflowNode::new("B", "n8n-nodes-base.set"),
                WorkflowNode::new("C", "n8n-nodes-base.code"),
            ],
        )
        .connect("A", "B")
        .connect("A", "C");
        let targets: Vec<_> = doc.edges().map(|(_, t)| t.node.as_str()).collect();
        assert_eq!(targets, vec!["B", "C"]);
    }

    #[test]
    fn nested_continue_on_fail_lookup() {
        let mut node = WorkflowNode::new("Mail", "n8n-nodes-base.gmail");
        assert!(node.nested_continue_on_fail().is_none());
        node.parameters
            .insert("options".to_string(), json!({"continueOnFail": true}));
        assert_eq!(node.nested_continue_on_fail(), Some(&json!(true)));
    }
}

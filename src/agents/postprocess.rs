//! Deterministic clean-up of generated candidates.
//!
//! Each transform takes a document by value and returns the transformed
//! document; nothing here holds or mutates shared state. [`postprocess`]
//! composes them in the order the Generator applies them.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::{WorkflowDocument, WorkflowNode};

/// Type substrings that call external services or run arbitrary code.
const CRITICAL_CATEGORIES: &[&str] = &[
    "gmail",
    "slack",
    "webhook",
    "httprequest",
    "postgres",
    "mysql",
    "mongodb",
    "googlesheets",
    "notion",
    "airtable",
    "stripe",
    "twilio",
    "sendgrid",
    "hubspot",
    "salesforce",
    "openai",
    "code",
    "function",
];

/// Correct camelCase local names for LangChain entity types.
const LANGCHAIN_TYPES: &[&str] = &[
    "chatTrigger",
    "manualChatTrigger",
    "agent",
    "chainLlm",
    "chainSummarization",
    "chainRetrievalQa",
    "informationExtractor",
    "textClassifier",
    "sentimentAnalysis",
    "openAi",
    "lmChatOpenAi",
    "lmChatAnthropic",
    "lmChatOllama",
    "lmChatGroq",
    "lmChatMistralCloud",
    "lmChatGoogleGemini",
    "lmOpenAi",
    "memoryBufferWindow",
    "memoryPostgresChat",
    "memoryMongoDbChat",
    "memoryRedisChat",
    "embeddingsOpenAi",
    "embeddingsCohere",
    "embeddingsGoogleGemini",
    "embeddingsMistralCloud",
    "vectorStoreQdrant",
    "vectorStoreInMemory",
    "vectorStoreMongoDBAtlas",
    "vectorStorePinecone",
    "vectorStorePGVector",
    "toolCalculator",
    "toolCode",
    "toolHttpRequest",
    "toolWorkflow",
    "toolVectorStore",
    "documentDefaultDataLoader",
    "documentJsonInputLoader",
    "textSplitterRecursiveCharacterTextSplitter",
    "textSplitterCharacterTextSplitter",
    "textSplitterTokenSplitter",
    "outputParserStructured",
    "outputParserAutofixing",
    "outputParserItemList",
];

const LANGCHAIN_PREFIX: &str = "@n8n/n8n-nodes-langchain.";

/// Apply every transform in order.
pub fn postprocess(doc: WorkflowDocument) -> WorkflowDocument {
    let doc = backfill_node_ids(doc);
    let doc = normalize_langchain_types(doc);
    let doc = apply_failure_tolerance(doc);
    annotate_nodes(doc)
}

fn map_nodes(mut doc: WorkflowDocument, f: impl Fn(WorkflowNode) -> WorkflowNode) -> WorkflowDocument {
    doc.nodes = doc.nodes.into_iter().map(f).collect();
    doc
}

/// Give every node without an id a fresh UUID.
pub fn backfill_node_ids(doc: WorkflowDocument) -> WorkflowDocument {
    map_nodes(doc, |mut node| {
        if node.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            node.id = Some(Uuid::new_v4().to_string());
        }
        node
    })
}

/// Fix the known misspellings of LangChain types: missing `@n8n/` scope or wrong case.
pub fn normalize_langchain_types(doc: WorkflowDocument) -> WorkflowDocument {
    map_nodes(doc, |mut node| {
        if let Some(fixed) = canonical_langchain_type(&node.entity_type) {
            if fixed != node.entity_type {
                tracing::debug!("Corrected LangChain type {} -> {}", node.entity_type, fixed);
                node.entity_type = fixed;
            }
        } else if node.entity_type.contains("langchain") && !node.entity_type.starts_with("@n8n/") {
            tracing::warn!("Non-standard LangChain type: {}", node.entity_type);
        }
        node
    })
}

fn canonical_langchain_type(entity_type: &str) -> Option<String> {
    let lowered = entity_type.trim().to_lowercase();
    let local = lowered
        .strip_prefix("@n8n/n8n-nodes-langchain.")
        .or_else(|| lowered.strip_prefix("n8n-nodes-langchain."))?;
    LANGCHAIN_TYPES
        .iter()
        .find(|known| known.to_lowercase() == local)
        .map(|known| format!("{}{}", LANGCHAIN_PREFIX, known))
}

pub fn is_critical_type(entity_type: &str) -> bool {
    let lowered = entity_type.to_lowercase();
    CRITICAL_CATEGORIES.iter().any(|c| lowered.contains(c))
}

/// Move any root-level `continueOnFail` under `parameters.options`, and
/// default it to `true` for critical entity types.
pub fn apply_failure_tolerance(doc: WorkflowDocument) -> WorkflowDocument {
    map_nodes(doc, |mut node| {
        let options_usable = node
            .parameters
            .get("options")
            .map_or(true, Value::is_object);
        if !options_usable {
            // The root flag stays put so supervision reports the misplacement.
            tracing::debug!(
                "Node '{}' has non-object parameters.options, leaving failure handling unchanged",
                node.name
            );
            return node;
        }

        let wanted = match node.extra.remove("continueOnFail") {
            Some(flag) => flag,
            None if is_critical_type(&node.entity_type) => Value::Bool(true),
            None => return node,
        };
        if let Some(options) = node
            .parameters
            .entry("options".to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            options.entry("continueOnFail".to_string()).or_insert(wanted);
        }
        node
    })
}

/// Human-readable note for a node, by category.
pub fn describe_node(node: &WorkflowNode) -> String {
    let ty = node.entity_type.to_lowercase();
    let local = ty.rsplit('.').next().unwrap_or(&ty);
    let has = |needles: &[&str]| needles.iter().any(|n| ty.contains(n));

    if has(&["trigger", "webhook"]) {
        "Entry point: starts the workflow automatically".to_string()
    } else if has(&["gmail", "email"]) {
        "Email operation: check the credentials".to_string()
    } else if has(&["slack", "discord", "telegram"]) {
        "Notification: configure the channel or chat".to_string()
    } else if has(&["code", "function"]) {
        "Custom code: check inputs and outputs".to_string()
    } else if has(&["http"]) {
        "API request: check the URL and headers".to_string()
    } else if has(&["database", "postgres", "mysql", "mongo"]) {
        "Database: check the credentials and query".to_string()
    } else if matches!(local, "if" | "switch") {
        "Conditional logic: define the conditions".to_string()
    } else if has(&["openai", "langchain"]) {
        "AI step: configure the model and prompt".to_string()
    } else {
        node.name.clone()
    }
}

/// Fill in `notes` where absent or blank.
pub fn annotate_nodes(doc: WorkflowDocument) -> WorkflowDocument {
    map_nodes(doc, |mut node| {
        if node.notes.as_deref().map_or(true, |n| n.trim().is_empty()) {
            node.notes = Some(describe_node(&node));
        }
        node
    })
}

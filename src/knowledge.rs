//! Knowledge retrieval: ranked documents describing the entities the target
//! platform offers.
//!
//! The retriever itself is a collaborator behind [`KnowledgeRetriever`]. This
//! module also owns the heuristics that turn retrieved documents into a list
//! of documented entity types; those sit behind [`EntityTypeExtractor`] so
//! they can be swapped without touching the agents.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::complexity::{is_branching_type, ComplexityTier};

/// Failure to load a document catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Cannot read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog is not a JSON array of documents: {0}")]
    Format(#[from] serde_json::Error),
}

/// One retrieved document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Exact declared type when the document describes a single entity
    #[serde(default, alias = "nodeType", skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Entity types used by an example workflow document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<String>,
    #[serde(default)]
    pub score: f32,
}

/// Everything the retriever knows about a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub documents: Vec<KnowledgeDocument>,
    /// Entity names the retriever matched directly in the request
    pub detected_entities: Vec<String>,
    pub suggested_flow: Vec<String>,
    pub complexity_hint: Option<ComplexityTier>,
    /// Nothing useful was found; collections are empty
    pub fallback: bool,
}

impl RetrievedContext {
    /// The degraded result returned when retrieval finds nothing or fails.
    pub fn fallback() -> Self {
        Self {
            fallback: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalOptions {
    pub max_documents: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self { max_documents: 30 }
    }
}

/// Source of ranked context documents.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Retrieve context for `text`.
    ///
    /// Never fails: "nothing found" and backend trouble alike degrade to
    /// [`RetrievedContext::fallback`].
    async fn get_context(&self, text: &str, options: &RetrievalOptions) -> RetrievedContext;
}

/// A documented entity: display name and exact declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentedEntity {
    pub name: String,
    pub entity_type: String,
}

/// Strategy for pulling exact entity type strings out of free text.
pub trait EntityTypeExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;

    /// Whether a declared type string looks like a real entity type.
    fn is_entity_type(&self, candidate: &str) -> bool;
}

/// Matches `n8n-nodes-base.*` and `@n8n/n8n-nodes-langchain.*` type strings.
#[derive(Debug, Clone)]
pub struct PatternTypeExtractor {
    pattern: Regex,
}

const ENTITY_TYPE_PATTERN: &str = r"(?:@n8n/)?n8n-nodes-(?:base|langchain)\.[A-Za-z0-9_]+";

impl PatternTypeExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_pattern(ENTITY_TYPE_PATTERN)
    }

    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl EntityTypeExtractor for PatternTypeExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        self.pattern
            .find_iter(text)
            .map(|m| canonical_type(m.as_str()))
            .collect()
    }

    fn is_entity_type(&self, candidate: &str) -> bool {
        candidate.starts_with("n8n-nodes-base.") || candidate.starts_with("@n8n/")
    }
}

/// LangChain types are only valid with the `@n8n/` scope.
fn canonical_type(raw: &str) -> String {
    if raw.starts_with("n8n-nodes-langchain.") {
        format!("@n8n/{}", raw)
    } else {
        raw.to_string()
    }
}

/// The part of a type after the last `.`, e.g. `slack` for `n8n-nodes-base.slack`.
pub fn local_type_name(entity_type: &str) -> &str {
    entity_type.rsplit('.').next().unwrap_or(entity_type)
}

/// Derive the documented entities from the first `limit` documents.
///
/// Sources, in order: the document's declared type, type strings found in
/// its content and url, and the integrations of example workflows.
/// Deduplicated by type.
pub fn documented_entities(
    documents: &[KnowledgeDocument],
    extractor: &dyn EntityTypeExtractor,
    limit: usize,
) -> Vec<DocumentedEntity> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |name: &str, entity_type: String| {
        if seen.insert(entity_type.clone()) {
            let name = if name.trim().is_empty() {
                local_type_name(&entity_type).to_string()
            } else {
                name.trim().to_string()
            };
            out.push(DocumentedEntity { name, entity_type });
        }
    };

    for doc in documents.iter().take(limit) {
        if let Some(ref declared) = doc.entity_type {
            if extractor.is_entity_type(declared) {
                push(&doc.title, declared.clone());
            }
        }
        for found in extractor.extract(&doc.content) {
            push(&doc.title, found);
        }
        if let Some(ref url) = doc.url {
            for found in extractor.extract(url) {
                push(&doc.title, found);
            }
        }
        for integration in &doc.integrations {
            if extractor.is_entity_type(integration) {
                push(local_type_name(integration), integration.clone());
            }
        }
    }
    out
}

/// Retriever over a static JSON catalog of documents, ranked by keyword overlap.
///
/// Used by the CLI when no external retrieval service is wired in.
#[derive(Debug, Clone, Default)]
pub struct CatalogRetriever {
    documents: Vec<KnowledgeDocument>,
}

impl CatalogRetriever {
    pub fn new(documents: Vec<KnowledgeDocument>) -> Self {
        Self { documents }
    }

    /// Load a catalog file: a JSON array of documents.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let documents: Vec<KnowledgeDocument> = serde_json::from_str(&raw)?;
        tracing::info!("Loaded {} catalog documents from {}", documents.len(), path.display());
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl KnowledgeRetriever for CatalogRetriever {
    async fn get_context(&self, text: &str, options: &RetrievalOptions) -> RetrievedContext {
        let query: HashSet<String> = keywords(text).into_iter().collect();
        if query.is_empty() || self.documents.is_empty() {
            return RetrievedContext::fallback();
        }
        let lowered_request = text.to_lowercase();

        let mut ranked: Vec<KnowledgeDocument> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let haystack = format!(
                    "{} {} {}",
                    doc.title,
                    doc.entity_type.as_deref().unwrap_or_default(),
                    doc.content
                );
                let words: HashSet<String> = keywords(&haystack).into_iter().collect();
                let hits = query.intersection(&words).count();
                (hits > 0).then(|| KnowledgeDocument {
                    score: hits as f32 / query.len() as f32,
                    ..doc.clone()
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(options.max_documents);

        if ranked.is_empty() {
            return RetrievedContext::fallback();
        }

        // Entities whose name appears verbatim in the request, in mention order.
        let mut mentioned: Vec<(usize, String)> = ranked
            .iter()
            .filter(|doc| !doc.title.trim().is_empty())
            .filter_map(|doc| {
                lowered_request
                    .find(&doc.title.to_lowercase())
                    .map(|pos| (pos, doc.title.clone()))
            })
            .collect();
        mentioned.sort();
        let detected = crate::util::dedup_trimmed(mentioned.into_iter().map(|(_, name)| name));

        let branching = ranked
            .iter()
            .filter_map(|d| d.entity_type.as_deref())
            .any(is_branching_type)
            || ["if ", "otherwise", "else", "depending"]
                .iter()
                .any(|kw| lowered_request.contains(kw));

        RetrievedContext {
            complexity_hint: Some(ComplexityTier::classify(detected.len(), 0, branching)),
            suggested_flow: detected.clone(),
            detected_entities: detected,
            documents: ranked,
            fallback: false,
        }
    }
}

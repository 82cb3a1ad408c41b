//! Knowledge-graph lane: extracts candidate entities from the query, then
//! fetches matching entities plus their direct relationships from an
//! ArangoDB store through one AQL cursor call.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use prism_config::schema::RetrievalConfig;
use prism_core::{Lane, LaneRequest, LaneResult, Source};

use crate::lane::RetrievalLane;

/// Max entities fetched per query.
const MAX_ENTITIES: usize = 4;
/// Max direct relationships fetched per query.
const MAX_RELATIONSHIPS: usize = 2;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "when", "where", "which", "who", "how", "why", "does",
    "did", "was", "are", "is", "between", "about", "from", "into", "their", "this", "that",
];

pub struct KgLane {
    client: reqwest::Client,
    base_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    database: String,
}

impl KgLane {
    pub fn from_config(cfg: &RetrievalConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg
                .arangodb_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            username: cfg.arangodb_username.clone(),
            password: cfg.arangodb_password.clone(),
            database: cfg.arangodb_database.clone(),
        }
    }

    async fn fetch_graph(&self, request: &LaneRequest) -> Result<Vec<Source>, String> {
        let base = self.base_url.as_ref().ok_or("no arangodb url")?;
        let entities = extract_entities(&request.query_text);
        if entities.is_empty() {
            return Ok(vec![]);
        }

        // One cursor call: entities first, then their direct relationships.
        let aql = r#"
            LET ents = (
                FOR e IN entities
                    FILTER LOWER(e.name) IN @names
                    LIMIT @max_entities
                    RETURN { kind: "entity", name: e.name, description: e.description, ref: e._id }
            )
            LET rels = (
                FOR e IN entities
                    FILTER LOWER(e.name) IN @names
                    FOR v, r IN 1..1 ANY e relations
                        LIMIT @max_relationships
                        RETURN { kind: "relation", name: CONCAT(e.name, " - ", r.label, " - ", v.name), description: r.description, ref: r._id }
            )
            FOR doc IN APPEND(ents, rels) RETURN doc
        "#;

        let mut builder = self
            .client
            .post(format!("{base}/_db/{}/_api/cursor", self.database))
            .json(&serde_json::json!({
                "query": aql,
                "bindVars": {
                    "names": entities,
                    "max_entities": MAX_ENTITIES,
                    "max_relationships": MAX_RELATIONSHIPS,
                },
            }))
            .timeout(Duration::from_millis(request.deadline_ms));
        if let Some(ref user) = self.username {
            builder = builder.basic_auth(user, self.password.as_deref());
        }

        let resp = builder.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;

        let docs = data["result"].as_array().cloned().unwrap_or_default();
        Ok(docs
            .iter()
            .take(request.top_k)
            .enumerate()
            .map(|(i, doc)| {
                let name = doc["name"].as_str().unwrap_or("unknown").to_string();
                let mut source = Source::new(format!("kg-{i}"), name, Lane::Kg);
                source.snippet = doc["description"]
                    .as_str()
                    .unwrap_or_default()
                    .chars()
                    .take(1024)
                    .collect();
                // Entities outrank relationships; both decay by position.
                let base_score = if doc["kind"] == "entity" { 1.0 } else { 0.7 };
                source.score = base_score / (1.0 + i as f64 * 0.2);
                if let Some(entity_ref) = doc["ref"].as_str() {
                    source
                        .metadata
                        .insert("entity_ref".into(), entity_ref.to_string());
                }
                source
            })
            .collect())
    }
}

/// Pull candidate entity names out of the query: capitalized tokens and
/// quoted phrases, minus stopwords. Cheap and local; the graph store does
/// the actual matching.
pub fn extract_entities(query: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();

    // Quoted phrases first.
    let mut rest = query;
    while let Some(start) = rest.find('"') {
        let Some(len) = rest[start + 1..].find('"') else {
            break;
        };
        let phrase = &rest[start + 1..start + 1 + len];
        if !phrase.trim().is_empty() {
            entities.push(phrase.trim().to_lowercase());
        }
        rest = &rest[start + 1 + len + 1..];
    }

    for token in query.split_whitespace() {
        let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() < 3 {
            continue;
        }
        let lower = cleaned.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        if cleaned.chars().next().is_some_and(|c| c.is_uppercase()) && !entities.contains(&lower) {
            entities.push(lower);
        }
    }

    // Nothing capitalized: fall back to the longest content words.
    if entities.is_empty() {
        let mut words: Vec<String> = query
            .split_whitespace()
            .map(|t| {
                t.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| w.len() >= 4 && !STOPWORDS.contains(&w.as_str()))
            .collect();
        words.sort_by_key(|w| std::cmp::Reverse(w.len()));
        words.dedup();
        entities.extend(words.into_iter().take(2));
    }

    entities.truncate(MAX_ENTITIES);
    entities
}

#[async_trait]
impl RetrievalLane for KgLane {
    fn lane(&self) -> Lane {
        Lane::Kg
    }

    async fn search(&self, request: &LaneRequest) -> LaneResult {
        let started = Instant::now();
        debug!(trace_id = %request.trace_id, "kg lane start");

        let outcome = self.fetch_graph(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(items) => LaneResult::ok(Lane::Kg, items, latency_ms),
            Err(reason) => {
                debug!(trace_id = %request.trace_id, reason = %reason, "kg lane error");
                LaneResult::error(Lane::Kg, latency_ms, "lane_error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::TraceId;

    #[test]
    fn test_extracts_capitalized_tokens() {
        let entities = extract_entities("How did Marie Curie discover Radium");
        assert!(entities.contains(&"marie".to_string()));
        assert!(entities.contains(&"curie".to_string()));
        assert!(entities.contains(&"radium".to_string()));
        assert!(!entities.contains(&"how".to_string()));
    }

    #[test]
    fn test_extracts_quoted_phrases() {
        let entities = extract_entities(r#"papers about "general relativity""#);
        assert_eq!(entities[0], "general relativity");
    }

    #[test]
    fn test_lowercase_query_falls_back_to_content_words() {
        let entities = extract_entities("what is photosynthesis");
        assert!(entities.contains(&"photosynthesis".to_string()));
    }

    #[test]
    fn test_entity_cap() {
        let entities = extract_entities("Alpha Beta Gamma Delta Epsilon Zeta");
        assert!(entities.len() <= MAX_ENTITIES);
    }

    #[tokio::test]
    async fn test_missing_store_is_lane_error() {
        let cfg = RetrievalConfig {
            arangodb_url: None,
            ..Default::default()
        };
        let lane = KgLane::from_config(&cfg);
        let result = lane
            .search(&LaneRequest {
                query_text: "Einstein".into(),
                top_k: 6,
                deadline_ms: 100,
                trace_id: TraceId::new(),
            })
            .await;
        assert_eq!(result.status, prism_core::LaneStatus::Error);
    }
}

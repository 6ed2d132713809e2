use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::SearchError;
use crate::metrics::EFFECT_SEARCHES;

// Hits shown per /fx reply
pub const MAX_EFFECTS: usize = 8;

// One user-reported effect from the search index
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EffectHit {
    pub effect: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[async_trait]
pub trait EffectSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EffectHit>, SearchError>;
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<EffectHit>,
}

// Algolia index queried over its REST search endpoint
pub struct AlgoliaSearch {
    client: reqwest::Client,
    query_url: String,
    app_id: String,
    api_key: String,
}

impl AlgoliaSearch {
    pub fn new(client: reqwest::Client, app_id: &str, api_key: String, index: &str) -> Self {
        let host = format!("https://{}-dsn.algolia.net", app_id.to_ascii_lowercase());
        Self::with_host(client, &host, app_id, api_key, index)
    }

    pub fn with_host(
        client: reqwest::Client,
        host: &str,
        app_id: &str,
        api_key: String,
        index: &str,
    ) -> Self {
        Self {
            client,
            query_url: format!("{}/1/indexes/{}/query", host.trim_end_matches('/'), index),
            app_id: app_id.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl EffectSearch for AlgoliaSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EffectHit>, SearchError> {
        EFFECT_SEARCHES.inc();
        debug!(query, "Searching effects");

        let response = self
            .client
            .post(&self.query_url)
            .header("X-Algolia-Application-Id", &self.app_id)
            .header("X-Algolia-API-Key", &self.api_key)
            .json(&json!({ "query": query, "hitsPerPage": limit }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut hits = response.json::<SearchResponse>().await?.hits;
        hits.truncate(limit);
        Ok(hits)
    }
}

// "Name - User-Reported Effects" followed by one bullet per hit
pub fn format_effects(substance: &str, hits: &[EffectHit]) -> String {
    let bullets = hits
        .iter()
        .take(MAX_EFFECTS)
        .map(|hit| match hit.detail.as_deref().map(str::trim) {
            Some(detail) if !detail.is_empty() => format!("* {} : {}", hit.effect, detail),
            _ => format!("* {}", hit.effect),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{} - User-Reported Effects\n\n{}", capitalize(substance), bullets)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

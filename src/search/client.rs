use crate::error::{HarnessError, Result};
use crate::search::registration::{IndexRegistration, SearchResultRecord};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const HEALTH_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct Health {
    status: String,
    #[serde(default)]
    timed_out: bool,
}

/// HTTP boundary to a running search engine node.
#[derive(Debug, Clone)]
pub struct SearchEngineClient {
    base: String,
    http: Client,
}

fn query_string(query: &str) -> Value {
    json!({ "query_string": { "query": query } })
}

impl SearchEngineClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /*
        @@@
        @wait_for_health();
        . Polls `_cluster/health?wait_for_status=<status>` until the node reports it or `limit` runs out.
        . Connection errors while the HTTP layer warms up are retried.
    */
    pub async fn wait_for_health(&self, status: &str, limit: Duration) -> Result<()> {
        let started = Instant::now();
        let mut last_problem = String::new();
        while started.elapsed() < limit {
            let url = format!("{}/_cluster/health", self.base);
            let response = self
                .http
                .get(&url)
                .query(&[("wait_for_status", status), ("timeout", "5s")])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => match resp.json::<Health>().await {
                    Ok(health) if !health.timed_out && health.status != "red" => {
                        info!(status = %health.status, "Search engine cluster is healthy");
                        return Ok(());
                    }
                    Ok(health) => last_problem = format!("cluster status {}", health.status),
                    Err(e) => last_problem = e.to_string(),
                },
                Ok(resp) => last_problem = format!("HTTP {}", resp.status()),
                Err(e) => last_problem = e.to_string(),
            }
            debug!(problem = %last_problem, "Search engine not healthy yet");
            sleep(HEALTH_POLL).await;
        }
        Err(HarnessError::ReadinessTimeout {
            process: "search-engine".into(),
            token: format!("cluster health {status}"),
            waited: limit,
            detail: if last_problem.is_empty() { String::new() } else { format!(": {last_problem}") },
        })
    }

    /*
        @@@
        @register();
        . Drops any connector already registered for the collection (a 404 just means there was none).
        . Stores the new meta document and requires the engine to acknowledge it.
    */
    pub async fn register(&self, registration: &IndexRegistration) -> Result<()> {
        let collection = &registration.source_collection;
        let failed = |reason: String| HarnessError::IndexRegistration {
            collection: collection.clone(),
            reason,
        };
        let document = registration.to_json()?;

        let river = format!("{}/_river/{}", self.base, collection);
        let resp = self
            .http
            .delete(&river)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => info!(collection = %collection, "Dropped previous connector"),
            StatusCode::NOT_FOUND => {}
            s => {
                let body = resp.text().await.unwrap_or_default();
                return Err(failed(format!("removing previous connector returned {s}: {body}")));
            }
        }

        let resp = self
            .http
            .put(format!("{river}/_meta"))
            .json(&document)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(failed(format!("engine answered {status}: {body}")));
        }
        info!(collection = %collection, index = %registration.target_index_name, "Registered connector");
        Ok(())
    }

    pub async fn count(&self, index: &str, collection: &str, query: &str) -> Result<u64> {
        let url = format!("{}/{}/{}/_count", self.base, index, collection);
        let body = json!({ "query": query_string(query) });
        let parsed: CountResponse = self.post_json(collection, &url, &body).await?;
        Ok(parsed.count)
    }

    /// Ranked hits, best first; equal scores keep the engine's order.
    pub async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &str,
        size: u64,
    ) -> Result<Vec<SearchResultRecord>> {
        let url = format!("{}/{}/{}/_search", self.base, index, collection);
        let body = json!({ "query": query_string(query), "size": size });
        let parsed: SearchResponse = self.post_json(collection, &url, &body).await?;

        let mut records: Vec<SearchResultRecord> = parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchResultRecord {
                document_id: hit.id,
                relevance_score: hit.score.unwrap_or(0.0),
                source_fields: hit.source.unwrap_or_default(),
            })
            .collect();
        records.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        Ok(records)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        url: &str,
        body: &Value,
    ) -> Result<T> {
        let failed = |reason: String| HarnessError::Search {
            collection: collection.to_string(),
            reason,
        };
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "Search engine rejected query");
            return Err(failed(format!("engine answered {status}: {text}")));
        }
        resp.json::<T>().await.map_err(|e| failed(e.to_string()))
    }
}

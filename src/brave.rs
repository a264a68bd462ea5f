use crate::error::SearchError;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_COUNT: u32 = 10;

/// Which Brave vertical to query; doubles as the route segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Web,
    Images,
    News,
    Videos,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::Web => "web",
            SearchKind::Images => "images",
            SearchKind::News => "news",
            SearchKind::Videos => "videos",
        }
    }

    /// Noun used in error messages shown to API consumers.
    pub fn describe(&self) -> &'static str {
        match self {
            SearchKind::Web => "search",
            SearchKind::Images => "image",
            SearchKind::News => "news",
            SearchKind::Videos => "video",
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub q: String,
    pub count: u32,
    pub offset: u32,
}

impl SearchParams {
    pub fn new(q: impl Into<String>, count: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            q: q.into(),
            count: count.unwrap_or(DEFAULT_COUNT),
            offset: offset.unwrap_or(0),
        }
    }

    /// Key under which identical requests are coalesced.
    pub fn coalesce_key(&self, kind: SearchKind) -> String {
        format!("{}:{}:{}:{}", kind, self.q, self.count, self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct BraveClient {
    http_client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    outbound_limit: Arc<Semaphore>,
}

impl BraveClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        api_key: Option<String>,
        outbound_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            http_client,
            base_url,
            api_key,
            outbound_limit,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn endpoint(&self, kind: SearchKind) -> String {
        format!(
            "{}/{}/search",
            self.base_url.as_str().trim_end_matches('/'),
            kind
        )
    }

    /// Runs one search against the Brave API and returns the body untouched.
    pub async fn search(
        &self,
        kind: SearchKind,
        params: &SearchParams,
    ) -> Result<Arc<serde_json::Value>, SearchError> {
        let api_key = self.api_key.as_deref().ok_or(SearchError::MissingApiKey)?;
        info!("Searching {} for: {}", kind, params.q);

        let _permit = self
            .outbound_limit
            .acquire()
            .await
            .map_err(|e| SearchError::Request(e.to_string()))?;

        let search_url = self.endpoint(kind);
        debug!("Search URL: {}", search_url);
        let query = [
            ("q", params.q.clone()),
            ("count", params.count.to_string()),
            ("offset", params.offset.to_string()),
        ];

        // 5xx, 429 and transport errors are retried, other statuses are final
        let body: serde_json::Value = retry(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(200))
                .with_max_interval(Duration::from_secs(2))
                .with_max_elapsed_time(Some(Duration::from_secs(4)))
                .build(),
            || async {
                let result = self.send_once(&search_url, &query, api_key).await;
                match result {
                    Ok(body) => Ok(body),
                    Err(e) if e.is_transient() => {
                        warn!("Brave {} search attempt failed: {}", kind, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            },
        )
        .await?;

        info!("Brave {} search for '{}' succeeded", kind, params.q);
        Ok(Arc::new(body))
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(&str, String)],
        api_key: &str,
    ) -> Result<serde_json::Value, SearchError> {
        let resp = self
            .http_client
            .get(url)
            .query(query)
            .header("Accept", "application/json")
            .header("Accept-Encoding", "gzip")
            .header("X-Subscription-Token", api_key)
            .send()
            .await
            .map_err(|e| SearchError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))
    }
}

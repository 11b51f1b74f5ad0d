use super::{SearchError, SearchShard};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

/// A shard served over HTTP: `GET <base_url>?keyword=<kw>` answering a JSON array
/// of hits, or an object with the hits under `documents`.
pub struct HttpShard {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ShardResponse {
    Hits(Vec<Value>),
    Wrapped { documents: Vec<Value> },
}

impl HttpShard {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        let name = reqwest::Url::parse(base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| base_url.to_owned());
        Self {
            name,
            base_url: base_url.to_owned(),
            http,
        }
    }

    fn fail(&self, e: impl Into<anyhow::Error>) -> SearchError {
        SearchError::Shard {
            shard: self.name.clone(),
            source: e.into(),
        }
    }
}

#[async_trait]
impl SearchShard for HttpShard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, keyword: &str) -> Result<Vec<Value>, SearchError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("keyword", keyword)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.fail(e))?;

        let hits = match response.json::<ShardResponse>().await.map_err(|e| self.fail(e))? {
            ShardResponse::Hits(hits) | ShardResponse::Wrapped { documents: hits } => hits,
        };
        trace!(shard = self.name.as_str(), hits = hits.len(), "shard answered");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_shard_after_host() {
        let shard = HttpShard::new("http://search-1.internal:9200/hot/_search", Duration::from_secs(1))
            .unwrap();
        assert_eq!(shard.name(), "search-1.internal");
    }

    #[test]
    fn accepts_bare_and_wrapped_responses() {
        let bare: ShardResponse = serde_json::from_str(r#"[{"a":1}]"#).unwrap();
        let wrapped: ShardResponse = serde_json::from_str(r#"{"documents":[{"a":1},{"b":2}]}"#).unwrap();
        assert!(matches!(bare, ShardResponse::Hits(h) if h.len() == 1));
        assert!(matches!(wrapped, ShardResponse::Wrapped { documents } if documents.len() == 2));
    }

    #[tokio::test]
    async fn unreachable_shard_is_a_shard_error() {
        let shard = HttpShard::new("http://127.0.0.1:1/search", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            shard.query("storm").await,
            Err(SearchError::Shard { .. })
        ));
    }
}

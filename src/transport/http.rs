use super::ResourceFetcher;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::Proxy;
use std::env;
use std::time::Duration;

/// GETs `<base_url><endpoint>` and decodes the body as JSON.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base url: {}", e),
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_details(base_url.to_string())
                    .with_source("http_fetcher"),
            )
        })?;

        // Minimal production-friendly defaults (env-overridable).
        // The coordinator applies the per-resource timeout; this is a backstop.
        let timeout_secs = env::var("POLL_SYNC_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("POLL_SYNC_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(8),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .user_agent(concat!("poll-sync/", env!("CARGO_PKG_VERSION")));

        if let Ok(proxy_url) = env::var("POLL_SYNC_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder.build().map_err(|e| {
            Error::transport_with_context(e.to_string(), ErrorContext::new().with_source("http_fetcher"))
        })?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            token: env::var("POLL_SYNC_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value> {
        let url = self.url_for(endpoint);
        let mut request = self.client.get(&url).header("accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            Error::transport_with_context(
                e.to_string(),
                ErrorContext::new()
                    .with_source("http_fetcher")
                    .with_endpoint(endpoint),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport {
                message: format!("HTTP {}", status.as_u16()),
                status: Some(status.as_u16()),
                context: ErrorContext::new()
                    .with_source("http_fetcher")
                    .with_endpoint(endpoint)
                    .with_details(body.chars().take(200).collect::<String>()),
            });
        }

        response.json::<serde_json::Value>().await.map_err(|e| {
            Error::transport_with_context(
                format!("invalid JSON body: {}", e),
                ErrorContext::new()
                    .with_source("http_fetcher")
                    .with_endpoint(endpoint),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = HttpFetcher::new("not a url").err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_url_join() {
        let f = HttpFetcher::new("http://localhost:8080/").unwrap();
        assert_eq!(f.url_for("/api/sessions"), "http://localhost:8080/api/sessions");
        assert_eq!(f.url_for("api/boards"), "http://localhost:8080/api/boards");
    }
}

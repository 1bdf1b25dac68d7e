use super::{ProduceRequest, Sink};
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Base endpoint in the form `<scheme>://<host>:<port>`.
    pub endpoint: String,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl HttpSinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 2_000,
            pool_idle_timeout: Duration::from_secs(60),
        }
    }

    /// Plain-text endpoint for a bare `host:port` address.
    pub fn without_tls(address: &str) -> Self {
        Self::new(format!("http://{}", address))
    }

    /// TLS endpoint for a bare `host:port` address, using the bundled root store.
    pub fn with_tls(address: &str) -> Self {
        Self::new(format!("https://{}", address))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pool_max_idle_per_host(mut self, n: usize) -> Self {
        self.pool_max_idle_per_host = n;
        self
    }

    /// Apply `COALESCE_HTTP_*` overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env::var("COALESCE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env::var("COALESCE_HTTP_POOL_MAX_IDLE_PER_HOST")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.pool_max_idle_per_host = n;
        }
        if let Some(secs) = env::var("COALESCE_HTTP_POOL_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.pool_idle_timeout = Duration::from_secs(secs);
        }
        self
    }
}

/// Sink that POSTs each batch as JSON to `<endpoint>/produce`.
pub struct HttpSink {
    client: reqwest::Client,
    produce_url: Url,
    config: HttpSinkConfig,
}

impl HttpSink {
    /// Build the sink. `COALESCE_HTTP_*` environment variables take
    /// precedence over the values in `config`.
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        let config = config.with_env_overrides();
        if config.endpoint.is_empty() {
            return Err(Error::configuration_with_context(
                "endpoint is empty; must provide an http endpoint",
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_source("http_sink"),
            ));
        }

        let raw = format!("{}/produce", config.endpoint.trim_end_matches('/'));
        let produce_url = Url::parse(&raw).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid endpoint '{}'", config.endpoint),
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_details(e.to_string())
                    .with_source("http_sink"),
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        tracing::debug!(
            url = %produce_url,
            timeout_secs = config.timeout.as_secs(),
            pool_max_idle_per_host = config.pool_max_idle_per_host,
            "http sink ready"
        );

        Ok(Self {
            client,
            produce_url,
            config,
        })
    }

    pub fn produce_url(&self) -> &Url {
        &self.produce_url
    }

    /// Effective settings after environment overrides.
    pub fn config(&self) -> &HttpSinkConfig {
        &self.config
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn produce_items(&self, ctx: &CallContext, batch: &ProduceRequest) -> Result<()> {
        let body = serde_json::to_vec(batch).map_err(|e| {
            Error::sink_with_context(
                "failed to encode batch",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("http_sink"),
            )
        })?;
        let mut req = self
            .client
            .post(self.produce_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(remaining) = ctx.remaining() {
            req = req.timeout(remaining);
        }

        let resp = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            resp = req.send() => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "produce rejected by remote");
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

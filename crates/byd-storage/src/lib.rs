//! HTTP fetch utilities and table sinks for the loader.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod postgres;
pub mod sink;

pub use postgres::{PgConnectOptions, PgTableSink};
pub use sink::{DeletePredicate, MemoryTable, MemoryTableSink, SinkError, TableSink, WriteMode, WriteOutcome};

pub const CRATE_NAME: &str = "byd-storage";

/// Page payloads can be tens of megabytes; the source answers slowly.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub credentials: Option<BasicCredentials>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: None,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot HTTP GET client. Every failure is returned to the caller; nothing
/// is retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    credentials: Option<BasicCredentials>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            credentials: config.credentials,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        dataset_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, dataset_id, url);
        async move {
            let mut request = self.client.get(url).query(query);
            if let Some(credentials) = &self.credentials {
                request = request.basic_auth(&credentials.user, Some(&credentials.password));
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

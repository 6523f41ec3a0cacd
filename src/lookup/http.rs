//! HTTP-backed `TradeLookupClient`: a bounded attempt loop with linear
//! backoff between attempts, `warn!` on each retryable failure, and
//! status-class branching on the response (4xx fails fast, 5xx retries).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::lookup::TradeLookupClient;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ExecutionsResponse {
    #[serde(default)]
    executions: Vec<ExecutionEntry>,
}

#[derive(Debug, Deserialize)]
struct ExecutionEntry {
    portfolio: Option<PortfolioRef>,
}

#[derive(Debug, Deserialize)]
struct PortfolioRef {
    #[serde(default)]
    id: String,
}

pub struct HttpTradeLookupClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpTradeLookupClient {
    pub fn new(base_url: String, retry: RetryConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            retry,
        })
    }
}

#[async_trait::async_trait]
impl TradeLookupClient for HttpTradeLookupClient {
    async fn resolve_portfolio(
        &self,
        external_execution_id: i64,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let url = format!("{}/executions", self.base_url);
        let mut last_err = String::from("no attempts made");

        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let request = self
                .client
                .get(&url)
                .query(&[("executionServiceId", external_execution_id)]);

            let outcome = timeout(REQUEST_TIMEOUT, request.send()).await;

            match outcome {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: ExecutionsResponse = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::Decode(e.to_string()))?;
                        return extract_portfolio_id(body);
                    } else if status.is_client_error() {
                        let text = response.text().await.unwrap_or_default();
                        warn!(%status, %text, external_execution_id, "trade lookup returned client error, not retrying");
                        return Err(PipelineError::PermanentRemote(format!(
                            "{status}: {text}"
                        )));
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        warn!(%status, attempt, external_execution_id, "trade lookup server error, will retry");
                        last_err = format!("{status}: {text}");
                    }
                }
                Ok(Err(e)) => {
                    warn!(attempt, external_execution_id, error = %e, "trade lookup request failed, will retry");
                    last_err = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, external_execution_id, "trade lookup request timed out, will retry");
                    last_err = "request timed out".to_string();
                }
            }

            if attempt < self.retry.max_attempts {
                let delay = self.retry.base_delay * attempt;
                debug!(?delay, attempt, "backing off before next lookup attempt");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                }
            }
        }

        Err(PipelineError::Transient(format!(
            "trade lookup retries exhausted: {last_err}"
        )))
    }
}

fn extract_portfolio_id(body: ExecutionsResponse) -> PipelineResult<String> {
    let first = body
        .executions
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::NotResolvable("no executions in response".into()))?;
    let id = first
        .portfolio
        .map(|p| p.id)
        .unwrap_or_default();
    if id.is_empty() {
        return Err(PipelineError::NotResolvable("empty portfolio id".into()));
    }
    Ok(id)
}

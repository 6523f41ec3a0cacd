//! Component B: the trade lookup client. Resolves an upstream execution id
//! to a portfolio id via the Trade Service, with bounded retry/backoff and
//! an overall timeout.

pub mod http;
pub mod stub;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineResult;

#[async_trait]
pub trait TradeLookupClient: Send + Sync {
    /// Resolves `external_execution_id` to a portfolio id. `cancel` is
    /// observed promptly during any backoff wait.
    async fn resolve_portfolio(
        &self,
        external_execution_id: i64,
        cancel: &CancellationToken,
    ) -> PipelineResult<String>;
}

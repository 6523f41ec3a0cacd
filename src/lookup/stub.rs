//! Test-only `TradeLookupClient`, scripted with canned responses so the
//! ingestion engine's own unit tests don't need a live Trade Service.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::{PipelineError, PipelineResult};
use crate::lookup::TradeLookupClient;

#[derive(Clone)]
pub enum StubOutcome {
    Portfolio(String),
    PermanentRemote(String),
    NotResolvable(String),
    Transient(String),
}

pub struct StubTradeLookupClient {
    responses: Mutex<HashMap<i64, StubOutcome>>,
    default_outcome: Option<StubOutcome>,
}

impl StubTradeLookupClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_outcome: None,
        }
    }

    pub fn with_default(outcome: StubOutcome) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_outcome: Some(outcome),
        }
    }

    pub fn set(&self, external_execution_id: i64, outcome: StubOutcome) {
        self.responses.lock().insert(external_execution_id, outcome);
    }
}

impl Default for StubTradeLookupClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeLookupClient for StubTradeLookupClient {
    async fn resolve_portfolio(
        &self,
        external_execution_id: i64,
        _cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let outcome = self
            .responses
            .lock()
            .get(&external_execution_id)
            .cloned()
            .or_else(|| self.default_outcome.clone())
            .unwrap_or_else(|| StubOutcome::NotResolvable("no stub configured".into()));

        match outcome {
            StubOutcome::Portfolio(id) => Ok(id),
            StubOutcome::PermanentRemote(msg) => Err(PipelineError::PermanentRemote(msg)),
            StubOutcome::NotResolvable(msg) => Err(PipelineError::NotResolvable(msg)),
            StubOutcome::Transient(msg) => Err(PipelineError::Transient(msg)),
        }
    }
}

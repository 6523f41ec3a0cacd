//! Component C: the ingestion engine. Validates, filters, deduplicates and
//! persists a batch of candidate executions, never failing the whole batch
//! because one record is bad.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::lookup::TradeLookupClient;
use crate::models::{
    normalize_scale, trade_date_for, CandidateExecution, NewAllocation, RecordResult,
};
use crate::store::AllocationStore;

pub const MAX_BATCH_SIZE: usize = 100;

pub struct IngestionEngine {
    store: Arc<dyn AllocationStore>,
    lookup: Arc<dyn TradeLookupClient>,
}

impl IngestionEngine {
    pub fn new(store: Arc<dyn AllocationStore>, lookup: Arc<dyn TradeLookupClient>) -> Self {
        Self { store, lookup }
    }

    /// Validates the whole batch's size up front, then processes each
    /// record independently; the result list mirrors the input order.
    pub async fn ingest(
        &self,
        batch: Vec<CandidateExecution>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<RecordResult>> {
        if batch.is_empty() || batch.len() > MAX_BATCH_SIZE {
            return Err(PipelineError::Validation(format!(
                "batch size {} outside [1, {MAX_BATCH_SIZE}]",
                batch.len()
            )));
        }

        let mut results = Vec::with_capacity(batch.len());
        for candidate in batch {
            if cancel.is_cancelled() {
                results.push(RecordResult::error(
                    candidate.external_execution_id,
                    "ingestion cancelled".to_string(),
                ));
                continue;
            }
            results.push(self.ingest_one(candidate, cancel).await);
        }
        Ok(results)
    }

    async fn ingest_one(
        &self,
        candidate: CandidateExecution,
        cancel: &CancellationToken,
    ) -> RecordResult {
        let external_id = candidate.external_execution_id;

        let validated = match validate(&candidate) {
            Ok(v) => v,
            Err(reason) => return RecordResult::error(external_id, reason),
        };

        if candidate.is_open {
            return RecordResult::skipped(external_id, None, "still open");
        }

        match self.store.find_by_external_execution_id(external_id).await {
            Ok(existing) => {
                return RecordResult::skipped(external_id, Some(existing.id), "already exists");
            }
            Err(PipelineError::NotFound) => {}
            Err(e) => return RecordResult::error(external_id, e.to_string()),
        }

        let portfolio_id = match self
            .lookup
            .resolve_portfolio(external_id, cancel)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(external_id, error = %e, "portfolio lookup failed");
                return RecordResult::error(external_id, e.to_string());
            }
        };

        let draft = build_draft(validated, portfolio_id);

        match self.store.try_insert_allocation(draft).await {
            Ok((id, _ready_to_send)) => {
                info!(external_id, allocation_id = id, "allocation created");
                RecordResult::created(external_id, id)
            }
            Err(PipelineError::AlreadyExists) => {
                match self.store.find_by_external_execution_id(external_id).await {
                    Ok(existing) => {
                        RecordResult::skipped(external_id, Some(existing.id), "already exists")
                    }
                    Err(_) => RecordResult::skipped(external_id, None, "already exists"),
                }
            }
            Err(e) => RecordResult::error(external_id, e.to_string()),
        }
    }
}

/// A candidate that has passed field-presence and range validation; fields
/// are no longer `Option`.
struct ValidatedCandidate {
    external_execution_id: i64,
    status: String,
    side: crate::models::Side,
    destination: String,
    security_id: String,
    ticker: String,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    quantity_filled: Decimal,
    total_amount: Decimal,
    average_price: Decimal,
    received_timestamp: chrono::DateTime<chrono::Utc>,
    sent_timestamp: chrono::DateTime<chrono::Utc>,
    last_fill_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

fn validate(c: &CandidateExecution) -> Result<ValidatedCandidate, String> {
    let status = c
        .status
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or("missing status")?;
    let side = c
        .side
        .as_deref()
        .and_then(crate::models::Side::parse)
        .ok_or("missing or invalid side")?;
    let destination = c
        .destination
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or("missing destination")?;
    let security_id = c
        .security_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or("missing securityId")?;
    let ticker = c
        .ticker
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or("missing ticker")?;
    let quantity = c.quantity.ok_or("missing quantity")?;
    if quantity <= Decimal::ZERO {
        return Err("quantity must be > 0".to_string());
    }
    let quantity_filled = c.quantity_filled.ok_or("missing quantityFilled")?;
    if quantity_filled < Decimal::ZERO {
        return Err("quantityFilled must be >= 0".to_string());
    }
    let total_amount = c.total_amount.ok_or("missing totalAmount")?;
    if total_amount < Decimal::ZERO {
        return Err("totalAmount must be >= 0".to_string());
    }
    let average_price = c.average_price.ok_or("missing averagePrice")?;
    if average_price <= Decimal::ZERO {
        return Err("averagePrice must be > 0".to_string());
    }
    let received_timestamp = c.received_timestamp.ok_or("missing receivedTimestamp")?;
    let sent_timestamp = c.sent_timestamp.ok_or("missing sentTimestamp")?;

    Ok(ValidatedCandidate {
        external_execution_id: c.external_execution_id,
        status,
        side,
        destination,
        security_id,
        ticker,
        quantity,
        limit_price: c.limit_price,
        quantity_filled,
        total_amount,
        average_price,
        received_timestamp,
        sent_timestamp,
        last_fill_timestamp: c.last_fill_timestamp,
    })
}

fn build_draft(v: ValidatedCandidate, portfolio_id: String) -> NewAllocation {
    NewAllocation {
        external_execution_id: v.external_execution_id,
        status: v.status,
        side: v.side,
        destination: v.destination,
        security_id: v.security_id,
        ticker: v.ticker,
        portfolio_id,
        trade_date: trade_date_for(v.sent_timestamp),
        quantity: normalize_scale(v.quantity),
        limit_price: v.limit_price.map(normalize_scale),
        quantity_filled: normalize_scale(v.quantity_filled),
        total_amount: normalize_scale(v.total_amount),
        average_price: normalize_scale(v.average_price),
        received_timestamp: v.received_timestamp,
        sent_timestamp: v.sent_timestamp,
        last_fill_timestamp: v.last_fill_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::stub::{StubOutcome, StubTradeLookupClient};
    use crate::models::RecordStatus;
    use crate::store::memory::InMemoryAllocationStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn happy_candidate(id: i64) -> CandidateExecution {
        CandidateExecution {
            external_execution_id: id,
            is_open: false,
            status: Some("FILLED".into()),
            side: Some("BUY".into()),
            destination: Some("NYSE".into()),
            security_id: Some("SEC000000000000000000ABCD".into()),
            ticker: Some("AAPL".into()),
            quantity: Some(dec!(100.5)),
            limit_price: None,
            quantity_filled: Some(dec!(100.5)),
            total_amount: Some(dec!(15075.0)),
            average_price: Some(dec!(150.0)),
            received_timestamp: Some(Utc::now()),
            sent_timestamp: Some(Utc::now()),
            last_fill_timestamp: None,
        }
    }

    fn engine_with_portfolio(portfolio: &str) -> IngestionEngine {
        IngestionEngine::new(
            Arc::new(InMemoryAllocationStore::new()),
            Arc::new(StubTradeLookupClient::with_default(StubOutcome::Portfolio(
                portfolio.to_string(),
            ))),
        )
    }

    #[tokio::test]
    async fn happy_ingest_creates_one_allocation() {
        let engine = engine_with_portfolio("PORTFOLIO123456789012");
        let cancel = CancellationToken::new();
        let results = engine
            .ingest(vec![happy_candidate(123)], &cancel)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RecordStatus::Created);
        assert!(results[0].allocation_id.is_some());
    }

    #[tokio::test]
    async fn batch_size_zero_is_rejected_before_processing() {
        let engine = engine_with_portfolio("PORTFOLIO123456789012");
        let cancel = CancellationToken::new();
        let err = engine.ingest(vec![], &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn batch_size_over_limit_is_rejected() {
        let engine = engine_with_portfolio("PORTFOLIO123456789012");
        let cancel = CancellationToken::new();
        let batch: Vec<_> = (0..101).map(happy_candidate).collect();
        let err = engine.ingest(batch, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn open_trade_is_skipped_without_lookup() {
        let engine = IngestionEngine::new(
            Arc::new(InMemoryAllocationStore::new()),
            Arc::new(StubTradeLookupClient::with_default(
                StubOutcome::PermanentRemote("should not be called".into()),
            )),
        );
        let mut candidate = happy_candidate(1);
        candidate.is_open = true;
        let cancel = CancellationToken::new();
        let results = engine.ingest(vec![candidate], &cancel).await.unwrap();
        assert_eq!(results[0].status, RecordStatus::Skipped);
    }

    #[tokio::test]
    async fn invalid_side_value_is_a_per_record_error_not_a_decode_failure() {
        let engine = IngestionEngine::new(
            Arc::new(InMemoryAllocationStore::new()),
            Arc::new(StubTradeLookupClient::with_default(
                StubOutcome::PermanentRemote("should not be called".into()),
            )),
        );
        let mut candidate = happy_candidate(1);
        candidate.side = Some("HOLD".into());
        let cancel = CancellationToken::new();
        let results = engine.ingest(vec![candidate], &cancel).await.unwrap();
        assert_eq!(results[0].status, RecordStatus::Error);
    }

    #[tokio::test]
    async fn one_bad_side_does_not_poison_the_rest_of_the_batch() {
        let engine = engine_with_portfolio("PORTFOLIO123456789012");
        let cancel = CancellationToken::new();
        let mut batch: Vec<_> = (0..5).map(happy_candidate).collect();
        batch[2].side = Some("buy".into()); // lowercase is still accepted
        batch.push({
            let mut bad = happy_candidate(99);
            bad.side = Some("NOT_A_SIDE".into());
            bad
        });
        let results = engine.ingest(batch, &cancel).await.unwrap();
        assert_eq!(results.len(), 6);
        assert_eq!(results[5].status, RecordStatus::Error);
        assert_eq!(
            results.iter().filter(|r| r.status == RecordStatus::Created).count(),
            5
        );
    }

    #[tokio::test]
    async fn duplicate_in_store_is_skipped() {
        let store = Arc::new(InMemoryAllocationStore::new());
        let engine = IngestionEngine::new(
            store.clone(),
            Arc::new(StubTradeLookupClient::with_default(StubOutcome::Portfolio(
                "PORTFOLIO123456789012".into(),
            ))),
        );
        let cancel = CancellationToken::new();
        engine.ingest(vec![happy_candidate(42)], &cancel).await.unwrap();
        let results = engine.ingest(vec![happy_candidate(42)], &cancel).await.unwrap();
        assert_eq!(results[0].status, RecordStatus::Skipped);
    }

    #[tokio::test]
    async fn permanent_lookup_failure_is_an_error() {
        let engine = IngestionEngine::new(
            Arc::new(InMemoryAllocationStore::new()),
            Arc::new(StubTradeLookupClient::with_default(
                StubOutcome::PermanentRemote("404".into()),
            )),
        );
        let cancel = CancellationToken::new();
        let results = engine.ingest(vec![happy_candidate(7)], &cancel).await.unwrap();
        assert_eq!(results[0].status, RecordStatus::Error);
    }

    #[tokio::test]
    async fn missing_required_field_is_an_error_before_lookup() {
        let engine = IngestionEngine::new(
            Arc::new(InMemoryAllocationStore::new()),
            Arc::new(StubTradeLookupClient::with_default(
                StubOutcome::PermanentRemote("should not be called".into()),
            )),
        );
        let mut candidate = happy_candidate(9);
        candidate.status = None;
        let cancel = CancellationToken::new();
        let results = engine.ingest(vec![candidate], &cancel).await.unwrap();
        assert_eq!(results[0].status, RecordStatus::Error);
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let engine = engine_with_portfolio("PORTFOLIO123456789012");
        let cancel = CancellationToken::new();
        let batch: Vec<_> = (100..110).map(happy_candidate).collect();
        let results = engine.ingest(batch, &cancel).await.unwrap();
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.external_execution_id, 100 + i as i64);
        }
    }
}

//! In-memory `AllocationStore`, used by the ingestion/send engines' own
//! unit tests so they don't need a filesystem-backed SQLite file. Upholds
//! the same monotonic-timestamp and uniqueness contracts as
//! `sqlite::SqliteAllocationStore`, just guarded by a `Mutex` instead of a
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::errors::{PipelineError, PipelineResult};
use crate::models::{Allocation, NewAllocation};
use crate::store::AllocationStore;

#[derive(Default)]
struct Inner {
    allocations: Vec<Allocation>,
    next_id: i64,
    batch_history: Vec<(DateTime<Utc>, DateTime<Utc>)>, // (previous_start_time, start_time)
}

pub struct InMemoryAllocationStore {
    inner: Mutex<Inner>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                allocations: Vec::new(),
                next_id: 1,
                batch_history: Vec::new(),
            }),
        }
    }
}

impl Default for InMemoryAllocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn try_insert_allocation(
        &self,
        draft: NewAllocation,
    ) -> PipelineResult<(i64, DateTime<Utc>)> {
        let mut inner = self.inner.lock();
        if inner
            .allocations
            .iter()
            .any(|a| a.external_execution_id == draft.external_execution_id)
        {
            return Err(PipelineError::AlreadyExists);
        }

        let prev_max = inner
            .allocations
            .iter()
            .map(|a| a.ready_to_send_timestamp)
            .max();
        let mut ready_to_send = Utc::now();
        if let Some(prev) = prev_max {
            if ready_to_send <= prev {
                ready_to_send = prev + chrono::Duration::microseconds(1);
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let allocation = Allocation {
            id,
            external_execution_id: draft.external_execution_id,
            is_open: false,
            status: draft.status,
            side: draft.side,
            destination: draft.destination,
            security_id: draft.security_id,
            ticker: draft.ticker,
            portfolio_id: draft.portfolio_id,
            trade_date: draft.trade_date,
            quantity: draft.quantity,
            limit_price: draft.limit_price,
            quantity_filled: draft.quantity_filled,
            total_amount: draft.total_amount,
            average_price: draft.average_price,
            received_timestamp: draft.received_timestamp,
            sent_timestamp: draft.sent_timestamp,
            last_fill_timestamp: draft.last_fill_timestamp,
            ready_to_send_timestamp: ready_to_send,
            version: 1,
        };
        inner.allocations.push(allocation);
        Ok((id, ready_to_send))
    }

    async fn find_by_external_execution_id(
        &self,
        external_execution_id: i64,
    ) -> PipelineResult<Allocation> {
        let inner = self.inner.lock();
        inner
            .allocations
            .iter()
            .find(|a| a.external_execution_id == external_execution_id)
            .cloned()
            .ok_or(PipelineError::NotFound)
    }

    async fn find_by_id(&self, id: i64) -> PipelineResult<Allocation> {
        let inner = self.inner.lock();
        inner
            .allocations
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(PipelineError::NotFound)
    }

    async fn list_paged(&self, limit: i64, offset: i64) -> PipelineResult<(Vec<Allocation>, i64)> {
        let inner = self.inner.lock();
        let mut sorted = inner.allocations.clone();
        sorted.sort_by_key(|a| a.id);
        let total = sorted.len() as i64;
        let page = sorted
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn select_for_window(
        &self,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<Allocation>> {
        let inner = self.inner.lock();
        let mut selection: Vec<Allocation> = inner
            .allocations
            .iter()
            .filter(|a| a.ready_to_send_timestamp >= prev && a.ready_to_send_timestamp < now)
            .cloned()
            .collect();
        selection.sort_by_key(|a| (a.ready_to_send_timestamp, a.id));
        Ok(selection)
    }

    async fn try_claim_batch_window(&self) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let mut inner = self.inner.lock();
        let prev = inner
            .batch_history
            .iter()
            .map(|(_, start)| *start)
            .max()
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());

        let mut now = Utc::now();
        if now <= prev {
            now += chrono::Duration::microseconds(1);
        }

        if inner.batch_history.iter().any(|(_, start)| *start == now) {
            return Err(PipelineError::WindowContended);
        }

        inner.batch_history.push((prev, now));
        Ok((prev, now))
    }

    async fn get_max_batch_start(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        Ok(inner.batch_history.iter().map(|(_, start)| *start).max())
    }
}

//! Component A: the allocation store. The sole owner of durability and
//! concurrency invariants — every coordination guarantee the pipeline makes
//! is enforced here, through unique constraints, never through in-process
//! locks (see DESIGN.md).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::PipelineResult;
use crate::models::{Allocation, NewAllocation};

/// Variants: a real SQLite-backed store (`sqlite::SqliteAllocationStore`) and
/// an in-memory store (`memory::InMemoryAllocationStore`) used by the
/// engines' own unit tests. Both must uphold the same contracts.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Inserts a new allocation. Fails with `AlreadyExists` if a row with the
    /// same `external_execution_id` is already present. On success returns
    /// the assigned `id` and the store-assigned `ready_to_send_timestamp`.
    async fn try_insert_allocation(
        &self,
        draft: NewAllocation,
    ) -> PipelineResult<(i64, DateTime<Utc>)>;

    async fn find_by_external_execution_id(
        &self,
        external_execution_id: i64,
    ) -> PipelineResult<Allocation>;

    async fn find_by_id(&self, id: i64) -> PipelineResult<Allocation>;

    /// `limit` must already be validated to `[1, 1000]` by the caller.
    /// Returns the page and the total row count.
    async fn list_paged(&self, limit: i64, offset: i64) -> PipelineResult<(Vec<Allocation>, i64)>;

    /// Allocations with `prev <= ready_to_send_timestamp < now`, ordered
    /// ascending by `(ready_to_send_timestamp, id)`.
    async fn select_for_window(
        &self,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<Allocation>>;

    /// Atomically claims `[prev, now)` where `prev` is the `start_time` of
    /// the last committed batch-history row (or the epoch on the first
    /// call) and `now` is a freshly store-assigned `start_time`. Fails with
    /// `WindowContended` if a concurrent claim committed first.
    async fn try_claim_batch_window(&self) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)>;

    /// Diagnostic-only read of `max(start_time)` over batch history.
    async fn get_max_batch_start(&self) -> PipelineResult<Option<DateTime<Utc>>>;
}

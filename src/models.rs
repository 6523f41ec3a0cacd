//! Data model for the allocation pipeline: the allocation record and
//! batch-history record, plus the request/response shapes the HTTP layer
//! exchanges with callers.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Parses a wire-format side string, accepted case-insensitively so a
    /// validation failure (not a deserialization failure) is what a bad
    /// value produces — see `ingest::validate`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// One normalized, portfolio-enriched trade execution, as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: i64,
    pub external_execution_id: i64,
    pub is_open: bool,
    pub status: String,
    pub side: Side,
    pub destination: String,
    pub security_id: String,
    pub ticker: String,
    pub portfolio_id: String,
    pub trade_date: NaiveDate,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    pub quantity_filled: Decimal,
    pub total_amount: Decimal,
    pub average_price: Decimal,
    pub received_timestamp: DateTime<Utc>,
    pub sent_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fill_timestamp: Option<DateTime<Utc>>,
    pub ready_to_send_timestamp: DateTime<Utc>,
    pub version: i64,
}

/// Everything the ingestion engine has derived and validated, ready for
/// `AllocationStore::try_insert_allocation`. The store assigns `id`,
/// `ready_to_send_timestamp` and the initial `version`.
#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub external_execution_id: i64,
    pub status: String,
    pub side: Side,
    pub destination: String,
    pub security_id: String,
    pub ticker: String,
    pub portfolio_id: String,
    pub trade_date: NaiveDate,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub quantity_filled: Decimal,
    pub total_amount: Decimal,
    pub average_price: Decimal,
    pub received_timestamp: DateTime<Utc>,
    pub sent_timestamp: DateTime<Utc>,
    pub last_fill_timestamp: Option<DateTime<Utc>>,
}

/// One successful `sendBatch` attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHistoryRecord {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub previous_start_time: DateTime<Utc>,
    pub version: i64,
}

/// A raw candidate execution as reported by the upstream Trade Service,
/// before validation. Every field the ingestion engine must check for
/// presence is `Option` here so a missing field is representable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateExecution {
    pub external_execution_id: i64,
    #[serde(default)]
    pub is_open: bool,
    pub status: Option<String>,
    pub side: Option<String>,
    pub destination: Option<String>,
    pub security_id: Option<String>,
    pub ticker: Option<String>,
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub quantity_filled: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub received_timestamp: Option<DateTime<Utc>>,
    pub sent_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fill_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Created,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub external_execution_id: i64,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordResult {
    pub fn created(external_execution_id: i64, allocation_id: i64) -> Self {
        Self {
            external_execution_id,
            status: RecordStatus::Created,
            allocation_id: Some(allocation_id),
            error: None,
        }
    }

    pub fn skipped(external_execution_id: i64, allocation_id: Option<i64>, reason: &str) -> Self {
        Self {
            external_execution_id,
            status: RecordStatus::Skipped,
            allocation_id,
            error: Some(reason.to_string()),
        }
    }

    pub fn error(external_execution_id: i64, reason: String) -> Self {
        Self {
            external_execution_id,
            status: RecordStatus::Error,
            allocation_id: None,
            error: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub results: Vec<RecordResult>,
}

impl BatchResult {
    pub fn from_results(results: Vec<RecordResult>) -> Self {
        let processed = results
            .iter()
            .filter(|r| r.status == RecordStatus::Created)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.status == RecordStatus::Skipped)
            .count();
        let errored = results
            .iter()
            .filter(|r| r.status == RecordStatus::Error)
            .count();
        Self {
            processed,
            skipped,
            errored,
            results,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Success,
    Error,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub processed: usize,
    pub file_name: String,
    pub status: SendStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionsPage {
    pub executions: Vec<Allocation>,
    pub pagination: Pagination,
}

/// Project a UTC instant into the fixed exchange time zone and truncate to
/// midnight local, per the `tradeDate` derivation rule. The only place in
/// the system a non-UTC zone is used.
pub fn trade_date_for(sent_timestamp: DateTime<Utc>) -> NaiveDate {
    sent_timestamp
        .with_timezone(&chrono_tz::America::New_York)
        .date_naive()
}

/// Clamp a money-like field to the fixed scale (18 integer, 8 fractional digits).
pub fn normalize_scale(value: Decimal) -> Decimal {
    value.round_dp(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn trade_date_projects_to_exchange_zone() {
        // 2024-01-15T10:01:00Z is 05:01 EST the same calendar day.
        let sent = Utc.with_ymd_and_hms(2024, 1, 15, 10, 1, 0).unwrap();
        assert_eq!(
            trade_date_for(sent),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }

    #[test]
    fn trade_date_crosses_midnight_boundary() {
        // 2024-01-15T04:30:00Z is 2024-01-14T23:30 EST: the prior calendar day.
        let sent = Utc.with_ymd_and_hms(2024, 1, 15, 4, 30, 0).unwrap();
        assert_eq!(
            trade_date_for(sent),
            NaiveDate::from_ymd_opt(2024, 1, 14).unwrap()
        );
    }

    #[test]
    fn normalize_scale_truncates_to_eight_fractional_digits() {
        let value: Decimal = "1.123456789".parse().unwrap();
        assert_eq!(normalize_scale(value).to_string(), "1.12345679");
    }
}

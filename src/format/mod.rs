//! Component E (formatting half): renders a selection of allocations into
//! the transaction CSV the downstream Portfolio Accounting CLI consumes.

pub mod invoker;

use crate::models::Allocation;

const HEADER: &str =
    "portfolio_id,security_id,source_id,transaction_type,quantity,price,transaction_date";

/// Deterministic given the input order: one line per allocation, in the
/// order the caller passed them.
pub fn format_transactions(allocations: &[Allocation]) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    for alloc in allocations {
        out.push_str(&format_row(alloc));
        out.push('\n');
    }
    out
}

fn format_row(alloc: &Allocation) -> String {
    let source_id = format!("AC{}", alloc.id);
    let fields = [
        csv_field(&alloc.portfolio_id),
        csv_field(&alloc.security_id),
        csv_field(&source_id),
        csv_field(alloc.side.as_str()),
        csv_field(&format_decimal8(alloc.quantity)),
        csv_field(&format_decimal8(alloc.average_price)),
        csv_field(&alloc.trade_date.format("%Y-%m-%d").to_string()),
    ];
    fields.join(",")
}

fn format_decimal8(value: rust_decimal::Decimal) -> String {
    format!("{:.8}", value)
}

/// Quotes a field if it contains a comma, double-quote, or newline, doubling
/// any internal double-quotes.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

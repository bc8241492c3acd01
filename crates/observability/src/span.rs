//! Span correlation helpers.

use std::fmt::Display;

use tracing::Span;

/// Field name used for transaction correlation across spans and log lines.
pub const TRANSACTION_ID_FIELD: &str = "transaction_id";

/// Record the transaction id on the current span.
///
/// The span must declare a `transaction_id` field (usually as
/// `tracing::field::Empty`) for the value to stick; otherwise this is a no-op.
pub fn tag_transaction_id(id: impl Display) {
    Span::current().record(TRANSACTION_ID_FIELD, tracing::field::display(id));
}

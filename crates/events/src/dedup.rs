//! Identity of inbound events.
//!
//! The Hold Service does not assign its own event ids, so the ledger derives
//! one from `(event type, transaction id)`: every logical delivery of the same
//! lifecycle step maps to the same id. The payload hash is computed over the
//! re-serialized typed payload so that formatting differences upstream do not
//! defeat the check.

use core::fmt::Display;

use sha2::{Digest, Sha256};

/// Deterministic id of an inbound event: hex SHA-256 of `"<type>:<transaction id>"`.
pub fn event_id(event_type: &str, transaction_id: impl Display) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b":");
    hasher.update(transaction_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a serialized payload.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

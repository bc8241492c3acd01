//! Integration events of the ledger service.
//!
//! - [`transaction`]: events the ledger produces through its outbox.
//! - [`hold`]: events the Hold Service delivers back to the ledger.
//! - [`dedup`]: deterministic event ids and payload hashes for idempotent consumption.
//! - [`stream`]: the outbound event stream abstraction.

pub mod dedup;
pub mod hold;
pub mod in_memory_stream;
pub mod stream;
pub mod transaction;

pub use dedup::{event_id, payload_hash};
pub use hold::{
    EVENT_TYPE_FIELD, HoldCreated, HoldEvent, HoldEventKind, HoldExpired, HoldVoided,
    InboundDecodeError, InboundMessage,
};
pub use in_memory_stream::InMemoryEventStream;
pub use stream::{EventStream, StreamError, StreamMessage};
pub use transaction::{
    TransactionAuthorized, TransactionEvent, TransactionEventError, TransactionFailed,
    TransactionInitiated, TransactionPosted,
};

//! Reactions to the asynchronous side of the hold saga.

pub mod hold_events;

pub use hold_events::{HoldEventProcessor, ProcessOutcome};

//! Tracing and logging setup shared by the service crates.

pub mod span;
pub mod subscriber;

pub use span::tag_transaction_id;

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init();
}

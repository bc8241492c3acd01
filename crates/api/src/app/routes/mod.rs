use axum::{
    Router,
    routing::{get, post},
};

pub mod accounts;
pub mod hold_events;
pub mod system;
pub mod transactions;

/// Router for all ledger endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/transactions", transactions::router())
        .route("/accounts/:id", get(accounts::get_account))
        .route("/hold-events", post(hold_events::ingest_hold_event))
}

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use creditx_core::{HoldId, TransactionId};

use crate::app::dto::{self, CommitTransactionRequest, CreateTransactionRequest, TransactionStatusResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_transaction))
        .route("/cashback", post(create_cashback_transaction))
        .route("/:id", get(get_transaction))
        .route("/:id/commit", post(commit_transaction))
}

pub async fn create_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> axum::response::Response {
    let request = match parse_body(body).and_then(CreateTransactionRequest::into_request) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.orchestrator().create_inbound_transaction(request).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(TransactionStatusResponse::new(receipt.transaction_id, receipt.status)),
        )
            .into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn create_cashback_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> axum::response::Response {
    let request = match parse_body(body).and_then(CreateTransactionRequest::into_request) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.orchestrator().create_cashback_transaction(request).await {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(TransactionStatusResponse::new(receipt.transaction_id, receipt.status)),
        )
            .into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn commit_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    body: Result<Json<CommitTransactionRequest>, JsonRejection>,
) -> axum::response::Response {
    let body = match parse_body(body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .orchestrator()
        .commit_transaction(TransactionId::new(id), HoldId::new(body.hold_id))
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(
                TransactionStatusResponse::new(receipt.transaction_id, receipt.status)
                    .with_message("Transaction committed successfully"),
            ),
        )
            .into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn get_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    match services.transaction_with_entries(TransactionId::new(id)).await {
        Ok((txn, entries)) => {
            (StatusCode::OK, Json(dto::transaction_to_json(&txn, &entries))).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Malformed or incomplete bodies are validation errors, not 422s.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    match body {
        Ok(Json(v)) => Ok(v),
        Err(rejection) => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
        )),
    }
}

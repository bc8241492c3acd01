use std::str::FromStr;

use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use creditx_core::{AccountId, Currency, TransactionId};
use creditx_infra::TransactionRequest;
use creditx_ledger::{Account, Transaction, TransactionEntry, TransactionStatus};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /transactions` and `POST /transactions/cashback`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub issuer_account_id: i64,
    pub merchant_account_id: i64,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

impl CreateTransactionRequest {
    pub fn into_request(self) -> Result<TransactionRequest, axum::response::Response> {
        let currency = match self.currency.as_deref() {
            None => Currency::usd(),
            Some(code) => Currency::from_str(code).map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
            })?,
        };
        Ok(TransactionRequest {
            issuer_account_id: AccountId::new(self.issuer_account_id),
            merchant_account_id: AccountId::new(self.merchant_account_id),
            amount: self.amount,
            currency,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitTransactionRequest {
    pub hold_id: i64,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl TransactionStatusResponse {
    pub fn new(transaction_id: TransactionId, status: TransactionStatus) -> Self {
        Self {
            transaction_id,
            status,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }
}

pub fn account_to_json(account: &Account) -> serde_json::Value {
    json!({
        "accountId": account.id,
        "ownerId": account.owner_id,
        "role": account.role,
        "status": account.status,
        "availableBalance": account.available(),
        "reservedBalance": account.reserved(),
        "creditLimit": account.credit_limit,
        "updatedAt": account.updated_at,
    })
}

pub fn transaction_to_json(txn: &Transaction, entries: &[TransactionEntry]) -> serde_json::Value {
    json!({
        "transactionId": txn.id,
        "type": txn.kind,
        "status": txn.status,
        "issuerAccountId": txn.issuer_account_id,
        "merchantAccountId": txn.merchant_account_id,
        "holdId": txn.hold_id,
        "amount": txn.amount,
        "currency": txn.currency,
        "createdAt": txn.created_at,
        "updatedAt": txn.updated_at,
        "entries": entries
            .iter()
            .map(|e| json!({
                "entryId": e.entry_id,
                "accountId": e.account_id,
                "amount": e.amount,
                "createdAt": e.created_at,
            }))
            .collect::<Vec<_>>(),
    })
}

//! Client for the external Hold Service.
//!
//! One synchronous call: `POST {base}/api/holds`. Every call carries the
//! client timeout; the caller decides whether to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use creditx_core::{AccountId, Currency, HoldId, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHoldRequest {
    pub transaction_id: TransactionId,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
}

/// Wire form of the Hold Service reply. `holdId` is mandatory in practice but
/// checked explicitly so a malformed reply is reported as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHoldResponse {
    #[serde(default)]
    pub hold_id: Option<HoldId>,
    pub status: String,
}

/// A validated hold reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldReceipt {
    pub hold_id: HoldId,
    pub status: String,
}

/// What the immediate hold reply means for the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldDecision {
    Authorized,
    /// Wait for the asynchronous `hold.created` event.
    Pending,
    Rejected(String),
}

impl HoldReceipt {
    pub fn decision(&self) -> HoldDecision {
        match self.status.trim().to_ascii_uppercase().as_str() {
            "AUTHORIZED" => HoldDecision::Authorized,
            "REJECTED" | "DECLINED" | "VOIDED" | "EXPIRED" | "FAILED" => {
                HoldDecision::Rejected(self.status.trim().to_ascii_uppercase())
            }
            _ => HoldDecision::Pending,
        }
    }
}

impl TryFrom<CreateHoldResponse> for HoldReceipt {
    type Error = HoldClientError;

    fn try_from(value: CreateHoldResponse) -> Result<Self, Self::Error> {
        let hold_id = value
            .hold_id
            .ok_or_else(|| HoldClientError::InvalidResponse("missing holdId".to_string()))?;
        Ok(Self {
            hold_id,
            status: value.status,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HoldClientError {
    #[error("hold service timed out")]
    Timeout,

    #[error("hold service unreachable: {0}")]
    Transport(String),

    #[error("hold service returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("hold service rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid hold service response: {0}")]
    InvalidResponse(String),
}

impl HoldClientError {
    /// Network failures, timeouts and 5xx replies may succeed on a later try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_) | Self::Server { .. })
    }
}

#[async_trait]
pub trait HoldClient: Send + Sync {
    async fn create_hold(&self, request: &CreateHoldRequest) -> Result<HoldReceipt, HoldClientError>;
}

#[async_trait]
impl<C> HoldClient for Arc<C>
where
    C: HoldClient + ?Sized,
{
    async fn create_hold(&self, request: &CreateHoldRequest) -> Result<HoldReceipt, HoldClientError> {
        (**self).create_hold(request).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpHoldClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHoldClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HoldClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HoldClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn transport_error(err: reqwest::Error) -> HoldClientError {
    if err.is_timeout() {
        HoldClientError::Timeout
    } else if err.is_decode() {
        HoldClientError::InvalidResponse(err.to_string())
    } else {
        HoldClientError::Transport(err.to_string())
    }
}

/// Body of a non-2xx reply, for the error message. An unreadable body is
/// logged and reported as empty; the status alone decides the error kind.
async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => body,
        Err(err) => {
            warn!(status = status.as_u16(), error = %err, "failed to read hold service error body");
            String::new()
        }
    }
}

#[async_trait]
impl HoldClient for HttpHoldClient {
    #[instrument(skip(self, request), fields(transaction_id = %request.transaction_id), err)]
    async fn create_hold(&self, request: &CreateHoldRequest) -> Result<HoldReceipt, HoldClientError> {
        let url = format!("{}/api/holds", self.base_url);
        debug!(%url, amount = %request.amount, "requesting hold");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            let body = error_body(response).await;
            return Err(HoldClientError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(HoldClientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let reply: CreateHoldResponse = response.json().await.map_err(transport_error)?;
        HoldReceipt::try_from(reply)
    }
}

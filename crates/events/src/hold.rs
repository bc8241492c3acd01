//! Hold lifecycle events delivered by the Hold Service.
//!
//! Messages arrive with an event-type tag, either as a transport header or as
//! an `eventType` field in the JSON body. A message with a missing or unknown
//! tag, or a tag that does not match the handler asking for it, is skipped
//! rather than processed.

use core::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use creditx_core::{AccountId, Currency, HoldId, TransactionId};

use crate::dedup;

/// JSON field carrying the tag when the transport has no headers.
pub const EVENT_TYPE_FIELD: &str = "eventType";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldEventKind {
    Created,
    Expired,
    Voided,
}

impl HoldEventKind {
    pub const ALL: [HoldEventKind; 3] = [Self::Created, Self::Expired, Self::Voided];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "hold.created",
            Self::Expired => "hold.expired",
            Self::Voided => "hold.voided",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag.trim())
    }
}

impl fmt::Display for HoldEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldCreated {
    pub hold_id: HoldId,
    pub transaction_id: TransactionId,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldExpired {
    pub hold_id: HoldId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub status: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldVoided {
    pub hold_id: HoldId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldEvent {
    Created(HoldCreated),
    Expired(HoldExpired),
    Voided(HoldVoided),
}

impl HoldEvent {
    pub fn kind(&self) -> HoldEventKind {
        match self {
            Self::Created(_) => HoldEventKind::Created,
            Self::Expired(_) => HoldEventKind::Expired,
            Self::Voided(_) => HoldEventKind::Voided,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Self::Created(e) => e.transaction_id,
            Self::Expired(e) => e.transaction_id,
            Self::Voided(e) => e.transaction_id,
        }
    }

    pub fn hold_id(&self) -> HoldId {
        match self {
            Self::Created(e) => e.hold_id,
            Self::Expired(e) => e.hold_id,
            Self::Voided(e) => e.hold_id,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::Created(e) => e.amount,
            Self::Expired(e) => e.amount,
            Self::Voided(e) => e.amount,
        }
    }

    /// Idempotency key: one id per lifecycle step of a transaction.
    pub fn event_id(&self) -> String {
        dedup::event_id(self.kind().as_str(), self.transaction_id())
    }

    /// Hash of the canonical (re-serialized) payload.
    pub fn payload_hash(&self) -> Result<String, serde_json::Error> {
        let bytes = match self {
            Self::Created(e) => serde_json::to_vec(e)?,
            Self::Expired(e) => serde_json::to_vec(e)?,
            Self::Voided(e) => serde_json::to_vec(e)?,
        };
        Ok(dedup::payload_hash(&bytes))
    }

    fn parse(kind: HoldEventKind, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            HoldEventKind::Created => Self::Created(serde_json::from_str(payload)?),
            HoldEventKind::Expired => Self::Expired(serde_json::from_str(payload)?),
            HoldEventKind::Voided => Self::Voided(serde_json::from_str(payload)?),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed {kind} payload: {source}")]
pub struct InboundDecodeError {
    pub kind: HoldEventKind,
    #[source]
    pub source: serde_json::Error,
}

/// A raw inbound message: optional transport tag plus the JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub event_type: Option<String>,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(event_type: Option<String>, payload: impl Into<String>) -> Self {
        Self {
            event_type,
            payload: payload.into(),
        }
    }

    /// The routing tag: the transport header if present, else the body field.
    pub fn tag(&self) -> Option<String> {
        if let Some(tag) = self.event_type.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(tag.trim().to_string());
        }
        let body: serde_json::Value = serde_json::from_str(&self.payload).ok()?;
        body.get(EVENT_TYPE_FIELD)?.as_str().map(str::to_string)
    }

    pub fn kind(&self) -> Option<HoldEventKind> {
        self.tag().as_deref().and_then(HoldEventKind::from_tag)
    }

    /// Route by tag. `Ok(None)` means the message is not a hold event.
    pub fn decode(&self) -> Result<Option<HoldEvent>, InboundDecodeError> {
        match self.kind() {
            Some(kind) => self.parse(kind).map(Some),
            None => Ok(None),
        }
    }

    /// Decode only if the tag matches `expected`; anything else is `Ok(None)`.
    pub fn decode_as(&self, expected: HoldEventKind) -> Result<Option<HoldEvent>, InboundDecodeError> {
        if self.kind() != Some(expected) {
            return Ok(None);
        }
        self.parse(expected).map(Some)
    }

    fn parse(&self, kind: HoldEventKind) -> Result<HoldEvent, InboundDecodeError> {
        HoldEvent::parse(kind, &self.payload).map_err(|source| InboundDecodeError { kind, source })
    }
}

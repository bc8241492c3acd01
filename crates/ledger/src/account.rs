use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use creditx_core::{AccountId, DomainError, DomainResult, OwnerId};

/// Which side of an inbound transaction an account may sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountRole {
    Issuer,
    Merchant,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issuer => "ISSUER",
            Self::Merchant => "MERCHANT",
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ISSUER" => Ok(Self::Issuer),
            "MERCHANT" => Ok(Self::Merchant),
            other => Err(DomainError::validation(format!("unknown account role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Blocked,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            "CLOSED" => Ok(Self::Closed),
            other => Err(DomainError::validation(format!("unknown account status {other:?}"))),
        }
    }
}

/// Result of releasing a hold.
///
/// `shortfall` is the part of the release that exceeded the reserved balance
/// and was clamped away. Non-zero values indicate upstream data drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub released: Decimal,
    pub shortfall: Decimal,
}

impl Release {
    pub fn is_clamped(&self) -> bool {
        self.shortfall > Decimal::ZERO
    }
}

/// Result of capturing funds at posting time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Portion taken from the reserved balance.
    pub from_reserved: Decimal,
    /// Portion debited from `available` because it was never reserved.
    pub from_available: Decimal,
}

/// A ledger party with its balances.
///
/// Invariant: `available >= 0` and `reserved >= 0` after every operation. The
/// balances are private so that every mutation goes through the checked
/// operations below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub role: AccountRole,
    pub status: AccountStatus,
    available: Decimal,
    reserved: Decimal,
    pub credit_limit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh active account with the given opening balance.
    pub fn open(
        id: AccountId,
        owner_id: OwnerId,
        role: AccountRole,
        available: Decimal,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        Self::restore(AccountParts {
            id,
            owner_id,
            role,
            status: AccountStatus::Active,
            available,
            reserved: Decimal::ZERO,
            credit_limit: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild an account from persisted parts, checking the balance invariant.
    pub fn restore(parts: AccountParts) -> DomainResult<Self> {
        if parts.available < Decimal::ZERO || parts.reserved < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "account {} has negative balances (available {}, reserved {})",
                parts.id, parts.available, parts.reserved
            )));
        }
        Ok(Self {
            id: parts.id,
            owner_id: parts.owner_id,
            role: parts.role,
            status: parts.status,
            available: parts.available,
            reserved: parts.reserved,
            credit_limit: parts.credit_limit,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn ensure_active(&self) -> DomainResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "account {} is {}",
                self.id, self.status
            )))
        }
    }

    pub fn ensure_role(&self, role: AccountRole) -> DomainResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "account {} is {}, expected {}",
                self.id, self.role, role
            )))
        }
    }

    pub fn ensure_available(&self, amount: Decimal) -> DomainResult<()> {
        if self.available >= amount {
            Ok(())
        } else {
            Err(DomainError::insufficient_balance(self.id, self.available, amount))
        }
    }

    /// Move `amount` from `available` to `reserved`.
    pub fn reserve(&mut self, amount: Decimal, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(amount)?;
        self.ensure_available(amount)?;
        self.available -= amount;
        self.reserved += amount;
        self.updated_at = now;
        Ok(())
    }

    /// Move `amount` back from `reserved` to `available`.
    ///
    /// `available` always grows by the full amount; `reserved` never drops
    /// below zero.
    pub fn release(&mut self, amount: Decimal, now: DateTime<Utc>) -> DomainResult<Release> {
        ensure_positive(amount)?;
        let released = amount.min(self.reserved);
        self.reserved -= released;
        self.available += amount;
        self.updated_at = now;
        Ok(Release {
            released,
            shortfall: amount - released,
        })
    }

    /// Settle `amount` out of this account at posting time.
    ///
    /// Reserved funds are consumed first; anything that was never reserved is
    /// debited from `available`. Fails without mutating when `available` cannot
    /// cover the unreserved part.
    pub fn capture(&mut self, amount: Decimal, now: DateTime<Utc>) -> DomainResult<Capture> {
        ensure_positive(amount)?;
        let from_reserved = amount.min(self.reserved);
        let from_available = amount - from_reserved;
        self.ensure_available(from_available)?;
        self.reserved -= from_reserved;
        self.available -= from_available;
        self.updated_at = now;
        Ok(Capture {
            from_reserved,
            from_available,
        })
    }

    pub fn credit(&mut self, amount: Decimal, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(amount)?;
        self.available += amount;
        self.updated_at = now;
        Ok(())
    }

    pub fn debit(&mut self, amount: Decimal, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(amount)?;
        self.ensure_available(amount)?;
        self.available -= amount;
        self.updated_at = now;
        Ok(())
    }
}

/// Persisted column values of an [`Account`].
#[derive(Debug, Clone)]
pub struct AccountParts {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub role: AccountRole,
    pub status: AccountStatus,
    pub available: Decimal,
    pub reserved: Decimal,
    pub credit_limit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn ensure_positive(amount: Decimal) -> DomainResult<()> {
    if amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "amount must be positive, got {amount}"
        )))
    }
}

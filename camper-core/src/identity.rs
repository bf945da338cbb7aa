use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CoreError, CoreResult};

const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Opaque account identifier, taken from the authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(CoreError::ValidationError("account id must not be empty".to_string()));
        }
        if trimmed.len() > MAX_ACCOUNT_ID_LEN {
            return Err(CoreError::ValidationError(format!(
                "account id longer than {} characters",
                MAX_ACCOUNT_ID_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallerRole {
    Customer,
    /// Merchant / platform staff: confirms bookings, runs reconciliation.
    Operator,
}

impl CallerRole {
    pub fn parse(role: &str) -> CoreResult<Self> {
        match role {
            "CUSTOMER" => Ok(CallerRole::Customer),
            "OPERATOR" | "ADMIN" => Ok(CallerRole::Operator),
            other => Err(CoreError::IdentityError(format!("unknown role: {}", other))),
        }
    }
}

/// The resolved identity behind a request. Every engine operation takes one
/// explicitly; the engine keeps no ambient session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub account_id: AccountId,
    pub role: CallerRole,
}

impl Caller {
    pub fn customer(account_id: AccountId) -> Self {
        Self { account_id, role: CallerRole::Customer }
    }

    pub fn operator(account_id: AccountId) -> Self {
        Self { account_id, role: CallerRole::Operator }
    }

    /// Build a caller from verified token claims.
    pub fn from_claims(subject: &str, role: &str) -> CoreResult<Self> {
        let account_id = AccountId::new(subject)
            .map_err(|e| CoreError::IdentityError(e.to_string()))?;
        Ok(Self { account_id, role: CallerRole::parse(role)? })
    }

    pub fn is_operator(&self) -> bool {
        self.role == CallerRole::Operator
    }

    /// Customers may only act on their own resources; operators on any.
    pub fn can_act_for(&self, owner: &AccountId) -> bool {
        self.is_operator() || &self.account_id == owner
    }
}

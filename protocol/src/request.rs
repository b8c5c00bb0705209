use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::AccountId;

/// Identifier handed out when a request is enqueued on the cookie manager.
/// Completion events carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionRequestKind {
    AddAccount,
    LogOut,
    ListAccounts,
}

/// A session-mutating (or session-reading) operation waiting in the cookie
/// manager's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub id: RequestId,
    pub kind: SessionRequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

impl SessionRequest {
    pub fn add_account(id: RequestId, account_id: AccountId) -> Self {
        Self {
            id,
            kind: SessionRequestKind::AddAccount,
            account_id: Some(account_id),
        }
    }

    pub fn log_out(id: RequestId) -> Self {
        Self {
            id,
            kind: SessionRequestKind::LogOut,
            account_id: None,
        }
    }

    pub fn list_accounts(id: RequestId) -> Self {
        Self {
            id,
            kind: SessionRequestKind::ListAccounts,
            account_id: None,
        }
    }
}

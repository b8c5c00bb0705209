use serde::Deserialize;
use serde::Serialize;

use crate::AccountId;

/// One account present in the remote session cookie jar.
///
/// Lists of these keep the server-defined order: the first entry is the
/// account other remote services treat as the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedAccount {
    pub id: AccountId,
    /// `false` when the session for this account has expired and the
    /// account is only listed, not signed in.
    pub valid: bool,
}

impl ListedAccount {
    pub fn new(id: impl Into<AccountId>, valid: bool) -> Self {
        Self {
            id: id.into(),
            valid,
        }
    }

    pub fn valid(id: impl Into<AccountId>) -> Self {
        Self::new(id, true)
    }

    pub fn invalid(id: impl Into<AccountId>) -> Self {
        Self::new(id, false)
    }
}

/// A downstream service to probe before merging a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheckTarget {
    #[serde(rename = "carryBackToken")]
    pub token: String,
    pub url: String,
}

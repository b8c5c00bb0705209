use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// Identifier of an account at the remote identity service.
///
/// The local token store and the remote cookie jar spell the same account
/// differently (case, dots in the local part), so comparisons between the two
/// sources must go through [`AccountId::canonicalize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Stable comparison key for this account. Idempotent.
    pub fn canonicalize(&self) -> AccountId {
        AccountId(canonicalize_email(&self.0))
    }

    /// Whether both ids denote the same account once canonicalized.
    pub fn same_account(&self, other: &AccountId) -> bool {
        self.canonicalize() == other.canonicalize()
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lowercases the address and strips `.` separators from the local part.
///
/// Inputs without an `@` are only trimmed and lowercased, so the function is
/// defined for every string.
pub fn canonicalize_email(email: &str) -> String {
    let lowered = email.trim().to_lowercase();
    match lowered.rsplit_once('@') {
        Some((local, domain)) => {
            let local: String = local.chars().filter(|c| *c != '.').collect();
            format!("{local}@{domain}")
        }
        None => lowered,
    }
}

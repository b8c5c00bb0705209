use serde::Deserialize;
use serde::Serialize;

use crate::AccountId;
use crate::GaiaError;
use crate::ListedAccount;
use crate::RequestId;

/// Notifications delivered to cookie manager observers, exactly once per
/// terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CookieJarEvent {
    AddAccountCompleted {
        request_id: RequestId,
        account_id: AccountId,
        error: Option<GaiaError>,
    },
    LogOutCompleted {
        request_id: RequestId,
        error: Option<GaiaError>,
    },
    /// The remote account list was fetched (or the fetch failed for good).
    /// On error `accounts` is empty.
    AccountsInCookieUpdated {
        request_id: RequestId,
        accounts: Vec<ListedAccount>,
        error: Option<GaiaError>,
    },
}

impl CookieJarEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            CookieJarEvent::AddAccountCompleted { request_id, .. }
            | CookieJarEvent::LogOutCompleted { request_id, .. }
            | CookieJarEvent::AccountsInCookieUpdated { request_id, .. } => *request_id,
        }
    }

    pub fn error(&self) -> Option<&GaiaError> {
        match self {
            CookieJarEvent::AddAccountCompleted { error, .. }
            | CookieJarEvent::LogOutCompleted { error, .. }
            | CookieJarEvent::AccountsInCookieUpdated { error, .. } => error.as_ref(),
        }
    }
}

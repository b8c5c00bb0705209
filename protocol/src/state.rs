use serde::Deserialize;
use serde::Serialize;

/// Phase of the account reconcilor. One per profile.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileState {
    #[default]
    NotReconciling,
    /// The last pass ended with a failure; the next trigger starts over.
    Error,
    /// Waiting for the remote account list.
    GatheringInformation,
    /// Merge / log-out requests for this pass are draining.
    ApplyingChanges,
}

impl ReconcileState {
    pub fn is_reconciling(self) -> bool {
        matches!(
            self,
            ReconcileState::GatheringInformation | ReconcileState::ApplyingChanges
        )
    }
}

/// What started a reconciliation pass.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileTrigger {
    Startup,
    Manual,
    SignedIn,
    TokensChanged,
    CookieSettingChanged,
    CookieJarChanged,
    FollowUp,
}

/// Outcome of one finished (or failed) reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub trigger: ReconcileTrigger,
    pub first_run: bool,
    pub primary_mismatch: bool,
    /// Accounts merged into the jar because they were missing or expired.
    /// A rebuild re-adds everything but only counts the missing ones here.
    pub added_to_cookie: usize,
    /// Jar accounts the local profile no longer knows.
    pub removed_from_cookie: usize,
    pub rebuilt_cookie: bool,
    pub failed: bool,
}

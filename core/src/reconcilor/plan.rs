//! Decides which session requests bring the cookie jar in line with the
//! local account set.

use std::collections::HashSet;

use reconcilor_protocol::AccountId;
use reconcilor_protocol::ListedAccount;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// The jar's first account is not the primary account.
    pub primary_mismatch: bool,
    /// Jar entries (valid or expired) with no local counterpart.
    pub removed_from_cookie: Vec<AccountId>,
    /// Local accounts absent from the jar or only present as expired.
    pub missing_from_cookie: Vec<AccountId>,
    /// Clear the whole jar before adding anything.
    pub log_out_first: bool,
    /// Accounts to merge, in order.
    pub add_to_cookie: Vec<AccountId>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        !self.log_out_first && self.add_to_cookie.is_empty()
    }
}

/// Computes the requests for one pass.
///
/// Any removal or primary mismatch rebuilds the jar: log out, then add the
/// primary account followed by the other local accounts in token store
/// order. Otherwise only the missing accounts are added, still primary
/// first so an empty jar ends up with the primary in front.
pub fn plan_reconcile(
    primary: Option<&AccountId>,
    local_accounts: &[AccountId],
    gaia_accounts: &[ListedAccount],
) -> ReconcilePlan {
    let primary = primary.filter(|primary| !primary.is_empty());
    if primary.is_none() && gaia_accounts.is_empty() {
        return ReconcilePlan::default();
    }

    let mut seen = HashSet::new();
    let local: Vec<(&AccountId, AccountId)> = local_accounts
        .iter()
        .filter(|id| !id.is_empty())
        .map(|id| (id, id.canonicalize()))
        .filter(|(_, canonical)| seen.insert(canonical.clone()))
        .collect();
    let local_canonical: HashSet<&AccountId> = local.iter().map(|(_, canonical)| canonical).collect();

    let primary_mismatch = match (primary, gaia_accounts.first()) {
        (Some(primary), Some(first)) => !first.id.same_account(primary),
        _ => false,
    };

    let mut removed_seen = HashSet::new();
    let removed_from_cookie: Vec<AccountId> = gaia_accounts
        .iter()
        .map(|account| account.id.canonicalize())
        .filter(|canonical| !local_canonical.contains(canonical))
        .filter(|canonical| removed_seen.insert(canonical.clone()))
        .collect();

    let valid_in_cookie: HashSet<AccountId> = gaia_accounts
        .iter()
        .filter(|account| account.valid)
        .map(|account| account.id.canonicalize())
        .collect();
    let missing: Vec<&(&AccountId, AccountId)> = local
        .iter()
        .filter(|(_, canonical)| !valid_in_cookie.contains(canonical))
        .collect();
    let missing_from_cookie: Vec<AccountId> = missing.iter().map(|(id, _)| (*id).clone()).collect();

    let log_out_first = primary_mismatch || !removed_from_cookie.is_empty();
    let primary_canonical = primary.map(AccountId::canonicalize);
    let add_to_cookie = if log_out_first {
        primary_first(local.iter(), primary_canonical.as_ref())
    } else {
        primary_first(missing.into_iter(), primary_canonical.as_ref())
    };

    ReconcilePlan {
        primary_mismatch,
        removed_from_cookie,
        missing_from_cookie,
        log_out_first,
        add_to_cookie,
    }
}

/// The primary account (if listed) followed by the rest in their given order.
fn primary_first<'a, 'b: 'a>(
    accounts: impl Iterator<Item = &'a (&'b AccountId, AccountId)>,
    primary: Option<&AccountId>,
) -> Vec<AccountId> {
    let (first, rest): (Vec<_>, Vec<_>) =
        accounts.partition(|(_, canonical)| Some(canonical) == primary);
    first
        .into_iter()
        .chain(rest)
        .map(|(id, _)| (*id).clone())
        .collect()
}

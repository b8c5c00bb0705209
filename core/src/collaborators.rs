//! Services owned by the embedding profile that the reconcilor only reads
//! from or listens to.

use reconcilor_protocol::AccountId;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenServiceEvent {
    /// A batch of credential changes finished; the account set may differ.
    AccountsChanged,
}

/// Local store of long-lived credentials.
pub trait TokenService: Send + Sync {
    /// Accounts with a credential, in the store's iteration order.
    fn accounts(&self) -> Vec<AccountId>;

    /// The profile's authenticated user, if any.
    fn primary_account(&self) -> Option<AccountId>;

    fn credential(&self, account_id: &AccountId) -> Option<String>;

    fn subscribe(&self) -> broadcast::Receiver<TokenServiceEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigninEvent {
    SignedIn(AccountId),
    SignedOut(AccountId),
}

pub trait SigninManager: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<SigninEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettingChange {
    /// Domain the changed rule applies to; `None` for a rule that matches
    /// every domain.
    pub domain: Option<String>,
}

impl CookieSettingChange {
    /// Whether the changed rule covers `host`. A rule for a parent domain
    /// covers all of its subdomains.
    pub fn applies_to(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(changed) => domain_matches(host, changed),
        }
    }
}

/// Whether `host` is `pattern` or one of its subdomains. A leading `.` or
/// `[*.]` on the pattern is accepted and means the same thing.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.strip_prefix("[*.]").unwrap_or(pattern);
    let pattern = pattern.trim_start_matches('.').to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    let host = host.to_ascii_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

pub trait CookieSettings: Send + Sync {
    fn are_session_cookies_allowed(&self, domain: &str) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<CookieSettingChange>;
}

/// A cookie was set or removed by anyone, including code outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieChange {
    pub domain: String,
    pub name: String,
    pub removed: bool,
}

impl CookieChange {
    /// Whether this change touches cookie `name` visible on `host`.
    pub fn matches(&self, host: &str, name: &str) -> bool {
        if self.name != name {
            return false;
        }
        domain_matches(host, &self.domain)
    }
}

pub trait CookieStore: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<CookieChange>;
}

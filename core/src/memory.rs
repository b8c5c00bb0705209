//! In-memory collaborators for embedders without their own token store or
//! cookie settings, and for tests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use reconcilor_protocol::AccountId;
use tokio::sync::broadcast;

use crate::collaborators::CookieChange;
use crate::collaborators::CookieSettingChange;
use crate::collaborators::CookieSettings;
use crate::collaborators::CookieStore;
use crate::collaborators::SigninEvent;
use crate::collaborators::SigninManager;
use crate::collaborators::TokenService;
use crate::collaborators::TokenServiceEvent;
use crate::collaborators::domain_matches;
use crate::config::ProfileToml;

const EVENT_CAPACITY: usize = 64;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

#[derive(Default)]
struct TokenState {
    primary: Option<AccountId>,
    accounts: Vec<(AccountId, String)>,
}

pub struct InMemoryTokenService {
    state: RwLock<TokenState>,
    tx: broadcast::Sender<TokenServiceEvent>,
}

impl InMemoryTokenService {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(TokenState::default()),
            tx,
        }
    }

    pub fn from_profile(profile: &ProfileToml) -> Self {
        let service = Self::new();
        {
            let mut state = write(&service.state);
            state.primary = profile.primary_account.as_deref().map(AccountId::from);
            state.accounts = profile
                .accounts
                .iter()
                .map(|account| (AccountId::new(&account.id), account.credential.clone()))
                .collect();
        }
        service
    }

    /// Changes the authenticated user without announcing a batch change;
    /// sign-in and sign-out are announced by the signin manager instead.
    pub fn set_primary_account(&self, account_id: Option<AccountId>) {
        write(&self.state).primary = account_id;
    }

    /// Adds or replaces the credential for `account_id`.
    pub fn update_credentials(&self, account_id: AccountId, credential: impl Into<String>) {
        let credential = credential.into();
        {
            let mut state = write(&self.state);
            match state.accounts.iter_mut().find(|(id, _)| *id == account_id) {
                Some((_, existing)) => *existing = credential,
                None => state.accounts.push((account_id, credential)),
            }
        }
        let _ = self.tx.send(TokenServiceEvent::AccountsChanged);
    }

    pub fn revoke_credentials(&self, account_id: &AccountId) {
        write(&self.state).accounts.retain(|(id, _)| id != account_id);
        let _ = self.tx.send(TokenServiceEvent::AccountsChanged);
    }

    pub fn revoke_all_credentials(&self) {
        write(&self.state).accounts.clear();
        let _ = self.tx.send(TokenServiceEvent::AccountsChanged);
    }
}

impl Default for InMemoryTokenService {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenService for InMemoryTokenService {
    fn accounts(&self) -> Vec<AccountId> {
        read(&self.state)
            .accounts
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn primary_account(&self) -> Option<AccountId> {
        read(&self.state).primary.clone()
    }

    fn credential(&self, account_id: &AccountId) -> Option<String> {
        read(&self.state)
            .accounts
            .iter()
            .find(|(id, _)| id == account_id)
            .map(|(_, credential)| credential.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<TokenServiceEvent> {
        self.tx.subscribe()
    }
}

pub struct InMemorySigninManager {
    tx: broadcast::Sender<SigninEvent>,
}

impl InMemorySigninManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn sign_in(&self, account_id: AccountId) {
        let _ = self.tx.send(SigninEvent::SignedIn(account_id));
    }

    pub fn sign_out(&self, account_id: AccountId) {
        let _ = self.tx.send(SigninEvent::SignedOut(account_id));
    }
}

impl Default for InMemorySigninManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SigninManager for InMemorySigninManager {
    fn subscribe(&self) -> broadcast::Receiver<SigninEvent> {
        self.tx.subscribe()
    }
}

/// Session cookie rules: one default plus per-domain overrides.
pub struct InMemoryCookieSettings {
    default_allowed: AtomicBool,
    per_domain: RwLock<HashMap<String, bool>>,
    tx: broadcast::Sender<CookieSettingChange>,
}

impl InMemoryCookieSettings {
    pub fn new(default_allowed: bool) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            default_allowed: AtomicBool::new(default_allowed),
            per_domain: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// `domain == None` changes the default rule for every domain.
    pub fn set_session_cookies_allowed(&self, domain: Option<&str>, allowed: bool) {
        match domain {
            None => self.default_allowed.store(allowed, Ordering::SeqCst),
            Some(domain) => {
                let pattern = domain.strip_prefix("[*.]").unwrap_or(domain);
                let pattern = pattern.trim_start_matches('.').to_ascii_lowercase();
                write(&self.per_domain).insert(pattern, allowed);
            }
        }
        let _ = self.tx.send(CookieSettingChange {
            domain: domain.map(str::to_string),
        });
    }
}

impl Default for InMemoryCookieSettings {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CookieSettings for InMemoryCookieSettings {
    /// The most specific rule covering `domain` wins.
    fn are_session_cookies_allowed(&self, domain: &str) -> bool {
        read(&self.per_domain)
            .iter()
            .filter(|(pattern, _)| domain_matches(domain, pattern))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, allowed)| *allowed)
            .unwrap_or_else(|| self.default_allowed.load(Ordering::SeqCst))
    }

    fn subscribe(&self) -> broadcast::Receiver<CookieSettingChange> {
        self.tx.subscribe()
    }
}

pub struct InMemoryCookieStore {
    tx: broadcast::Sender<CookieChange>,
}

impl InMemoryCookieStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn record_change(&self, change: CookieChange) {
        let _ = self.tx.send(change);
    }
}

impl Default for InMemoryCookieStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieStore for InMemoryCookieStore {
    fn subscribe(&self) -> broadcast::Receiver<CookieChange> {
        self.tx.subscribe()
    }
}

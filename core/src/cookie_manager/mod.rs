//! Serialized executor for session cookie mutations.
//!
//! [`GaiaCookieManager`] is a handle onto a task that owns the request queue.
//! Requests run strictly one at a time in submission order; network calls
//! are spawned and report back to the queue task, so the queue itself is only
//! ever touched from one place.

mod external_cc;

pub use external_cc::ExternalCcResultFetcher;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reconcilor_gaia_api::GaiaClient;
use reconcilor_protocol::AccountId;
use reconcilor_protocol::CookieJarEvent;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use reconcilor_protocol::RequestId;
use reconcilor_protocol::SessionRequest;
use reconcilor_protocol::SessionRequestKind;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use crate::backoff::BackoffEntry;
use crate::collaborators::CookieChange;
use crate::collaborators::CookieSettings;
use crate::collaborators::CookieStore;
use crate::collaborators::TokenService;
use crate::config::ReconcilorConfig;
use crate::error::ReconcilorErr;
use crate::error::Result;
use crate::observers::ObserverId;
use crate::observers::ObserverList;
use crate::util::next_event;

/// Stand-in deadline for "no retry scheduled".
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug)]
enum Op {
    Enqueue(SessionRequest),
    Shutdown,
}

#[derive(Default)]
struct AccountsCache {
    accounts: Vec<ListedAccount>,
    fresh: bool,
}

/// State readable from the handle without a round trip through the queue.
struct Shared {
    next_id: AtomicU64,
    accounts: RwLock<AccountsCache>,
    /// Submitted requests whose terminal notification has not gone out yet.
    unresolved: AtomicUsize,
    shut_down: AtomicBool,
}

impl Shared {
    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn resolve(&self, count: usize) {
        let _ = self
            .unresolved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                Some(pending.saturating_sub(count))
            });
    }

    fn set_accounts_stale(&self) {
        match self.accounts.write() {
            Ok(mut cache) => cache.fresh = false,
            Err(err) => err.into_inner().fresh = false,
        }
    }

    fn store_accounts(&self, accounts: Vec<ListedAccount>) {
        let mut cache = match self.accounts.write() {
            Ok(cache) => cache,
            Err(err) => err.into_inner(),
        };
        cache.accounts = accounts;
        cache.fresh = true;
    }

    fn fresh_accounts(&self) -> Option<Vec<ListedAccount>> {
        let cache = match self.accounts.read() {
            Ok(cache) => cache,
            Err(err) => err.into_inner(),
        };
        cache.fresh.then(|| cache.accounts.clone())
    }
}

/// Session request service for one profile.
pub struct GaiaCookieManager {
    tx_op: mpsc::UnboundedSender<Op>,
    shared: Arc<Shared>,
    observers: Arc<ObserverList<CookieJarEvent>>,
}

impl GaiaCookieManager {
    /// Starts the queue task. Must be called from within a Tokio runtime.
    pub fn spawn(
        config: &ReconcilorConfig,
        gaia: Arc<dyn GaiaClient>,
        token_service: Arc<dyn TokenService>,
        cookie_settings: Arc<dyn CookieSettings>,
        cookie_store: &dyn CookieStore,
    ) -> Self {
        let (tx_op, rx_op) = mpsc::unbounded_channel();
        let (tx_done, rx_done) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            accounts: RwLock::new(AccountsCache::default()),
            unresolved: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });
        let observers = Arc::new(ObserverList::new());
        let fetcher = Arc::new(ExternalCcResultFetcher::new(
            Arc::clone(&gaia),
            config.external_cc_timeout,
        ));

        let queue = RequestQueue {
            gaia,
            token_service,
            cookie_settings,
            cookie_domain: config.cookie_domain.clone(),
            session_cookie_name: config.session_cookie_name.clone(),
            max_retries: config.max_retries,
            ubertoken_max_age: config.ubertoken_max_age,
            shared: Arc::clone(&shared),
            observers: Arc::clone(&observers),
            fetcher,
            jobs: VecDeque::new(),
            head: HeadState::Idle,
            retries: 0,
            ubertoken: None,
            backoff: BackoffEntry::new(config.backoff),
            tx_done,
        };
        let span = info_span!("cookie_manager", domain = %config.cookie_domain);
        tokio::spawn(
            queue
                .run(rx_op, rx_done, Some(cookie_store.subscribe()))
                .instrument(span),
        );

        Self {
            tx_op,
            shared,
            observers,
        }
    }

    /// Queues a merge of `account_id` into the session cookie jar.
    ///
    /// If session cookies are disallowed for the identity domain the request
    /// completes right away with [`GaiaError::RequestCanceled`].
    pub fn add_account_to_cookie(&self, account_id: AccountId) -> Result<RequestId> {
        let id = self.shared.next_request_id();
        self.submit(SessionRequest::add_account(id, account_id))?;
        Ok(id)
    }

    /// Queues a log-out of every account. Pending (not yet started) adds are
    /// canceled; a log-out that is already queued or running absorbs this
    /// one and both ids complete together.
    pub fn log_out_all_accounts(&self) -> Result<RequestId> {
        let id = self.shared.next_request_id();
        self.submit(SessionRequest::log_out(id))?;
        Ok(id)
    }

    /// Returns the cached account list if it is fresh. Otherwise schedules a
    /// fetch (at most one is ever queued) and returns `None`; the list then
    /// arrives as [`CookieJarEvent::AccountsInCookieUpdated`].
    pub fn list_accounts(&self) -> Result<Option<Vec<ListedAccount>>> {
        self.ensure_running()?;
        if let Some(accounts) = self.shared.fresh_accounts() {
            return Ok(Some(accounts));
        }
        let id = self.shared.next_request_id();
        self.submit(SessionRequest::list_accounts(id))?;
        Ok(None)
    }

    pub fn add_observer(&self) -> (ObserverId, mpsc::UnboundedReceiver<CookieJarEvent>) {
        self.observers.add_observer()
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    /// Whether any submitted request is still waiting for its outcome.
    pub fn is_running(&self) -> bool {
        self.shared.unresolved.load(Ordering::SeqCst) > 0
    }

    /// Stops queue processing. A request already on the wire is left to
    /// finish, but its result is dropped and no observer hears about it.
    pub fn shutdown(&self) {
        if !self.shared.shut_down.swap(true, Ordering::SeqCst) {
            let _ = self.tx_op.send(Op::Shutdown);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(ReconcilorErr::CookieManagerShutDown);
        }
        Ok(())
    }

    fn submit(&self, request: SessionRequest) -> Result<()> {
        self.ensure_running()?;
        self.shared.unresolved.fetch_add(1, Ordering::SeqCst);
        if self.tx_op.send(Op::Enqueue(request)).is_err() {
            self.shared.resolve(1);
            return Err(ReconcilorErr::CookieManagerShutDown);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobKind {
    AddAccount(AccountId),
    LogOut,
    ListAccounts,
}

#[derive(Debug)]
struct Job {
    id: RequestId,
    kind: JobKind,
    /// Requests collapsed into this one; they complete with it.
    aliases: Vec<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ubertoken,
    MergeSession,
    ListAccounts,
    LogOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Idle,
    InFlight(Phase),
    RetryScheduled { phase: Phase, at: Instant },
}

enum PhaseResult {
    Ubertoken(std::result::Result<String, GaiaError>),
    MergeSession(std::result::Result<(), GaiaError>),
    ListAccounts(std::result::Result<Vec<ListedAccount>, GaiaError>),
    LogOut(std::result::Result<(), GaiaError>),
}

struct Completion {
    request_id: RequestId,
    result: PhaseResult,
}

struct RequestQueue {
    gaia: Arc<dyn GaiaClient>,
    token_service: Arc<dyn TokenService>,
    cookie_settings: Arc<dyn CookieSettings>,
    cookie_domain: String,
    session_cookie_name: String,
    max_retries: u32,
    ubertoken_max_age: Duration,
    shared: Arc<Shared>,
    observers: Arc<ObserverList<CookieJarEvent>>,
    fetcher: Arc<ExternalCcResultFetcher>,
    jobs: VecDeque<Job>,
    /// Progress of `jobs.front()`.
    head: HeadState,
    /// Transient failures of the current head job.
    retries: u32,
    ubertoken: Option<(String, Instant)>,
    backoff: BackoffEntry,
    tx_done: mpsc::UnboundedSender<Completion>,
}

impl RequestQueue {
    async fn run(
        mut self,
        mut rx_op: mpsc::UnboundedReceiver<Op>,
        mut rx_done: mpsc::UnboundedReceiver<Completion>,
        mut cookie_rx: Option<broadcast::Receiver<CookieChange>>,
    ) {
        loop {
            let retry_at = match self.head {
                HeadState::RetryScheduled { at, .. } => Some(at),
                HeadState::Idle | HeadState::InFlight(_) => None,
            };
            let timer_deadline = retry_at.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

            tokio::select! {
                op = rx_op.recv() => match op {
                    Some(Op::Enqueue(request)) => self.enqueue(request),
                    Some(Op::Shutdown) | None => break,
                },
                Some(done) = rx_done.recv() => self.on_completion(done),
                change = next_event(&mut cookie_rx) => self.on_cookie_change(&change),
                _ = sleep_until(timer_deadline), if retry_at.is_some() => self.on_retry_timer(),
            }
        }

        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.shared.unresolved.store(0, Ordering::SeqCst);
        info!(dropped = self.jobs.len(), "cookie manager stopped");
    }

    fn enqueue(&mut self, request: SessionRequest) {
        let SessionRequest {
            id,
            kind,
            account_id,
        } = request;
        debug!(request_id = %id, %kind, "session request submitted");

        match (kind, account_id) {
            (SessionRequestKind::AddAccount, Some(account_id)) => {
                if !self
                    .cookie_settings
                    .are_session_cookies_allowed(&self.cookie_domain)
                {
                    info!(request_id = %id, %account_id, "session cookies disallowed; add canceled");
                    self.shared.resolve(1);
                    self.observers.notify(&CookieJarEvent::AddAccountCompleted {
                        request_id: id,
                        account_id,
                        error: Some(GaiaError::RequestCanceled),
                    });
                    return;
                }
                self.push(id, JobKind::AddAccount(account_id));
            }
            (SessionRequestKind::AddAccount, None) => {
                warn!(request_id = %id, "add request without an account dropped");
                self.shared.resolve(1);
            }
            (SessionRequestKind::LogOut, _) => self.enqueue_log_out(id),
            (SessionRequestKind::ListAccounts, _) => {
                if let Some(queued) = self
                    .jobs
                    .iter_mut()
                    .find(|job| job.kind == JobKind::ListAccounts)
                {
                    debug!(request_id = %id, into = %queued.id, "list request collapsed");
                    queued.aliases.push(id);
                    return;
                }
                self.push(id, JobKind::ListAccounts);
            }
        }
    }

    fn enqueue_log_out(&mut self, id: RequestId) {
        // The head is already running and is kept; queued adds behind it are
        // dropped since the log-out would undo them anyway.
        let mut canceled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.jobs.len() + 1);
        for (index, job) in self.jobs.drain(..).enumerate() {
            if index > 0 && matches!(job.kind, JobKind::AddAccount(_)) {
                canceled.push(job);
            } else {
                kept.push_back(job);
            }
        }
        self.jobs = kept;

        match self
            .jobs
            .iter_mut()
            .find(|job| job.kind == JobKind::LogOut)
        {
            Some(queued) => {
                debug!(request_id = %id, into = %queued.id, "log-out collapsed");
                queued.aliases.push(id);
            }
            None => self.push(id, JobKind::LogOut),
        }

        for job in canceled {
            self.shared.resolve(1 + job.aliases.len());
            if let JobKind::AddAccount(account_id) = job.kind {
                info!(request_id = %job.id, %account_id, "pending add canceled by log-out");
                self.observers.notify(&CookieJarEvent::AddAccountCompleted {
                    request_id: job.id,
                    account_id,
                    error: Some(GaiaError::RequestCanceled),
                });
            }
        }
    }

    fn push(&mut self, id: RequestId, kind: JobKind) {
        self.jobs.push_back(Job {
            id,
            kind,
            aliases: Vec::new(),
        });
        if self.jobs.len() == 1 {
            self.start_head();
        }
    }

    fn start_head(&mut self) {
        let phase = match self.jobs.front().map(|job| &job.kind) {
            Some(JobKind::AddAccount(_)) => Phase::Ubertoken,
            Some(JobKind::LogOut) => Phase::LogOut,
            Some(JobKind::ListAccounts) => Phase::ListAccounts,
            None => {
                self.head = HeadState::Idle;
                return;
            }
        };
        self.run_phase(phase);
    }

    fn run_phase(&mut self, phase: Phase) {
        let Some(job) = self.jobs.front() else {
            self.head = HeadState::Idle;
            return;
        };
        let request_id = job.id;
        let gaia = Arc::clone(&self.gaia);

        match (phase, job.kind.clone()) {
            (Phase::Ubertoken, JobKind::AddAccount(account_id)) => {
                let Some(credential) = self.token_service.credential(&account_id) else {
                    warn!(%request_id, %account_id, "no local credential for account");
                    self.complete_head(
                        Some(GaiaError::InvalidCredentials(format!(
                            "no credential for {account_id}"
                        ))),
                        Vec::new(),
                    );
                    return;
                };
                self.spawn_phase(request_id, async move {
                    PhaseResult::Ubertoken(
                        gaia.exchange_for_session_token(&account_id, &credential)
                            .await,
                    )
                });
            }
            (Phase::MergeSession, JobKind::AddAccount(account_id)) => {
                let Some(ubertoken) = self.fresh_ubertoken() else {
                    debug!(%request_id, "ubertoken missing or stale; exchanging again");
                    self.run_phase(Phase::Ubertoken);
                    return;
                };
                let fetcher = Arc::clone(&self.fetcher);
                self.spawn_phase(request_id, async move {
                    if fetcher.is_running() {
                        fetcher.wait_until_done().await;
                    }
                    let external_cc_result = fetcher.result();
                    PhaseResult::MergeSession(
                        gaia.merge_session(&account_id, &ubertoken, &external_cc_result)
                            .await,
                    )
                });
            }
            (Phase::LogOut, JobKind::LogOut) => {
                self.spawn_phase(request_id, async move {
                    PhaseResult::LogOut(gaia.log_out().await)
                });
            }
            (Phase::ListAccounts, JobKind::ListAccounts) => {
                self.spawn_phase(request_id, async move {
                    PhaseResult::ListAccounts(gaia.list_accounts().await)
                });
            }
            (phase, kind) => {
                warn!(%request_id, ?phase, ?kind, "phase does not apply to request");
                self.complete_head(
                    Some(GaiaError::ServiceError(format!(
                        "{phase:?} does not apply to {kind:?}"
                    ))),
                    Vec::new(),
                );
                return;
            }
        }
        self.head = HeadState::InFlight(phase);
    }

    fn spawn_phase<F>(&self, request_id: RequestId, call: F)
    where
        F: Future<Output = PhaseResult> + Send + 'static,
    {
        let tx_done = self.tx_done.clone();
        tokio::spawn(async move {
            let result = call.await;
            // Dropped when the queue has shut down in the meantime.
            let _ = tx_done.send(Completion { request_id, result });
        });
    }

    fn fresh_ubertoken(&self) -> Option<String> {
        let (token, obtained_at) = self.ubertoken.as_ref()?;
        (obtained_at.elapsed() <= self.ubertoken_max_age).then(|| token.clone())
    }

    fn on_completion(&mut self, done: Completion) {
        let Some(job) = self.jobs.front() else {
            debug!(request_id = %done.request_id, "completion with empty queue ignored");
            return;
        };
        if job.id != done.request_id || !matches!(self.head, HeadState::InFlight(_)) {
            debug!(request_id = %done.request_id, "stale completion ignored");
            return;
        }
        let request_id = job.id;

        match done.result {
            PhaseResult::Ubertoken(Ok(token)) => {
                self.ubertoken = Some((token, Instant::now()));
                self.fetcher.start();
                self.run_phase(Phase::MergeSession);
            }
            PhaseResult::Ubertoken(Err(err)) => {
                // A rejected credential will not get better by waiting.
                warn!(%request_id, "ubertoken exchange failed: {err}");
                self.complete_head(Some(err), Vec::new());
            }
            PhaseResult::MergeSession(Ok(())) | PhaseResult::LogOut(Ok(())) => {
                self.backoff.inform_of_request(true);
                self.shared.set_accounts_stale();
                self.complete_head(None, Vec::new());
            }
            PhaseResult::ListAccounts(Ok(accounts)) => {
                self.backoff.inform_of_request(true);
                self.shared.store_accounts(accounts.clone());
                self.complete_head(None, accounts);
            }
            PhaseResult::MergeSession(Err(err)) => self.retry_or_fail(Phase::MergeSession, err),
            PhaseResult::LogOut(Err(err)) => self.retry_or_fail(Phase::LogOut, err),
            PhaseResult::ListAccounts(Err(err)) => self.retry_or_fail(Phase::ListAccounts, err),
        }
    }

    fn retry_or_fail(&mut self, phase: Phase, err: GaiaError) {
        let request_id = self.jobs.front().map(|job| job.id);
        if err.is_transient() && self.retries < self.max_retries {
            self.retries += 1;
            self.backoff.inform_of_request(false);
            let delay = self.backoff.time_until_release();
            info!(
                request_id = ?request_id,
                ?phase,
                attempt = self.retries,
                delay_ms = delay.as_millis() as u64,
                "transient failure, retrying: {err}"
            );
            self.head = HeadState::RetryScheduled {
                phase,
                at: Instant::now() + delay,
            };
        } else {
            warn!(request_id = ?request_id, ?phase, retries = self.retries, "request failed: {err}");
            self.complete_head(Some(err), Vec::new());
        }
    }

    fn on_retry_timer(&mut self) {
        if let HeadState::RetryScheduled { phase, .. } = self.head {
            self.run_phase(phase);
        }
    }

    fn on_cookie_change(&mut self, change: &CookieChange) {
        if !change.matches(&self.cookie_domain, &self.session_cookie_name) {
            return;
        }
        debug!(name = %change.name, removed = change.removed, "session cookie changed outside the queue");
        self.shared.set_accounts_stale();
        let id = self.shared.next_request_id();
        self.shared.unresolved.fetch_add(1, Ordering::SeqCst);
        self.enqueue(SessionRequest::list_accounts(id));
    }

    /// Pops the head job, notifies its observers, then starts the next job.
    fn complete_head(&mut self, error: Option<GaiaError>, accounts: Vec<ListedAccount>) {
        let Some(job) = self.jobs.pop_front() else {
            return;
        };
        self.head = HeadState::Idle;
        self.retries = 0;
        self.ubertoken = None;
        self.shared.resolve(1 + job.aliases.len());
        info!(request_id = %job.id, kind = ?job.kind, error = ?error, "session request completed");

        match job.kind {
            JobKind::AddAccount(account_id) => {
                self.observers.notify(&CookieJarEvent::AddAccountCompleted {
                    request_id: job.id,
                    account_id,
                    error,
                });
            }
            JobKind::LogOut => {
                for request_id in std::iter::once(job.id).chain(job.aliases) {
                    self.observers.notify(&CookieJarEvent::LogOutCompleted {
                        request_id,
                        error: error.clone(),
                    });
                }
            }
            JobKind::ListAccounts => {
                self.observers.notify(&CookieJarEvent::AccountsInCookieUpdated {
                    request_id: job.id,
                    accounts,
                    error,
                });
            }
        }

        self.start_head();
    }
}

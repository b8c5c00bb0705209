//! Keeps the remote session cookie jar consistent with the profile's local
//! accounts.
//!
//! A pass gathers the jar's account list through the cookie manager, diffs it
//! against the token store with [`plan_reconcile`], queues the resulting
//! requests and waits for all of them to complete.

mod plan;

pub use plan::ReconcilePlan;
pub use plan::plan_reconcile;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use reconcilor_protocol::CookieJarEvent;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use reconcilor_protocol::PassSummary;
use reconcilor_protocol::ReconcileState;
use reconcilor_protocol::ReconcileTrigger;
use reconcilor_protocol::RequestId;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use crate::collaborators::CookieSettingChange;
use crate::collaborators::CookieSettings;
use crate::collaborators::SigninEvent;
use crate::collaborators::SigninManager;
use crate::collaborators::TokenService;
use crate::collaborators::TokenServiceEvent;
use crate::config::ReconcilorConfig;
use crate::cookie_manager::GaiaCookieManager;
use crate::error::ReconcilorErr;
use crate::error::Result;
use crate::observers::ObserverId;
use crate::util::next_event;

/// Snapshot published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilorStatus {
    pub state: ReconcileState,
    pub last_pass: Option<PassSummary>,
    pub passes_completed: u64,
}

#[derive(Debug)]
enum Op {
    StartReconcile(ReconcileTrigger),
    Shutdown,
}

/// Handle onto the reconcilor task of one profile.
pub struct AccountReconcilor {
    tx_op: mpsc::UnboundedSender<Op>,
    status: watch::Receiver<ReconcilorStatus>,
    registered_with_token_service: Arc<AtomicBool>,
}

impl AccountReconcilor {
    /// Starts the reconcilor task. Must be called from within a Tokio runtime.
    ///
    /// A profile that is already signed in is registered with the token
    /// store right away and, with `reconcile_on_startup`, gets a first pass.
    pub fn spawn(
        config: &ReconcilorConfig,
        cookie_manager: Arc<GaiaCookieManager>,
        token_service: Arc<dyn TokenService>,
        signin_manager: &dyn SigninManager,
        cookie_settings: Arc<dyn CookieSettings>,
    ) -> Self {
        let (tx_op, rx_op) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ReconcilorStatus::default());
        let registered = Arc::new(AtomicBool::new(false));
        let (observer_id, jar_rx) = cookie_manager.add_observer();

        let signed_in = token_service.primary_account().is_some();
        let token_rx = signed_in.then(|| token_service.subscribe());
        registered.store(signed_in, Ordering::SeqCst);

        let controller = Controller {
            cookie_manager,
            token_service,
            cookie_settings,
            cookie_domain: config.cookie_domain.clone(),
            status_tx,
            registered: Arc::clone(&registered),
            observer_id,
            pass: None,
        };
        let inputs = Inputs {
            rx_op,
            jar_rx,
            token_rx,
            signin_rx: Some(signin_manager.subscribe()),
            settings_rx: Some(controller.cookie_settings.subscribe()),
        };
        if signed_in && config.reconcile_on_startup {
            let _ = tx_op.send(Op::StartReconcile(ReconcileTrigger::Startup));
        }
        let span = info_span!("account_reconcilor", domain = %config.cookie_domain);
        tokio::spawn(controller.run(inputs).instrument(span));

        Self {
            tx_op,
            status,
            registered_with_token_service: registered,
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.status.borrow().state
    }

    pub fn last_pass(&self) -> Option<PassSummary> {
        self.status.borrow().last_pass.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReconcilorStatus> {
        self.status.clone()
    }

    /// Whether token store batch changes currently trigger passes. True while
    /// the profile is signed in.
    pub fn is_registered_with_token_service(&self) -> bool {
        self.registered_with_token_service.load(Ordering::SeqCst)
    }

    /// Asks for a pass. Collapses into a pass that is still gathering and
    /// schedules one follow-up pass if the current one is applying changes.
    pub fn start_reconcile(&self) -> Result<()> {
        self.tx_op
            .send(Op::StartReconcile(ReconcileTrigger::Manual))
            .map_err(|_| ReconcilorErr::ReconcilorShutDown)
    }

    pub fn shutdown(&self) {
        let _ = self.tx_op.send(Op::Shutdown);
    }
}

struct Inputs {
    rx_op: mpsc::UnboundedReceiver<Op>,
    jar_rx: mpsc::UnboundedReceiver<CookieJarEvent>,
    token_rx: Option<broadcast::Receiver<TokenServiceEvent>>,
    signin_rx: Option<broadcast::Receiver<SigninEvent>>,
    settings_rx: Option<broadcast::Receiver<CookieSettingChange>>,
}

enum Input {
    Op(Option<Op>),
    CookieJar(CookieJarEvent),
    TokensChanged,
    Signin(SigninEvent),
    CookieSetting(CookieSettingChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassPhase {
    GatheringInformation,
    ApplyingChanges,
}

/// Working state of the pass in progress.
#[derive(Debug)]
struct Pass {
    trigger: ReconcileTrigger,
    phase: PassPhase,
    outstanding: HashSet<RequestId>,
    primary_mismatch: bool,
    added_to_cookie: usize,
    removed_from_cookie: usize,
    rebuilt_cookie: bool,
    failed: bool,
    follow_up: Option<ReconcileTrigger>,
}

impl Pass {
    fn new(trigger: ReconcileTrigger) -> Self {
        Self {
            trigger,
            phase: PassPhase::GatheringInformation,
            outstanding: HashSet::new(),
            primary_mismatch: false,
            added_to_cookie: 0,
            removed_from_cookie: 0,
            rebuilt_cookie: false,
            failed: false,
            follow_up: None,
        }
    }
}

struct Controller {
    cookie_manager: Arc<GaiaCookieManager>,
    token_service: Arc<dyn TokenService>,
    cookie_settings: Arc<dyn CookieSettings>,
    cookie_domain: String,
    status_tx: watch::Sender<ReconcilorStatus>,
    registered: Arc<AtomicBool>,
    observer_id: ObserverId,
    pass: Option<Pass>,
}

impl Controller {
    async fn run(mut self, mut inputs: Inputs) {
        loop {
            let input = tokio::select! {
                op = inputs.rx_op.recv() => Input::Op(op),
                Some(event) = inputs.jar_rx.recv() => Input::CookieJar(event),
                _ = next_event(&mut inputs.token_rx) => Input::TokensChanged,
                event = next_event(&mut inputs.signin_rx) => Input::Signin(event),
                change = next_event(&mut inputs.settings_rx) => Input::CookieSetting(change),
            };
            match input {
                Input::Op(Some(Op::StartReconcile(trigger))) => self.start_reconcile(trigger),
                Input::Op(Some(Op::Shutdown) | None) => break,
                Input::CookieJar(event) => self.on_cookie_jar_event(event),
                Input::TokensChanged => self.start_reconcile(ReconcileTrigger::TokensChanged),
                Input::Signin(event) => self.on_signin_event(event, &mut inputs.token_rx),
                Input::CookieSetting(change) => self.on_cookie_setting_changed(&change),
            }
        }

        self.cookie_manager.remove_observer(self.observer_id);
        self.registered.store(false, Ordering::SeqCst);
        self.pass = None;
        self.status_tx
            .send_modify(|status| status.state = ReconcileState::NotReconciling);
        info!("account reconcilor stopped");
    }

    fn set_state(&self, state: ReconcileState) {
        self.status_tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            debug!(from = %status.state, to = %state, "reconcile state changed");
            status.state = state;
            true
        });
    }

    fn start_reconcile(&mut self, trigger: ReconcileTrigger) {
        if let Some(pass) = self.pass.as_mut() {
            match pass.phase {
                PassPhase::GatheringInformation => {
                    debug!(%trigger, "pass already gathering; trigger collapsed");
                }
                PassPhase::ApplyingChanges => {
                    if pass.follow_up.is_none() {
                        debug!(%trigger, "follow-up pass scheduled");
                        pass.follow_up = Some(trigger);
                    }
                }
            }
            return;
        }

        if !self.registered.load(Ordering::SeqCst) {
            debug!(%trigger, "not signed in; no pass");
            return;
        }
        if self.token_service.primary_account().is_none() {
            debug!(%trigger, "no primary account; no pass");
            return;
        }
        if !self
            .cookie_settings
            .are_session_cookies_allowed(&self.cookie_domain)
        {
            info!(%trigger, "session cookies disallowed; no pass");
            return;
        }

        info!(%trigger, "starting reconcile pass");
        self.pass = Some(Pass::new(trigger));
        self.set_state(ReconcileState::GatheringInformation);

        match self.cookie_manager.list_accounts() {
            Ok(Some(accounts)) => self.apply_changes(accounts),
            Ok(None) => debug!("waiting for the cookie jar account list"),
            Err(err) => {
                warn!("cannot gather cookie jar accounts: {err}");
                self.fail_pass();
            }
        }
    }

    fn on_cookie_jar_event(&mut self, event: CookieJarEvent) {
        match event {
            CookieJarEvent::AccountsInCookieUpdated {
                accounts, error, ..
            } => self.on_accounts_in_cookie_updated(accounts, error),
            CookieJarEvent::AddAccountCompleted {
                request_id,
                account_id,
                error,
            } => {
                debug!(%request_id, %account_id, error = ?error, "add completed");
                self.on_request_completed(request_id, error);
            }
            CookieJarEvent::LogOutCompleted { request_id, error } => {
                debug!(%request_id, error = ?error, "log-out completed");
                self.on_request_completed(request_id, error);
            }
        }
    }

    fn on_accounts_in_cookie_updated(
        &mut self,
        accounts: Vec<ListedAccount>,
        error: Option<GaiaError>,
    ) {
        match self.pass.as_ref().map(|pass| pass.phase) {
            Some(PassPhase::GatheringInformation) => match error {
                None => self.apply_changes(accounts),
                Some(err) => {
                    warn!("listing cookie jar accounts failed: {err}");
                    self.fail_pass();
                }
            },
            // Our own merges and log-outs refresh the list while applying.
            Some(PassPhase::ApplyingChanges) => {}
            None => {
                if error.is_none() {
                    self.start_reconcile(ReconcileTrigger::CookieJarChanged);
                }
            }
        }
    }

    fn apply_changes(&mut self, gaia_accounts: Vec<ListedAccount>) {
        let primary = self.token_service.primary_account();
        let local = self.token_service.accounts();
        let plan = plan_reconcile(primary.as_ref(), &local, &gaia_accounts);
        debug!(?primary, ?local, ?gaia_accounts, ?plan, "reconcile plan");

        let Some(pass) = self.pass.as_mut() else {
            return;
        };
        pass.primary_mismatch = plan.primary_mismatch;
        pass.added_to_cookie = plan.missing_from_cookie.len();
        pass.removed_from_cookie = plan.removed_from_cookie.len();
        pass.rebuilt_cookie = plan.log_out_first;

        if plan.is_noop() {
            self.finish_pass();
            return;
        }

        pass.phase = PassPhase::ApplyingChanges;
        let mut submitted = Vec::new();
        let mut rejected = false;
        if plan.log_out_first {
            match self.cookie_manager.log_out_all_accounts() {
                Ok(id) => submitted.push(id),
                Err(err) => {
                    warn!("cannot queue log-out: {err}");
                    rejected = true;
                }
            }
        }
        if !rejected {
            for account_id in plan.add_to_cookie {
                match self.cookie_manager.add_account_to_cookie(account_id.clone()) {
                    Ok(id) => submitted.push(id),
                    Err(err) => {
                        warn!(%account_id, "cannot queue add: {err}");
                        rejected = true;
                        break;
                    }
                }
            }
        }

        if let Some(pass) = self.pass.as_mut() {
            pass.outstanding.extend(submitted);
            pass.failed |= rejected;
        }
        self.set_state(ReconcileState::ApplyingChanges);
        self.finish_if_drained();
    }

    fn on_request_completed(&mut self, request_id: RequestId, error: Option<GaiaError>) {
        let Some(pass) = self.pass.as_mut() else {
            return;
        };
        if pass.phase != PassPhase::ApplyingChanges || !pass.outstanding.remove(&request_id) {
            debug!(%request_id, "completion not part of the current pass");
            return;
        }
        if let Some(err) = error {
            warn!(%request_id, "request of the current pass failed: {err}");
            pass.failed = true;
        }
        self.finish_if_drained();
    }

    fn finish_if_drained(&mut self) {
        if self
            .pass
            .as_ref()
            .is_some_and(|pass| pass.outstanding.is_empty())
        {
            self.finish_pass();
        }
    }

    fn fail_pass(&mut self) {
        if let Some(pass) = self.pass.as_mut() {
            pass.failed = true;
        }
        self.finish_pass();
    }

    fn finish_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        let first_run = self.status_tx.borrow().passes_completed == 0;
        let summary = PassSummary {
            trigger: pass.trigger,
            first_run,
            primary_mismatch: pass.primary_mismatch,
            added_to_cookie: pass.added_to_cookie,
            removed_from_cookie: pass.removed_from_cookie,
            rebuilt_cookie: pass.rebuilt_cookie,
            failed: pass.failed,
        };
        info!(
            trigger = %summary.trigger,
            first_run,
            primary_mismatch = summary.primary_mismatch,
            added = summary.added_to_cookie,
            removed = summary.removed_from_cookie,
            rebuilt = summary.rebuilt_cookie,
            failed = summary.failed,
            "reconcile pass finished"
        );

        let state = if pass.failed {
            ReconcileState::Error
        } else {
            ReconcileState::NotReconciling
        };
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.last_pass = Some(summary);
            status.passes_completed += 1;
        });

        if pass.follow_up.is_some() {
            self.start_reconcile(ReconcileTrigger::FollowUp);
        }
    }

    fn on_signin_event(
        &mut self,
        event: SigninEvent,
        token_rx: &mut Option<broadcast::Receiver<TokenServiceEvent>>,
    ) {
        match event {
            SigninEvent::SignedIn(account_id) => {
                info!(%account_id, "signed in");
                if token_rx.is_none() {
                    *token_rx = Some(self.token_service.subscribe());
                }
                self.registered.store(true, Ordering::SeqCst);
                self.start_reconcile(ReconcileTrigger::SignedIn);
            }
            SigninEvent::SignedOut(account_id) => {
                info!(%account_id, "signed out; clearing the cookie jar");
                *token_rx = None;
                self.registered.store(false, Ordering::SeqCst);
                // Abort in place; requests already queued finish on their own.
                self.pass = None;
                self.set_state(ReconcileState::NotReconciling);
                if let Err(err) = self.cookie_manager.log_out_all_accounts() {
                    warn!("cannot queue log-out after sign-out: {err}");
                }
            }
        }
    }

    fn on_cookie_setting_changed(&mut self, change: &CookieSettingChange) {
        if !change.applies_to(&self.cookie_domain) {
            return;
        }
        if !self
            .cookie_settings
            .are_session_cookies_allowed(&self.cookie_domain)
        {
            debug!("session cookies now disallowed");
            return;
        }
        self.start_reconcile(ReconcileTrigger::CookieSettingChanged);
    }
}

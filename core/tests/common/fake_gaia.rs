use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use reconcilor_gaia_api::GaiaClient;
use reconcilor_protocol::AccountId;
use reconcilor_protocol::ConnectionCheckTarget;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use tokio::time::Instant;

/// One call received by [`FakeGaia`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GaiaCall {
    Ubertoken(AccountId),
    MergeSession {
        account_id: AccountId,
        ubertoken: String,
        external_cc_result: String,
    },
    ListAccounts,
    LogOut,
    CheckConnectionInfo,
    Probe(String),
}

impl GaiaCall {
    /// Calls that touch the session jar, as opposed to connectivity checks.
    pub fn is_session_call(&self) -> bool {
        !matches!(self, GaiaCall::CheckConnectionInfo | GaiaCall::Probe(_))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call: GaiaCall,
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct ProbeTarget {
    /// `None` never answers.
    answer_after: Option<Duration>,
    body: String,
}

#[derive(Default)]
struct FakeState {
    jar: Vec<ListedAccount>,
    ubertoken_results: VecDeque<Result<String, GaiaError>>,
    merge_results: VecDeque<Result<(), GaiaError>>,
    list_results: VecDeque<Result<Vec<ListedAccount>, GaiaError>>,
    log_out_results: VecDeque<Result<(), GaiaError>>,
    probes: HashMap<String, ProbeTarget>,
    targets: Vec<ConnectionCheckTarget>,
    latency: Duration,
    account_latency: HashMap<AccountId, Duration>,
    calls: Vec<RecordedCall>,
}

/// Identity service double that keeps a simulated cookie jar.
///
/// Scripted results are consumed in order; once a queue is empty the call
/// succeeds and updates the jar the way the real service would.
#[derive(Default)]
pub struct FakeGaia {
    state: Mutex<FakeState>,
}

impl FakeGaia {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    pub fn set_jar(&self, jar: Vec<ListedAccount>) {
        self.state().jar = jar;
    }

    pub fn jar(&self) -> Vec<ListedAccount> {
        self.state().jar.clone()
    }

    /// Delay applied to every session call before it answers.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Overrides the latency of ubertoken and merge calls for one account.
    pub fn set_account_latency(&self, account_id: &str, latency: Duration) {
        self.state()
            .account_latency
            .insert(AccountId::new(account_id), latency);
    }

    pub fn push_ubertoken_result(&self, result: Result<String, GaiaError>) {
        self.state().ubertoken_results.push_back(result);
    }

    pub fn push_merge_result(&self, result: Result<(), GaiaError>) {
        self.state().merge_results.push_back(result);
    }

    pub fn push_list_result(&self, result: Result<Vec<ListedAccount>, GaiaError>) {
        self.state().list_results.push_back(result);
    }

    pub fn push_log_out_result(&self, result: Result<(), GaiaError>) {
        self.state().log_out_results.push_back(result);
    }

    /// Adds a connectivity target whose probe returns `body` after
    /// `answer_after`, or never when `None`.
    pub fn add_probe_target(&self, token: &str, answer_after: Option<Duration>, body: &str) {
        let url = format!("https://probe.example.com/{token}");
        let mut state = self.state();
        state.targets.push(ConnectionCheckTarget {
            token: token.to_string(),
            url: url.clone(),
        });
        state.probes.insert(
            url,
            ProbeTarget {
                answer_after,
                body: body.to_string(),
            },
        );
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn calls(&self) -> Vec<GaiaCall> {
        self.state()
            .calls
            .iter()
            .map(|recorded| recorded.call.clone())
            .collect()
    }

    pub fn session_calls(&self) -> Vec<GaiaCall> {
        self.calls()
            .into_iter()
            .filter(GaiaCall::is_session_call)
            .collect()
    }

    /// Times at which the service saw calls matching `filter`.
    pub fn call_times(&self, filter: impl Fn(&GaiaCall) -> bool) -> Vec<Instant> {
        self.state()
            .calls
            .iter()
            .filter(|recorded| filter(&recorded.call))
            .map(|recorded| recorded.at)
            .collect()
    }

    fn record(&self, call: GaiaCall) -> Duration {
        let mut state = self.state();
        let account_latency = match &call {
            GaiaCall::Ubertoken(account_id) | GaiaCall::MergeSession { account_id, .. } => {
                state.account_latency.get(account_id).copied()
            }
            _ => None,
        };
        state.calls.push(RecordedCall {
            call,
            at: Instant::now(),
        });
        account_latency.unwrap_or(state.latency)
    }

    async fn simulate_latency(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl GaiaClient for FakeGaia {
    async fn exchange_for_session_token(
        &self,
        account_id: &AccountId,
        _credential: &str,
    ) -> Result<String, GaiaError> {
        let latency = self.record(GaiaCall::Ubertoken(account_id.clone()));
        Self::simulate_latency(latency).await;
        self.state()
            .ubertoken_results
            .pop_front()
            .unwrap_or_else(|| Ok(format!("uber:{account_id}")))
    }

    async fn merge_session(
        &self,
        account_id: &AccountId,
        ubertoken: &str,
        external_cc_result: &str,
    ) -> Result<(), GaiaError> {
        let latency = self.record(GaiaCall::MergeSession {
            account_id: account_id.clone(),
            ubertoken: ubertoken.to_string(),
            external_cc_result: external_cc_result.to_string(),
        });
        Self::simulate_latency(latency).await;
        let mut state = self.state();
        if let Some(result) = state.merge_results.pop_front() {
            return result;
        }
        match state
            .jar
            .iter_mut()
            .find(|listed| listed.id.same_account(account_id))
        {
            Some(listed) => listed.valid = true,
            None => state.jar.push(ListedAccount::valid(account_id.clone())),
        }
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<ListedAccount>, GaiaError> {
        let latency = self.record(GaiaCall::ListAccounts);
        Self::simulate_latency(latency).await;
        let mut state = self.state();
        match state.list_results.pop_front() {
            Some(result) => result,
            None => Ok(state.jar.clone()),
        }
    }

    async fn log_out(&self) -> Result<(), GaiaError> {
        let latency = self.record(GaiaCall::LogOut);
        Self::simulate_latency(latency).await;
        let mut state = self.state();
        if let Some(result) = state.log_out_results.pop_front() {
            return result;
        }
        state.jar.clear();
        Ok(())
    }

    async fn get_check_connection_info(&self) -> Result<Vec<ConnectionCheckTarget>, GaiaError> {
        self.record(GaiaCall::CheckConnectionInfo);
        Ok(self.state().targets.clone())
    }

    async fn probe(&self, url: &str) -> Result<String, GaiaError> {
        self.record(GaiaCall::Probe(url.to_string()));
        let target = self.state().probes.get(url).cloned();
        let Some(target) = target else {
            return Err(GaiaError::ConnectionFailed(format!("unknown probe {url}")));
        };
        match target.answer_after {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(target.body)
            }
            None => std::future::pending().await,
        }
    }
}

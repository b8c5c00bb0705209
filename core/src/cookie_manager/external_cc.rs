//! Probes the connectivity-check urls handed out by the identity service and
//! summarizes their answers for the merge call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use reconcilor_gaia_api::GaiaClient;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPhase {
    NotStarted,
    Running,
    Done,
}

/// Runs at most once per instance. `result()` may be read at any time and
/// reflects whatever probes have answered so far.
pub struct ExternalCcResultFetcher {
    gaia: Arc<dyn GaiaClient>,
    timeout: Duration,
    results: Arc<Mutex<BTreeMap<String, Option<String>>>>,
    phase: Arc<watch::Sender<FetchPhase>>,
}

impl ExternalCcResultFetcher {
    pub fn new(gaia: Arc<dyn GaiaClient>, timeout: Duration) -> Self {
        let (phase, _) = watch::channel(FetchPhase::NotStarted);
        Self {
            gaia,
            timeout,
            results: Arc::new(Mutex::new(BTreeMap::new())),
            phase: Arc::new(phase),
        }
    }

    /// Fetches the probe targets and probes each of them in parallel. Later
    /// calls are no-ops.
    pub fn start(&self) {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == FetchPhase::NotStarted {
                *phase = FetchPhase::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let gaia = Arc::clone(&self.gaia);
        let results = Arc::clone(&self.results);
        let phase = Arc::clone(&self.phase);
        let timeout = self.timeout;
        tokio::spawn(async move {
            run_probes(gaia, results, timeout).await;
            phase.send_replace(FetchPhase::Done);
        });
    }

    pub fn has_started(&self) -> bool {
        *self.phase.borrow() != FetchPhase::NotStarted
    }

    pub fn is_running(&self) -> bool {
        *self.phase.borrow() == FetchPhase::Running
    }

    /// Resolves once every probe answered or the timer fired. Returns at once
    /// if the fetcher never started.
    pub async fn wait_until_done(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != FetchPhase::Running).await;
    }

    /// `token:value` pairs sorted by token and joined with commas. Probes
    /// that failed, timed out or have not answered yet read `null`.
    pub fn result(&self) -> String {
        lock(&self.results)
            .iter()
            .map(|(token, value)| format!("{token}:{}", value.as_deref().unwrap_or("null")))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

async fn run_probes(
    gaia: Arc<dyn GaiaClient>,
    results: Arc<Mutex<BTreeMap<String, Option<String>>>>,
    timeout: Duration,
) {
    let targets = match tokio::time::timeout(timeout, gaia.get_check_connection_info()).await {
        Ok(Ok(targets)) => targets,
        Ok(Err(err)) => {
            warn!("failed to fetch connectivity check targets: {err}");
            return;
        }
        Err(_) => {
            warn!("timed out fetching connectivity check targets");
            return;
        }
    };

    // The aggregate timer starts once the targets are known.
    let deadline = Instant::now() + timeout;
    let mut probes = JoinSet::new();
    {
        let mut results = lock(&results);
        for target in targets {
            results.insert(target.token.clone(), None);
            let gaia = Arc::clone(&gaia);
            probes.spawn(async move {
                let outcome = gaia.probe(&target.url).await;
                (target.token, outcome)
            });
        }
    }

    loop {
        tokio::select! {
            joined = probes.join_next() => {
                match joined {
                    Some(Ok((token, Ok(body)))) => {
                        debug!(%token, "connectivity probe answered");
                        lock(&results).insert(token, Some(body));
                    }
                    Some(Ok((token, Err(err)))) => {
                        debug!(%token, "connectivity probe failed: {err}");
                    }
                    Some(Err(err)) => {
                        debug!("connectivity probe task ended abnormally: {err}");
                    }
                    None => break,
                }
            }
            _ = sleep_until(deadline) => {
                info!(outstanding = probes.len(), "connectivity probes timed out");
                probes.abort_all();
                break;
            }
        }
    }
}

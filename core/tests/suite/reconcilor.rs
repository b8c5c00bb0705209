use std::time::Duration;

use pretty_assertions::assert_eq;
use reconcilor_core::collaborators::CookieChange;
use reconcilor_core::error::ReconcilorErr;
use reconcilor_protocol::AccountId;
use reconcilor_protocol::CookieJarEvent;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use reconcilor_protocol::PassSummary;
use reconcilor_protocol::ReconcileState;
use reconcilor_protocol::ReconcileTrigger;
use reconcilor_test_support::GaiaCall;
use reconcilor_test_support::TestProfile;
use reconcilor_test_support::WAIT_LIMIT;
use reconcilor_test_support::next_jar_event;
use reconcilor_test_support::settle;
use reconcilor_test_support::wait_for_passes;

fn add(account: &str) -> GaiaCall {
    GaiaCall::Ubertoken(AccountId::new(account))
}

/// Session calls with merges left out; each add shows up as its ubertoken
/// exchange.
fn session_plan(profile: &TestProfile) -> Vec<GaiaCall> {
    profile
        .gaia
        .session_calls()
        .into_iter()
        .filter(|call| !matches!(call, GaiaCall::MergeSession { .. }))
        .collect()
}

fn summary(trigger: ReconcileTrigger) -> PassSummary {
    PassSummary {
        trigger,
        first_run: true,
        primary_mismatch: false,
        added_to_cookie: 0,
        removed_from_cookie: 0,
        rebuilt_cookie: false,
        failed: false,
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn adds_missing_account_to_empty_jar() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(done.state, ReconcileState::NotReconciling);
    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            added_to_cookie: 1,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(
        session_plan(&profile),
        vec![GaiaCall::ListAccounts, add("a@x.com")]
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_jar_gets_primary_first_and_stays_converged() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["b@x.com", "a@x.com"]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let first = wait_for_passes(&mut status, 1).await;
    assert_eq!(
        first.last_pass,
        Some(PassSummary {
            added_to_cookie: 2,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(
        profile.gaia.jar(),
        vec![
            ListedAccount::valid("a@x.com"),
            ListedAccount::valid("b@x.com"),
        ]
    );

    reconcilor.start_reconcile()?;
    let second = wait_for_passes(&mut status, 2).await;
    assert_eq!(
        second.last_pass,
        Some(PassSummary {
            first_run: false,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert!(
        !profile.gaia.session_calls().contains(&GaiaCall::LogOut),
        "{:?}",
        profile.gaia.session_calls()
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unknown_jar_account_forces_rebuild() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_jar(vec![
        ListedAccount::valid("a@x.com"),
        ListedAccount::valid("b@x.com"),
    ]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            removed_from_cookie: 1,
            rebuilt_cookie: true,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(
        session_plan(&profile),
        vec![GaiaCall::ListAccounts, GaiaCall::LogOut, add("a@x.com")]
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn primary_mismatch_rebuilds_with_primary_first() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com", "b@x.com"]);
    profile.gaia.set_jar(vec![
        ListedAccount::valid("b@x.com"),
        ListedAccount::valid("a@x.com"),
    ]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            primary_mismatch: true,
            rebuilt_cookie: true,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(
        session_plan(&profile),
        vec![
            GaiaCall::ListAccounts,
            GaiaCall::LogOut,
            add("a@x.com"),
            add("b@x.com"),
        ]
    );
    assert_eq!(
        profile.gaia.jar(),
        vec![
            ListedAccount::valid("a@x.com"),
            ListedAccount::valid("b@x.com"),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn converged_jar_needs_no_requests() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("Dot.A@x.com", &["Dot.A@x.com"]);
    profile.gaia.set_jar(vec![ListedAccount::valid("dota@x.com")]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(done.last_pass, Some(summary(ReconcileTrigger::Manual)));
    assert_eq!(profile.gaia.session_calls(), vec![GaiaCall::ListAccounts]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn expired_local_account_is_merged_again() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com", "b@x.com"]);
    profile.gaia.set_jar(vec![
        ListedAccount::valid("a@x.com"),
        ListedAccount::invalid("b@x.com"),
    ]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            added_to_cookie: 1,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(
        session_plan(&profile),
        vec![GaiaCall::ListAccounts, add("b@x.com")]
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_request_puts_reconcilor_in_error() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile
        .gaia
        .push_merge_result(Err(GaiaError::InvalidCredentials("401".to_string())));
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(done.state, ReconcileState::Error);
    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            added_to_cookie: 1,
            failed: true,
            ..summary(ReconcileTrigger::Manual)
        })
    );

    // The next trigger starts over.
    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 2).await;
    assert_eq!(done.state, ReconcileState::NotReconciling);
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_listing_fails_the_pass() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile
        .gaia
        .push_list_result(Err(GaiaError::UnexpectedServiceResponse("html".to_string())));
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(done.state, ReconcileState::Error);
    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            failed: true,
            ..summary(ReconcileTrigger::Manual)
        })
    );
    assert_eq!(profile.gaia.session_calls(), vec![GaiaCall::ListAccounts]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn triggers_collapse_while_gathering() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_jar(vec![ListedAccount::valid("a@x.com")]);
    profile.gaia.set_latency(Duration::from_millis(100));
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    reconcilor.start_reconcile()?;
    profile
        .tokens
        .update_credentials(AccountId::new("a@x.com"), "rotated");

    wait_for_passes(&mut status, 1).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(status.borrow().passes_completed, 1);
    assert_eq!(profile.gaia.session_calls(), vec![GaiaCall::ListAccounts]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn trigger_while_applying_schedules_one_follow_up() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_latency(Duration::from_millis(100));
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    tokio::time::timeout(
        WAIT_LIMIT,
        status.wait_for(|status| status.state == ReconcileState::ApplyingChanges),
    )
    .await??;
    profile
        .tokens
        .update_credentials(AccountId::new("c@x.com"), "refresh-c");
    reconcilor.start_reconcile()?;

    let first = wait_for_passes(&mut status, 1).await;
    assert_eq!(
        first.last_pass.map(|pass| pass.trigger),
        Some(ReconcileTrigger::Manual)
    );
    let second = wait_for_passes(&mut status, 2).await;
    assert_eq!(
        second.last_pass,
        Some(PassSummary {
            first_run: false,
            added_to_cookie: 1,
            ..summary(ReconcileTrigger::FollowUp)
        })
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status.borrow().passes_completed, 2);
    assert_eq!(
        profile.gaia.jar(),
        vec![
            ListedAccount::valid("a@x.com"),
            ListedAccount::valid("c@x.com"),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn startup_pass_runs_for_signed_in_profile() {
    let mut profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.config.reconcile_on_startup = true;
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    assert!(reconcilor.is_registered_with_token_service());
    let done = wait_for_passes(&mut status, 1).await;

    assert_eq!(
        done.last_pass.map(|pass| pass.trigger),
        Some(ReconcileTrigger::Startup)
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn signed_out_profile_does_not_reconcile() -> anyhow::Result<()> {
    let mut profile = TestProfile::new();
    profile.config.reconcile_on_startup = true;
    profile
        .tokens
        .update_credentials(AccountId::new("a@x.com"), "refresh-a");
    let reconcilor = profile.reconcilor(profile.cookie_manager());

    assert!(!reconcilor.is_registered_with_token_service());
    reconcilor.start_reconcile()?;
    profile
        .tokens
        .update_credentials(AccountId::new("b@x.com"), "refresh-b");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(reconcilor.state(), ReconcileState::NotReconciling);
    assert_eq!(reconcilor.last_pass(), None);
    assert!(profile.gaia.calls().is_empty());
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sign_in_registers_and_reconciles() {
    let profile = TestProfile::new();
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    profile
        .tokens
        .update_credentials(AccountId::new("a@x.com"), "refresh-a");
    profile
        .tokens
        .set_primary_account(Some(AccountId::new("a@x.com")));
    profile.signin.sign_in(AccountId::new("a@x.com"));

    let done = wait_for_passes(&mut status, 1).await;
    assert!(reconcilor.is_registered_with_token_service());
    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            added_to_cookie: 1,
            ..summary(ReconcileTrigger::SignedIn)
        })
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sign_out_clears_jar_and_unregisters() {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_jar(vec![ListedAccount::valid("a@x.com")]);
    let manager = profile.cookie_manager();
    let (_, mut jar_rx) = manager.add_observer();
    let reconcilor = profile.reconcilor(manager);

    profile.tokens.set_primary_account(None);
    profile.signin.sign_out(AccountId::new("a@x.com"));

    let event = next_jar_event(&mut jar_rx).await;
    assert!(
        matches!(event, CookieJarEvent::LogOutCompleted { error: None, .. }),
        "unexpected event {event:?}"
    );
    assert!(profile.gaia.jar().is_empty());
    assert!(!reconcilor.is_registered_with_token_service());

    // Token changes no longer trigger passes.
    profile
        .tokens
        .update_credentials(AccountId::new("b@x.com"), "refresh-b");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(reconcilor.last_pass(), None);
    assert_eq!(profile.gaia.session_calls(), vec![GaiaCall::LogOut]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sign_out_aborts_pass_in_progress() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_latency(Duration::from_millis(100));
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    tokio::time::timeout(
        WAIT_LIMIT,
        status.wait_for(|status| status.state == ReconcileState::ApplyingChanges),
    )
    .await??;
    profile.tokens.set_primary_account(None);
    profile.signin.sign_out(AccountId::new("a@x.com"));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(reconcilor.state(), ReconcileState::NotReconciling);
    assert_eq!(status.borrow().passes_completed, 0);
    // The add already running finishes, then the log-out wipes the jar.
    assert!(profile.gaia.jar().is_empty());
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn blocked_cookies_defer_until_setting_changes() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile
        .cookie_settings
        .set_session_cookies_allowed(Some("accounts.example.com"), false);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(reconcilor.last_pass(), None);
    assert!(profile.gaia.calls().is_empty());

    // A rule for some other site changes nothing.
    profile
        .cookie_settings
        .set_session_cookies_allowed(Some("news.example.com"), true);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(reconcilor.last_pass(), None);

    profile
        .cookie_settings
        .set_session_cookies_allowed(Some("accounts.example.com"), true);
    let done = wait_for_passes(&mut status, 1).await;
    assert_eq!(
        done.last_pass.map(|pass| pass.trigger),
        Some(ReconcileTrigger::CookieSettingChanged)
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn parent_domain_setting_change_triggers_pass() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.cookie_settings.set_session_cookies_allowed(None, false);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(reconcilor.last_pass(), None);

    profile
        .cookie_settings
        .set_session_cookies_allowed(Some("[*.]example.com"), true);
    let done = wait_for_passes(&mut status, 1).await;
    assert_eq!(
        done.last_pass.map(|pass| pass.trigger),
        Some(ReconcileTrigger::CookieSettingChanged)
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn outside_jar_change_triggers_pass_when_idle() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    profile.gaia.set_jar(vec![ListedAccount::valid("a@x.com")]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());
    let mut status = reconcilor.subscribe_status();

    reconcilor.start_reconcile()?;
    wait_for_passes(&mut status, 1).await;

    profile.gaia.set_jar(Vec::new());
    profile.cookie_store.record_change(CookieChange {
        domain: "accounts.example.com".to_string(),
        name: "APISID".to_string(),
        removed: true,
    });

    let done = wait_for_passes(&mut status, 2).await;
    assert_eq!(
        done.last_pass,
        Some(PassSummary {
            first_run: false,
            added_to_cookie: 1,
            ..summary(ReconcileTrigger::CookieJarChanged)
        })
    );
    assert_eq!(profile.gaia.jar(), vec![ListedAccount::valid("a@x.com")]);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cookie_manager_shutdown_fails_the_pass() -> anyhow::Result<()> {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    let manager = profile.cookie_manager();
    let reconcilor = profile.reconcilor(manager.clone());
    let mut status = reconcilor.subscribe_status();

    manager.shutdown();
    reconcilor.start_reconcile()?;

    let done = wait_for_passes(&mut status, 1).await;
    assert_eq!(done.state, ReconcileState::Error);
    assert_eq!(done.last_pass.map(|pass| pass.failed), Some(true));
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shutdown_stops_the_reconcilor() {
    let profile = TestProfile::signed_in("a@x.com", &["a@x.com"]);
    let reconcilor = profile.reconcilor(profile.cookie_manager());

    reconcilor.shutdown();
    settle().await;

    assert!(matches!(
        reconcilor.start_reconcile(),
        Err(ReconcilorErr::ReconcilorShutDown)
    ));
    assert!(!reconcilor.is_registered_with_token_service());
    assert_eq!(reconcilor.state(), ReconcileState::NotReconciling);
}

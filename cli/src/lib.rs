//! `reconcilor` command line: drives the reconciliation engine against a real
//! identity service endpoint using the accounts listed in a config file.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use reconcilor_client::ReqwestTransport;
use reconcilor_client::build_reqwest_client;
use reconcilor_core::AccountReconcilor;
use reconcilor_core::ExternalCcResultFetcher;
use reconcilor_core::GaiaCookieManager;
use reconcilor_core::collaborators::TokenService;
use reconcilor_core::config::ConfigToml;
use reconcilor_core::config::ProfileToml;
use reconcilor_core::config::ReconcilorConfig;
use reconcilor_core::memory::InMemoryCookieSettings;
use reconcilor_core::memory::InMemoryCookieStore;
use reconcilor_core::memory::InMemorySigninManager;
use reconcilor_core::memory::InMemoryTokenService;
use reconcilor_gaia_api::GaiaClient;
use reconcilor_gaia_api::GaiaUrls;
use reconcilor_gaia_api::HttpGaiaClient;
use reconcilor_protocol::ListedAccount;
use reconcilor_protocol::PassSummary;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, bin_name = "reconcilor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one reconciliation pass for the profile in the config file.
    Reconcile(ReconcileArgs),

    /// Print the accounts currently in the remote session cookie jar.
    ListAccounts(ListAccountsArgs),

    /// Probe the connectivity-check endpoints and print the merge header value.
    CheckConnection(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Path to the TOML config file.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[clap(flatten)]
    pub config: ConfigArgs,

    /// Print the pass summary as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Give up if the pass has not finished after this many seconds.
    #[arg(long = "timeout-secs", default_value_t = 60)]
    pub timeout_secs: u64,
}

#[derive(Debug, Args)]
pub struct ListAccountsArgs {
    #[clap(flatten)]
    pub config: ConfigArgs,

    /// Print the account list as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Reconcile(args) => run_reconcile(args).await,
        Command::ListAccounts(args) => run_list_accounts(args).await,
        Command::CheckConnection(args) => run_check_connection(args).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<(ReconcilorConfig, ProfileToml)> {
    let toml = ConfigToml::from_path(path)?;
    let profile = toml.profile.clone();
    let config = ReconcilorConfig::from_toml(toml)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok((config, profile))
}

fn gaia_client(config: &ReconcilorConfig) -> anyhow::Result<Arc<HttpGaiaClient<ReqwestTransport>>> {
    let urls = GaiaUrls::new(config.gaia_url.as_str(), config.source.clone())
        .with_context(|| format!("invalid gaia_url {}", config.gaia_url))?;
    let transport = ReqwestTransport::new(build_reqwest_client()?);
    Ok(Arc::new(
        HttpGaiaClient::new(transport, urls).with_request_timeout(config.request_timeout),
    ))
}

async fn run_reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    let (config, profile) = load_config(&args.config.config)?;
    let tokens = Arc::new(InMemoryTokenService::from_profile(&profile));
    let Some(primary) = tokens.primary_account() else {
        anyhow::bail!("[profile] primary_account is required to reconcile");
    };
    info!(%primary, accounts = tokens.accounts().len(), "reconciling profile");

    let gaia = gaia_client(&config)?;
    let signin = InMemorySigninManager::new();
    let cookie_settings = Arc::new(InMemoryCookieSettings::new(true));
    let cookie_store = InMemoryCookieStore::new();
    let cookie_manager = Arc::new(GaiaCookieManager::spawn(
        &config,
        gaia,
        tokens.clone(),
        cookie_settings.clone(),
        &cookie_store,
    ));
    let reconcilor = AccountReconcilor::spawn(
        &config,
        Arc::clone(&cookie_manager),
        tokens,
        &signin,
        cookie_settings,
    );

    let mut status = reconcilor.subscribe_status();
    // Collapses into the startup pass when one is already running.
    reconcilor.start_reconcile()?;
    let finished = tokio::time::timeout(
        Duration::from_secs(args.timeout_secs),
        status.wait_for(|status| status.passes_completed > 0),
    )
    .await
    .with_context(|| format!("pass did not finish within {}s", args.timeout_secs))?
    .context("reconcilor stopped before the pass finished")?
    .clone();

    reconcilor.shutdown();
    cookie_manager.shutdown();

    let Some(summary) = finished.last_pass else {
        anyhow::bail!("reconcilor finished without a pass summary");
    };
    print_summary(&summary, args.json)?;
    if summary.failed {
        anyhow::bail!("reconcile pass failed");
    }
    Ok(())
}

async fn run_list_accounts(args: ListAccountsArgs) -> anyhow::Result<()> {
    let (config, _) = load_config(&args.config.config)?;
    let gaia = gaia_client(&config)?;
    let accounts = gaia.list_accounts().await?;
    print_accounts(&accounts, args.json)
}

async fn run_check_connection(args: ConfigArgs) -> anyhow::Result<()> {
    let (config, _) = load_config(&args.config)?;
    let fetcher = ExternalCcResultFetcher::new(gaia_client(&config)?, config.external_cc_timeout);
    fetcher.start();
    fetcher.wait_until_done().await;
    #[allow(clippy::print_stdout)]
    {
        println!("{}", fetcher.result());
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_summary(summary: &PassSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let rows = [
        ("trigger", summary.trigger.to_string()),
        ("first run", summary.first_run.to_string()),
        ("primary mismatch", summary.primary_mismatch.to_string()),
        ("added to cookie", summary.added_to_cookie.to_string()),
        ("removed from cookie", summary.removed_from_cookie.to_string()),
        ("rebuilt cookie", summary.rebuilt_cookie.to_string()),
        ("failed", summary.failed.to_string()),
    ];
    for (label, value) in rows {
        println!("{label:<20} {value}");
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_accounts(accounts: &[ListedAccount], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(accounts)?);
        return Ok(());
    }
    if accounts.is_empty() {
        println!("no accounts in the session cookie jar");
    }
    for (position, account) in accounts.iter().enumerate() {
        let validity = if account.valid { "valid" } else { "expired" };
        println!("{position}\t{}\t{validity}", account.id);
    }
    Ok(())
}

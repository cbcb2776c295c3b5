use std::sync::Arc;

use anyhow::Context;
use onedrive_core::GraphClient;
use onedrive_mirror::clock::now_unix;
use onedrive_mirror::config::MirrorConfig;
use onedrive_mirror::logging;
use onedrive_mirror::storage::{AccountStore, NewAccount};
use onedrive_mirror::sync::engine::{PassOutcome, Reconciler};
use onedrive_mirror::sync::index::SyncIndex;
use onedrive_mirror::token_provider::TokenProvider;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Sync(String),
    Status(String),
    List,
    Import(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mut mode = CliMode::Help;
    while let Some(arg) = args.next() {
        mode = match arg.as_str() {
            "--sync" => CliMode::Sync(required_user(&mut args, "--sync")?),
            "--status" => CliMode::Status(required_user(&mut args, "--status")?),
            "--import" => CliMode::Import(required_user(&mut args, "--import")?),
            "--list" => CliMode::List,
            "--help" | "-h" => CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        };
    }
    Ok(mode)
}

fn required_user(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    match args.next() {
        Some(user) if !user.starts_with("--") => Ok(user),
        _ => anyhow::bail!("{flag} requires a user id"),
    }
}

fn print_usage() {
    println!("Usage: onedrive-mirror <--sync USER | --status USER | --list | --import USER>");
    println!("  --sync USER     Run one reconciliation pass for USER");
    println!("  --status USER   Print the stored sync status of USER");
    println!("  --list          List known accounts with item counts");
    println!("  --import USER   Store tokens from ONEDRIVE_ACCESS_TOKEN and friends");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    if let Err(err) = logging::init() {
        eprintln!("[onedrive-mirror] warning: logging disabled: {err}");
    }

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    let config = MirrorConfig::from_env()?;
    let index = SyncIndex::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open index at {}", config.db_path.display()))?;
    let accounts = AccountStore::from_pool(index.pool().clone());

    match mode {
        CliMode::Sync(user_id) => {
            let oauth_client = config.oauth_client()?;
            if oauth_client.is_none() {
                warn!("no application credentials configured, tokens cannot be refreshed");
            }
            let auth = Arc::new(TokenProvider::new(accounts, oauth_client));
            let remote = Arc::new(GraphClient::new()?);
            let engine = Arc::new(Reconciler::new(index, remote, auth, config.engine.clone()));

            match engine.start_pass(user_id.clone()).await? {
                Ok(PassOutcome::Completed(report)) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Ok(PassOutcome::Skipped) => {
                    eprintln!("[onedrive-mirror] a pass for {user_id} is already running");
                }
                Err(err) if err.is_auth() => {
                    anyhow::bail!("{err}; authorize again and store new tokens with --import {user_id}")
                }
                Err(err) => return Err(err.into()),
            }
        }
        CliMode::Status(user_id) => {
            let status = index.get_status(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CliMode::List => {
            let summaries = index.list_user_summaries().await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        CliMode::Import(user_id) => {
            let account = account_from_env(user_id)?;
            let stored = accounts.upsert_account(&account, now_unix()).await?;
            eprintln!("[onedrive-mirror] stored credentials for {}", stored.id);
        }
        CliMode::Help => print_usage(),
    }
    Ok(())
}

fn account_from_env(user_id: String) -> anyhow::Result<NewAccount> {
    let access_token =
        std::env::var("ONEDRIVE_ACCESS_TOKEN").context("ONEDRIVE_ACCESS_TOKEN is not set")?;
    let expires_at = match std::env::var("ONEDRIVE_TOKEN_EXPIRES_AT") {
        Ok(value) => Some(
            value
                .trim()
                .parse::<i64>()
                .context("ONEDRIVE_TOKEN_EXPIRES_AT must be unix seconds")?,
        ),
        Err(_) => None,
    };
    Ok(NewAccount {
        id: user_id,
        remote_account_id: std::env::var("ONEDRIVE_REMOTE_ACCOUNT_ID").ok(),
        display_name: std::env::var("ONEDRIVE_DISPLAY_NAME").ok(),
        access_token,
        refresh_token: std::env::var("ONEDRIVE_REFRESH_TOKEN").ok(),
        expires_at,
    })
}

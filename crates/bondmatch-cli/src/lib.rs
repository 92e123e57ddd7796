#![allow(clippy::print_stdout, clippy::print_stderr)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use bondmatch_client_core::bonds::BondApi;
use bondmatch_client_core::config::{normalize_base_url, resolve_client_config};
use bondmatch_client_core::{
    AuthorizedClient, Claims, SearchHistoryEntry, SessionError, SessionManager, SessionState,
};
use bondmatch_http::HttpTransport;
use clap::{Args, Parser, Subcommand};

pub mod file_store;

use file_store::{FileStore, default_store_path};

#[derive(Parser)]
#[command(name = "bondmatch")]
#[command(about = "Bond search client with persistent sign-in")]
pub struct BondmatchCli {
    /// Storage file holding credentials and cached search history
    #[arg(long, global = true, value_name = "PATH")]
    pub store: Option<PathBuf>,
    /// API base URL (overrides BONDMATCH_API_BASE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the credential pair
    Login(LoginArgs),
    /// Forget the stored credential pair
    Logout,
    /// Show session state and credential claims
    Status,
    /// Print a usable access token, refreshing if needed
    Token,
    /// Show search history merged with the server copy
    History(HistoryArgs),
    /// Search bonds and record the query
    Search { query: String },
    /// Find bonds matching a bond code
    Match { bond_code: String },
    /// Show details for one bond
    Details { bond_code: String },
}

#[derive(Args)]
pub struct LoginArgs {
    /// Defaults to the last username that signed in
    #[arg(long)]
    pub username: Option<String>,
    /// Read the password from the first line of stdin without prompting
    #[arg(long)]
    pub password_stdin: bool,
}

#[derive(Args)]
pub struct HistoryArgs {
    /// Only show the local cache
    #[arg(long)]
    pub offline: bool,
}

struct Context {
    session: SessionManager,
    bonds: BondApi,
}

fn build_context(cli: &BondmatchCli) -> anyhow::Result<Context> {
    let resolved = resolve_client_config()?;
    let mut config = resolved.config;
    let mut base_url_source = resolved.base_url_source;
    if let Some(base_url) = &cli.base_url {
        config.api_base_url = normalize_base_url(base_url)?;
        base_url_source = "--base-url".to_string();
    }
    tracing::debug!(
        base_url = %config.api_base_url,
        base_url_source = %base_url_source,
        timeout_source = %resolved.timeout_source,
        attempts_source = %resolved.attempts_source,
        retry_budget_source = %resolved.retry_budget_source,
        "resolved client config"
    );

    let store_path = cli.store.clone().unwrap_or_else(default_store_path);
    tracing::debug!(path = %store_path.display(), "opening storage");
    let store = Arc::new(FileStore::open(store_path));
    let transport = Arc::new(HttpTransport::new(&config)?);

    let session = SessionManager::builder(store, transport.clone()).build();
    let client =
        AuthorizedClient::new(session.clone(), transport).with_retry_budget(config.retry_budget);
    Ok(Context {
        session,
        bonds: BondApi::new(client),
    })
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run(cli: BondmatchCli) -> anyhow::Result<()> {
    let result = execute(cli).await;
    if let Some(hint) = result
        .as_ref()
        .err()
        .and_then(|error| error.downcast_ref::<SessionError>())
        .and_then(failure_hint)
    {
        eprintln!("hint: {hint}");
    }
    result
}

/// Follow-up advice for session failures. A denied request keeps the stored
/// session, so only the other terminal errors point back to `login`.
#[must_use]
pub fn failure_hint(error: &SessionError) -> Option<&'static str> {
    match error {
        SessionError::AuthorizationDenied { .. } => {
            Some("the server refused this request for the signed-in account; the session is still active")
        }
        error if error.is_terminal() => {
            Some("the session has ended; run `bondmatch login` to sign in again")
        }
        _ => None,
    }
}

async fn execute(cli: BondmatchCli) -> anyhow::Result<()> {
    let context = build_context(&cli)?;
    match cli.command {
        Commands::Login(args) => login(&context, args).await,
        Commands::Logout => {
            context.session.logout()?;
            println!("signed out");
            Ok(())
        }
        Commands::Status => {
            let state = context.session.restore().await;
            print!("{}", render_status(state, context.session.claims().as_ref()));
            Ok(())
        }
        Commands::Token => {
            let token = context.session.valid_access_token().await?;
            println!("{token}");
            Ok(())
        }
        Commands::History(args) => {
            let entries = if args.offline {
                context.bonds.history().cache().load()
            } else {
                context.bonds.history().reconcile().await?
            };
            print!("{}", render_history(&entries));
            Ok(())
        }
        Commands::Search { query } => {
            let results = context.bonds.search_bonds(&query).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        Commands::Match { bond_code } => {
            let matched = context.bonds.match_bond(&bond_code).await?;
            println!("{}", serde_json::to_string_pretty(&matched)?);
            Ok(())
        }
        Commands::Details { bond_code } => {
            let details = context.bonds.bond_details(&bond_code).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(())
        }
    }
}

async fn login(context: &Context, args: LoginArgs) -> anyhow::Result<()> {
    let username = args
        .username
        .or_else(|| context.session.last_username())
        .ok_or_else(|| anyhow!("--username is required for the first sign-in"))?;
    let password = read_password(&username, args.password_stdin)?;
    context.session.sign_in(&username, &password).await?;
    println!("signed in as {}", username.trim());
    Ok(())
}

fn read_password(username: &str, from_stdin: bool) -> anyhow::Result<String> {
    let stdin = std::io::stdin();
    if !from_stdin && stdin.is_terminal() {
        eprint!("Password for {}: ", username.trim());
        std::io::stderr().flush().context("flush prompt")?;
    }
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .context("read password from stdin")?;
    Ok(line)
}

#[must_use]
pub fn render_status(state: SessionState, claims: Option<&Claims>) -> String {
    let mut output = format!("state: {}\n", state.as_str());
    if let Some(claims) = claims {
        if let Some(name) = &claims.subject_name {
            output.push_str(&format!("user: {name}\n"));
        }
        if let Some(id) = &claims.subject_id {
            output.push_str(&format!("user_id: {id}\n"));
        }
        output.push_str(&format!("access_expires_at: {}\n", claims.expires_at.to_rfc3339()));
    }
    output
}

#[must_use]
pub fn render_history(entries: &[SearchHistoryEntry]) -> String {
    if entries.is_empty() {
        return "no search history\n".to_string();
    }
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}\t{}\t{}\n",
                entry.timestamp.to_rfc3339(),
                entry.result_count,
                entry.query
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn cli_requires_subcommand() {
        let err = match BondmatchCli::try_parse_from(["bondmatch"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        let err = match BondmatchCli::try_parse_from(["bondmatch", "unknown-subcommand"]) {
            Ok(_) => panic!("expected invalid subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = BondmatchCli::try_parse_from([
            "bondmatch",
            "login",
            "--username",
            "trader",
            "--password-stdin",
            "--store",
            "/tmp/bondmatch.json",
        ])
        .expect("parse");
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/bondmatch.json")));
        let Commands::Login(args) = cli.command else {
            panic!("expected login");
        };
        assert_eq!(args.username.as_deref(), Some("trader"));
        assert!(args.password_stdin);
    }

    #[test]
    fn search_takes_positional_query() {
        let cli = BondmatchCli::try_parse_from(["bondmatch", "search", "21 国债"]).expect("parse");
        assert!(matches!(cli.command, Commands::Search { query } if query == "21 国债"));
    }

    #[test]
    fn history_offline_flag() {
        let cli = BondmatchCli::try_parse_from(["bondmatch", "history", "--offline"]).expect("parse");
        assert!(matches!(cli.command, Commands::History(HistoryArgs { offline: true })));
    }

    #[test]
    fn status_lists_claims() {
        let claims = Claims {
            subject_id: Some("7".to_string()),
            subject_name: Some("trader".to_string()),
            expires_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp"),
        };
        assert_eq!(
            render_status(SessionState::Authenticated, Some(&claims)),
            "state: authenticated\nuser: trader\nuser_id: 7\naccess_expires_at: 2023-11-14T22:13:20+00:00\n"
        );
        assert_eq!(render_status(SessionState::Anonymous, None), "state: anonymous\n");
    }

    #[test]
    fn history_renders_one_line_per_entry() {
        let at = Utc.timestamp_opt(0, 0).single().expect("timestamp");
        let rendered = render_history(&[SearchHistoryEntry::new("019547", at, 3)]);
        assert_eq!(rendered, "1970-01-01T00:00:00+00:00\t3\t019547\n");
        assert_eq!(render_history(&[]), "no search history\n");
    }

    #[test]
    fn denied_request_does_not_suggest_signing_in_again() {
        let denied = failure_hint(&SessionError::AuthorizationDenied {
            message: "forbidden".to_string(),
        })
        .expect("hint");
        assert!(!denied.contains("login"));
        assert!(denied.contains("still active"));

        let ended = failure_hint(&SessionError::RefreshRejected {
            message: "expired".to_string(),
        })
        .expect("hint");
        assert!(ended.contains("bondmatch login"));
        assert_eq!(failure_hint(&SessionError::NotAuthenticated), Some(ended));

        assert_eq!(
            failure_hint(&SessionError::TransportFailure {
                message: "offline".to_string(),
            }),
            None
        );
    }
}

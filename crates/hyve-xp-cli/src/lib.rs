//! Command surface for Buzz Points.
//!
//! Hosts embed this crate through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a single [`Command`] against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteXpStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use hyve_xp_core::{
    award_xp, sanitize_xp, EventId, LevelCurve, LevelInfo, Session, UserId, XpPolicy,
};
use hyve_xp_store_sqlite::{ConnectionRequest, SqliteXpStore};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const LEVEL_INFO_CONTRACT_VERSION: &str = "level_info.v1";

#[derive(Debug, Parser)]
#[command(name = "hyve-xp")]
#[command(about = "Hyve Buzz Points CLI")]
pub struct Cli {
    #[arg(long, default_value = "./hyve_xp.sqlite3")]
    db: PathBuf,

    /// JSON file overriding the built-in v1 award policy.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Level {
        #[command(subcommand)]
        command: LevelCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    Award {
        #[command(subcommand)]
        command: AwardCommand,
    },
    Connect {
        #[command(subcommand)]
        command: ConnectCommand,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum LevelCommand {
    Show(LevelShowArgs),
}

#[derive(Debug, Args)]
pub struct LevelShowArgs {
    #[arg(long, allow_hyphen_values = true)]
    xp: f64,
    #[arg(long)]
    base: Option<u64>,
    #[arg(long)]
    increment: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Create(UserArgs),
    Show(UserArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    /// Issue (or rotate) the check-in token for an event you host.
    EnableAttendance(EventAttendanceArgs),
}

#[derive(Debug, Args)]
pub struct EventAttendanceArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    event: String,
}

#[derive(Debug, Subcommand)]
pub enum AwardCommand {
    Host(AwardHostArgs),
    CheckIn(AwardCheckInArgs),
    Xp(AwardXpArgs),
}

#[derive(Debug, Args)]
pub struct AwardHostArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    event: String,
    #[arg(long)]
    title: String,
}

#[derive(Debug, Args)]
pub struct AwardCheckInArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    event: String,
    /// Token from the event's check-in link.
    #[arg(long)]
    token: String,
}

#[derive(Debug, Args)]
pub struct AwardXpArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    amount: u64,
}

#[derive(Debug, Subcommand)]
pub enum ConnectCommand {
    Request(ConnectRequestArgs),
    Accept(ConnectResolveArgs),
    Decline(ConnectResolveArgs),
    Remove(ConnectRemoveArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
pub struct ConnectRequestArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
pub struct ConnectResolveArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    request: String,
}

#[derive(Debug, Args)]
pub struct ConnectRemoveArgs {
    #[arg(long = "as")]
    as_user: String,
    #[arg(long)]
    peer: String,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LevelInfoJsonPayload {
    contract_version: String,
    curve: LevelCurve,
    level: LevelInfo,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionListPayload {
    user_id: UserId,
    connections: Vec<UserId>,
    pending_requests: Vec<ConnectionRequest>,
}

/// Installs the stderr log subscriber. Safe to call more than once.
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the policy file is invalid, the store cannot be
/// opened or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let policy = load_policy(cli.policy.as_deref())?;
    run_with_db(&cli.db, &policy, cli.command)
}

/// Executes a command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, policy: &XpPolicy, command: Command) -> Result<()> {
    match command {
        Command::Level { command } => run_level(command, policy),
        Command::Policy { command } => run_policy(command, policy),
        command => {
            let mut store = SqliteXpStore::open(db_path)?;
            store.migrate()?;
            run_command(command, &mut store, policy)
        }
    }
}

/// Executes a command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, persistence, or award
/// operations fail.
pub fn run_command(command: Command, store: &mut SqliteXpStore, policy: &XpPolicy) -> Result<()> {
    match command {
        Command::Level { command } => run_level(command, policy),
        Command::Policy { command } => run_policy(command, policy),
        Command::Profile { command } => run_profile(command, store, policy),
        Command::Event { command } => run_event(command, store),
        Command::Award { command } => run_award(command, store, policy),
        Command::Connect { command } => run_connect(command, store, policy),
    }
}

/// Loads a policy file, falling back to [`XpPolicy::v1`].
///
/// # Errors
/// Returns an error when the file cannot be read or holds an invalid policy.
pub fn load_policy(path: Option<&Path>) -> Result<XpPolicy> {
    let Some(path) = path else {
        return Ok(XpPolicy::v1());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("policy file {} is not valid JSON", path.display()))?;
    XpPolicy::from_json(&value).map_err(|err| anyhow!("invalid policy {}: {err}", path.display()))
}

fn run_level(command: LevelCommand, policy: &XpPolicy) -> Result<()> {
    match command {
        LevelCommand::Show(args) => {
            let defaults = policy.curve();
            let curve = LevelCurve::new(
                args.base.unwrap_or(defaults.base),
                args.increment.unwrap_or(defaults.increment),
            );
            let info = curve.level_for(sanitize_xp(args.xp));

            if args.json {
                let payload = build_level_info_json_payload(curve, info);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_level_info(curve, &info);
            }
            Ok(())
        }
    }
}

fn run_policy(command: PolicyCommand, policy: &XpPolicy) -> Result<()> {
    match command {
        PolicyCommand::Show => {
            println!("{}", serde_json::to_string_pretty(policy)?);
            Ok(())
        }
    }
}

fn run_profile(command: ProfileCommand, store: &SqliteXpStore, policy: &XpPolicy) -> Result<()> {
    match command {
        ProfileCommand::Create(args) => {
            let user_id = parse_user_id(&args.user)?;
            let provision = store.provision_profile(&user_id, policy.signup_bonus)?;
            println!("{}", serde_json::to_string_pretty(&provision)?);
            Ok(())
        }
        ProfileCommand::Show(args) => {
            let user_id = parse_user_id(&args.user)?;
            let Some(snapshot) = store.profile(&user_id, policy.curve())? else {
                return Err(anyhow!("profile not found for {user_id}"));
            };
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteXpStore) -> Result<()> {
    match command {
        EventCommand::EnableAttendance(args) => {
            let session = begin_session(&args.as_user)?;
            let event_id = parse_event_id(&args.event)?;
            let token = store.enable_attendance(&session, &event_id)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&token)?);
            Ok(())
        }
    }
}

fn run_award(command: AwardCommand, store: &mut SqliteXpStore, policy: &XpPolicy) -> Result<()> {
    match command {
        AwardCommand::Host(args) => {
            let session = begin_session(&args.as_user)?;
            let event_id = parse_event_id(&args.event)?;
            let outcome = store.host_event(&session, policy, &event_id, &args.title)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        AwardCommand::CheckIn(args) => {
            let session = begin_session(&args.as_user)?;
            let event_id = parse_event_id(&args.event)?;
            let outcome = store.check_in(&session, policy, &event_id, &args.token)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        AwardCommand::Xp(args) => {
            let user_id = parse_user_id(&args.user)?;
            let award = award_xp(store, &user_id, args.amount)?;
            println!("{}", serde_json::to_string_pretty(&award)?);
            Ok(())
        }
    }
}

fn run_connect(
    command: ConnectCommand,
    store: &mut SqliteXpStore,
    policy: &XpPolicy,
) -> Result<()> {
    match command {
        ConnectCommand::Request(args) => {
            let session = begin_session(&args.as_user)?;
            let recipient = parse_user_id(&args.to)?;
            let request = store.request_connection(&session, &recipient)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        ConnectCommand::Accept(args) => {
            let session = begin_session(&args.as_user)?;
            let request_id = parse_request_id(&args.request)?;
            let acceptance = store.accept_connection(&session, policy, request_id)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&acceptance)?);
            Ok(())
        }
        ConnectCommand::Decline(args) => {
            let session = begin_session(&args.as_user)?;
            let request_id = parse_request_id(&args.request)?;
            let request = store.decline_connection(&session, request_id)?;
            end_session(session);
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        ConnectCommand::Remove(args) => {
            let session = begin_session(&args.as_user)?;
            let peer = parse_user_id(&args.peer)?;
            let removed = store.disconnect(&session, &peer)?;
            end_session(session);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "peer_id": peer,
                    "removed": removed,
                }))?
            );
            Ok(())
        }
        ConnectCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let payload = ConnectionListPayload {
                connections: store.list_connections(&user_id)?,
                pending_requests: store.pending_requests_for(&user_id)?,
                user_id,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn begin_session(raw: &str) -> Result<Session> {
    Ok(Session::begin(parse_user_id(raw)?))
}

fn end_session(session: Session) {
    let summary = session.end();
    tracing::debug!(
        user_id = %summary.user_id,
        elapsed_secs = (summary.ended_at - summary.started_at).as_seconds_f64(),
        "session closed"
    );
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid user id: {err}"))
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    EventId::parse(raw).map_err(|err| anyhow!("invalid event id: {err}"))
}

fn parse_request_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid request id (ULID): {raw}"))
}

fn print_level_info(curve: LevelCurve, info: &LevelInfo) {
    println!("curve: base={} increment={}", curve.base, curve.increment);
    println!(
        "{:<7} {:<12} {:<14} {:<14} {:<10} {:<10} progress",
        "level", "total_xp", "level_floor", "next_floor", "into", "band"
    );
    println!("{}", "-".repeat(84));
    println!(
        "{:<7} {:<12} {:<14} {:<14} {:<10} {:<10} {:.3}",
        info.level,
        info.total_xp,
        info.current_level_floor,
        info.next_level_floor,
        info.xp_into_level,
        info.xp_to_next,
        info.progress
    );
}

fn build_level_info_json_payload(curve: LevelCurve, info: LevelInfo) -> LevelInfoJsonPayload {
    LevelInfoJsonPayload {
        contract_version: LEVEL_INFO_CONTRACT_VERSION.to_string(),
        curve,
        level: info,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use hyve_xp_core::XpStore;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn user(raw: &str) -> UserId {
        must(parse_user_id(raw))
    }

    #[test]
    fn level_payload_carries_contract_version() {
        let curve = LevelCurve::default();
        let payload = build_level_info_json_payload(curve, curve.level_for(224));
        let value = must(serde_json::to_value(&payload).map_err(Into::into));

        assert_eq!(value["contract_version"], serde_json::json!("level_info.v1"));
        assert_eq!(value["level"]["level"], serde_json::json!(1));
        assert_eq!(value["level"]["xp_into_level"], serde_json::json!(124));
        assert_eq!(value["curve"]["increment"], serde_json::json!(25));
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(parse_user_id("  ").is_err());
        assert!(parse_event_id("").is_err());
        assert!(parse_request_id("not-a-ulid").is_err());
    }

    #[test]
    fn load_policy_defaults_to_v1() {
        assert_eq!(must(load_policy(None)), XpPolicy::v1());
    }

    #[test]
    fn load_policy_reads_and_validates_file() {
        let path = std::env::temp_dir().join(format!("hyve-xp-policy-{}.json", Ulid::new()));
        let mut policy = XpPolicy::v1();
        policy.policy_version = 2;
        policy.event_check_in_award = 30;
        must(fs::write(&path, must(serde_json::to_string(&policy).map_err(Into::into))).map_err(Into::into));
        assert_eq!(must(load_policy(Some(&path))), policy);

        policy.connection_award = 0;
        must(fs::write(&path, must(serde_json::to_string(&policy).map_err(Into::into))).map_err(Into::into));
        assert!(load_policy(Some(&path)).is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn level_show_runs_without_database() {
        let db_path = std::env::temp_dir().join(format!("hyve-xp-unused-{}.sqlite3", Ulid::new()));
        let db = db_path.to_string_lossy().to_string();
        must(execute_cli(&["hyve-xp", "--db", &db, "level", "show", "--xp", "-5"]));
        must(execute_cli(&[
            "hyve-xp", "--db", &db, "level", "show", "--xp", "224.7", "--json",
        ]));
        assert!(!db_path.exists());
    }

    #[test]
    fn cli_end_to_end_host_check_in_and_connect() {
        let db_path = std::env::temp_dir().join(format!("hyve-xp-e2e-{}.sqlite3", Ulid::new()));
        let db = db_path.to_string_lossy().to_string();

        for name in ["alice", "bob"] {
            must(execute_cli(&["hyve-xp", "--db", &db, "profile", "create", "--user", name]));
        }

        must(execute_cli(&[
            "hyve-xp", "--db", &db, "award", "host", "--as", "alice", "--event", "ev-1",
            "--title", "Rooftop mixer",
        ]));
        assert!(execute_cli(&[
            "hyve-xp", "--db", &db, "award", "check-in", "--as", "bob", "--event", "ev-1",
            "--token", "guess",
        ])
        .is_err());

        let mut store = must(SqliteXpStore::open(&db_path));
        must(store.migrate());
        let token = must(store.enable_attendance(
            &Session::begin(user("alice")),
            &must(parse_event_id("ev-1")),
        ))
        .attend_token;
        for _ in 0..2 {
            must(execute_cli(&[
                "hyve-xp", "--db", &db, "award", "check-in", "--as", "bob", "--event", "ev-1",
                "--token", &token,
            ]));
        }
        must(execute_cli(&[
            "hyve-xp", "--db", &db, "connect", "request", "--as", "bob", "--to", "alice",
        ]));

        let pending = must(store.pending_requests_for(&user("alice")));
        assert_eq!(pending.len(), 1);
        let request_id = pending[0].request_id.to_string();

        assert!(execute_cli(&[
            "hyve-xp", "--db", &db, "connect", "accept", "--as", "bob", "--request", &request_id,
        ])
        .is_err());
        must(execute_cli(&[
            "hyve-xp", "--db", &db, "connect", "accept", "--as", "alice", "--request", &request_id,
        ]));
        must(execute_cli(&["hyve-xp", "--db", &db, "profile", "show", "--user", "bob"]));

        // alice: 50 signup + 50 hosting + 10 connection; bob: 50 + 25 + 10.
        assert_eq!(store.read_xp(&user("alice")).ok(), Some(110));
        assert_eq!(store.read_xp(&user("bob")).ok(), Some(85));
        let info = XpPolicy::v1().curve().level_for(110);
        assert_eq!(info.level, 1);

        must(run_command(
            Command::Award {
                command: AwardCommand::Xp(AwardXpArgs {
                    user: "bob".to_string(),
                    amount: 15,
                }),
            },
            &mut store,
            &XpPolicy::v1(),
        ));
        assert_eq!(store.read_xp(&user("bob")).ok(), Some(100));

        drop(store);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn missing_profile_is_reported() {
        let db_path = std::env::temp_dir().join(format!("hyve-xp-missing-{}.sqlite3", Ulid::new()));
        let db = db_path.to_string_lossy().to_string();

        let result = execute_cli(&["hyve-xp", "--db", &db, "profile", "show", "--user", "ghost"]);
        match result {
            Ok(()) => panic!("expected missing profile to fail"),
            Err(err) => assert!(err.to_string().contains("profile not found")),
        }
        let _ = fs::remove_file(&db_path);
    }
}

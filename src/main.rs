#![allow(clippy::print_stderr, clippy::print_stdout)]

//! CLI entrypoint for `revlock` (catalog review reservations).
//!
//! The reservation logic lives in the `revlock` library crate (`src/reservation.rs`,
//! `src/session.rs`, etc); this binary wires it to a shared store directory.

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use revlock::activity::ActivityConfig;
use revlock::clock::{format_ts, Clock, SystemClock};
use revlock::config::Settings;
use revlock::id;
use revlock::identity::{Credential, Reviewer};
use revlock::item::{Decision, Filter, ItemKind, ReviewStatus, ReviewableItem};
use revlock::paths;
use revlock::reservation::{
    ClaimParams, DecideParams, ExtendParams, LockWrite, ReservationConfig, ReservationManager,
};
use revlock::session::{self, Navigator, RedirectReason, ReviewSession, SessionEvent, Step};
use revlock::stats::{self, QueueSummary, ReviewerStats};
use revlock::store::{JsonFileStore, RecordStore};
use serde::Serialize;
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc;
use time::{Duration, OffsetDateTime};
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "revlock",
    version,
    about = "Catalog review reservation utilities",
    long_about = "Catalog review reservation utilities.\n\n\
`revlock` manages a shared *store directory* containing `items.json` and its write lock.\n\
Reviewers claim items for a few minutes at a time; a claim that is not extended simply expires.\n\
All writers acquire `items.json.lock` and replace `items.json` via an atomic temp-file rename.\n\n\
Use `--json` for machine-readable output.\n\
Without `--json`, most commands print compact one-line JSON; `id` commands print raw ids, \
`item show` prints one field per line, and successful mutations print `ok`.",
    after_long_help = r#"Store directory layout (relative to repo root):
  .local/catalog_review/
    items.json
    items.json.lock

Environment variables (optional; only read when `--use-env` is passed):
  REVLOCK_STORE_DIR            Store directory (default: <git root or cwd>/.local/catalog_review)
  REVLOCK_REVIEWER             Reviewer identity for claim/extend/decide/queue/session
  REVLOCK_LOCK_TTL_SECS        Lease length in seconds (default: 180)
  REVLOCK_SWEEP_AFTER_SECS     Clear leases expired longer than this (default: 600)
  REVLOCK_IDLE_TIMEOUT_SECS    Session idle timeout in seconds (default: 180)
  REVLOCK_WARNING_SECS         Countdown shown before the idle timeout (default: 60)
  REVLOCK_POLL_MS              Session poll interval in milliseconds (default: 1000)
  REVLOCK_QUEUE_BATCH          Queue candidates read per batch (default: 50)
  REVLOCK_CREDENTIAL_TTL_MINS  Credential lifetime in minutes (default: 50)

Common flows:
  revlock item add --kind image --title "Front shot"
  revlock queue next --reviewer anna@example.com --kind image
  revlock decide --id <ITEM> --reviewer anna@example.com --decision approved
  revlock session watch --reviewer anna@example.com --kind image
"#
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value_t = false,
        help = "Emit pretty JSON (suitable for scripting)."
    )]
    json: bool,
    #[arg(
        long,
        global = true,
        default_value_t = false,
        help = "Read REVLOCK_* environment variables for default values (opt-in)."
    )]
    use_env: bool,
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Store directory containing `items.json`."
    )]
    store_dir: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Log more to stderr (-v info, -vv debug)."
    )]
    verbose: u8,
    #[command(flatten)]
    timing: TimingArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct TimingArgs {
    #[arg(long, global = true, value_name = "SECS", help = "Lease length in seconds.")]
    lock_ttl_secs: Option<i64>,
    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Sweep leases expired longer than this."
    )]
    sweep_after_secs: Option<i64>,
    #[arg(long, global = true, value_name = "SECS", help = "Session idle timeout.")]
    idle_timeout_secs: Option<i64>,
    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Countdown shown before the idle timeout."
    )]
    warning_secs: Option<i64>,
    #[arg(long, global = true, value_name = "MS", help = "Session poll interval in milliseconds.")]
    poll_ms: Option<u64>,
    #[arg(long, global = true, value_name = "N", help = "Queue candidates read per batch.")]
    queue_batch: Option<usize>,
    #[arg(long, global = true, value_name = "MINS", help = "Credential lifetime in minutes.")]
    credential_ttl_mins: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random ids.
    Id {
        #[command(subcommand)]
        command: IdCommands,
    },
    /// Add and inspect items.
    Item {
        #[command(subcommand)]
        command: ItemCommands,
    },
    /// Claim an item for review.
    Claim {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Renew the lease on an item.
    Extend {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Drop the lease on an item.
    Release {
        #[arg(long)]
        id: String,
    },
    /// Record a decision (also releases the lease).
    Decide {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        decision: Decision,
    },
    /// Put a decided item back in the queue.
    Reset {
        #[arg(long)]
        id: String,
    },
    /// Work with the review queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Clear leases that expired long ago.
    Sweep,
    /// Per-reviewer decision tallies and queue totals.
    Stats {
        #[arg(long)]
        kind: Option<ItemKind>,
    },
    /// Interactive review session with an idle timeout.
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum IdCommands {
    /// Generate an 8-character ASCII id (hex).
    Id8,
    /// Generate a lowercase hex id of length 2*bytes.
    Hex {
        #[arg(
            long,
            value_name = "N",
            help = "Number of random bytes; output length is 2*N hex characters."
        )]
        bytes: usize,
    },
}

#[derive(Subcommand)]
enum ItemCommands {
    /// Ingest a new, undecided item.
    Add {
        #[arg(long, help = "Item id (default: generated).")]
        id: Option<String>,
        #[arg(long)]
        kind: ItemKind,
        #[arg(long)]
        title: Option<String>,
    },
    /// Print one item.
    Show {
        #[arg(long)]
        id: String,
    },
    /// List items matching all given filters.
    List {
        #[arg(long)]
        status: Option<ReviewStatus>,
        #[arg(long)]
        kind: Option<ItemKind>,
        #[arg(long)]
        decided_by: Option<String>,
        #[arg(long, default_value_t = false, help = "Only items with a live lease.")]
        locked_only: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Claim the next free, undecided item.
    Next {
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        kind: Option<ItemKind>,
    },
    /// Count items still waiting for a decision.
    Remaining {
        #[arg(long)]
        kind: Option<ItemKind>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Review the queue interactively; commands are read from stdin.
    #[command(after_long_help = r#"Commands (one per line):
  extend   renew the lease and reset the idle timer
  approve  approve the open item
  reject   reject the open item
  replace  mark the open item as needing a replacement asset
  next     release the open item and take the next one
  quit     release the open item and exit
"#)]
    Watch {
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        kind: Option<ItemKind>,
    },
}

#[derive(Debug, Serialize)]
struct OkResult {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct LockWriteResult<'a> {
    item_id: &'a str,
    write: LockWrite,
}

#[derive(Debug, Serialize)]
struct SweepResult {
    cleared: usize,
}

#[derive(Debug, Serialize)]
struct RemainingResult {
    remaining: usize,
}

#[derive(Debug, Serialize)]
struct StatsResult {
    reviewers: Vec<ReviewerStats>,
    queue: QueueSummary,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;
    let use_env = cli.use_env;
    let now = OffsetDateTime::now_utc();

    if let Commands::Id { command } = &cli.command {
        let out = match command {
            IdCommands::Id8 => id::random_id8()?,
            IdCommands::Hex { bytes } => id::random_hex_id(*bytes)?,
        };
        if json {
            write_json(&out)?;
        } else {
            println!("{out}");
        }
        return Ok(());
    }

    let settings = resolve_settings(use_env, &cli.timing)?;
    let cwd = std::env::current_dir().context("get cwd")?;
    let store_dir = resolve_store_dir(use_env, cli.store_dir.clone(), &cwd);
    let store = JsonFileStore::open(&store_dir)?;
    tracing::info!(items = %store.items_file().display(), "store opened");
    let manager = ReservationManager::new(store, settings.reservation);

    match cli.command {
        Commands::Id { .. } => {}

        Commands::Item { command } => match command {
            ItemCommands::Add { id, kind, title } => {
                let id = match id {
                    Some(id) => id,
                    None => id::new_item_id()?,
                };
                id::validate_item_id(&id)?;
                let item = ReviewableItem::new(id, kind, title, now);
                manager.store().insert(item.clone())?;
                write_result(json, &item)?;
            }
            ItemCommands::Show { id } => {
                let item = manager
                    .store()
                    .get(&id)?
                    .ok_or_else(|| anyhow::anyhow!("item not found: {id}"))?;
                if json {
                    write_json(&item)?;
                } else {
                    println!("{}", describe_item(&item, now)?);
                }
            }
            ItemCommands::List {
                status,
                kind,
                decided_by,
                locked_only,
                limit,
            } => {
                let filter = list_filter(status, kind, decided_by, locked_only, now);
                let items = manager.store().query(&filter, limit)?;
                write_result(json, &items)?;
            }
        },

        Commands::Claim { id, reviewer } => {
            let reviewer = resolve_reviewer(reviewer, use_env)?;
            let outcome = manager.claim(&ClaimParams {
                item_id: &id,
                reviewer: &reviewer,
                now,
                ttl: settings.reservation.lock_ttl,
            });
            write_result(json, &outcome)?;
        }

        Commands::Extend { id, reviewer } => {
            let reviewer = resolve_reviewer(reviewer, use_env)?;
            let write = manager.extend(&ExtendParams {
                item_id: &id,
                reviewer: &reviewer,
                now,
                ttl: settings.reservation.lock_ttl,
            });
            write_result(json, &LockWriteResult { item_id: &id, write })?;
        }

        Commands::Release { id } => {
            let write = manager.release(&id, now);
            if write == LockWrite::Failed {
                return Err(anyhow::anyhow!("release of {id} failed; see log"));
            }
            write_ok(json)?;
        }

        Commands::Decide {
            id,
            reviewer,
            decision,
        } => {
            let reviewer = resolve_reviewer(reviewer, use_env)?;
            let item = manager.decide(&DecideParams {
                item_id: &id,
                reviewer: &reviewer,
                decision,
                now,
            })?;
            write_result(json, &item)?;
        }

        Commands::Reset { id } => {
            let item = manager.reset_decision(&id, now)?;
            write_result(json, &item)?;
        }

        Commands::Queue { command } => match command {
            QueueCommands::Next { reviewer, kind } => {
                let reviewer = resolve_reviewer(reviewer, use_env)?;
                let next = manager.next_available(kind, &reviewer, now)?;
                write_result(json, &next)?;
            }
            QueueCommands::Remaining { kind } => {
                let remaining = manager.remaining(kind)?;
                write_result(json, &RemainingResult { remaining })?;
            }
        },

        Commands::Sweep => {
            let cleared = manager.sweep(now)?;
            write_result(json, &SweepResult { cleared })?;
        }

        Commands::Stats { kind } => {
            let result = StatsResult {
                reviewers: stats::decision_stats(manager.store(), kind)?,
                queue: stats::queue_summary(manager.store(), kind, now)?,
            };
            write_result(json, &result)?;
        }

        Commands::Session { command } => match command {
            SessionCommands::Watch { reviewer, kind } => {
                let reviewer = resolve_reviewer(reviewer, use_env)?;
                watch(&manager, &settings, reviewer, kind, json)?;
            }
        },
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn describe_item(item: &ReviewableItem, now: OffsetDateTime) -> anyhow::Result<String> {
    let ts = |value: Option<OffsetDateTime>| value.map_or_else(|| Ok("-".to_string()), format_ts);
    let lease = match item.locked_until {
        Some(until) if item.is_locked(now) => format!("{} (held)", format_ts(until)?),
        Some(until) => format!("{} (expired)", format_ts(until)?),
        None => "-".to_string(),
    };
    let lines = [
        format!("id:           {}", item.id),
        format!("kind:         {}", item.kind.as_str()),
        format!("title:        {}", item.title.as_deref().unwrap_or("-")),
        format!("status:       {}", item.review_status.as_str()),
        format!("locked_until: {lease}"),
        format!("decided_by:   {}", item.decided_by.as_deref().unwrap_or("-")),
        format!("decided_at:   {}", ts(item.decided_at)?),
        format!("updated_at:   {}", format_ts(item.updated_at)?),
    ];
    Ok(lines.join("\n"))
}

fn list_filter(
    status: Option<ReviewStatus>,
    kind: Option<ItemKind>,
    decided_by: Option<String>,
    locked_only: bool,
    now: OffsetDateTime,
) -> Filter {
    let mut filter = Filter::All.and_kind(kind);
    if let Some(status) = status {
        filter = filter.and(Filter::Status(status));
    }
    if let Some(decided_by) = decided_by {
        filter = filter.and(Filter::DecidedBy(decided_by));
    }
    if locked_only {
        filter = filter.and(Filter::locked_at(now));
    }
    filter
}

/// Prints a notice on stderr; the terminal has nowhere else to go.
struct StderrNavigator;

impl Navigator for StderrNavigator {
    fn redirect(&mut self, reason: RedirectReason) {
        match reason {
            RedirectReason::Idle => {
                eprintln!("session ended after inactivity; your open item was released");
            }
        }
    }
}

fn watch<S: RecordStore>(
    manager: &ReservationManager<S>,
    settings: &Settings,
    reviewer: Reviewer,
    kind: Option<ItemKind>,
    json: bool,
) -> anyhow::Result<()> {
    let clock = SystemClock;
    let start = clock.now();
    let credential = Credential::issue(reviewer, start, settings.credential_ttl);
    let mut session =
        ReviewSession::new(manager, credential, StderrNavigator, settings.activity, start);

    match session.open_next(kind, start)? {
        Some(queued) => write_result(json, &queued)?,
        None => {
            eprintln!("nothing left to review");
            return Ok(());
        }
    }

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_session_command(&line, kind) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
    });

    let end = session::drive(
        &mut session,
        &clock,
        &rx,
        settings.activity.poll_interval,
        |step| {
            if let Err(err) = report_step(json, step) {
                eprintln!("{err:?}");
            }
        },
    );
    write_result(json, &json!({ "end": end }))
}

fn report_step(json: bool, step: Step) -> anyhow::Result<()> {
    match step {
        Step::Opened(queued) => write_result(json, &queued),
        Step::QueueEmpty => {
            eprintln!("nothing left to review");
            Ok(())
        }
        Step::Extended(write) => write_result(json, &json!({ "extended": write })),
        Step::Decided(item) => write_result(json, &item),
        Step::Failed(err) => {
            eprintln!("{err:#}");
            Ok(())
        }
        Step::Changed(transition) => {
            tracing::debug!(from = ?transition.from, to = ?transition.to, "idle state changed");
            Ok(())
        }
        Step::Countdown(left) => {
            eprint!("\ridle: {}s left (type `extend` to stay)   ", left.whole_seconds());
            std::io::stderr().flush().context("flush stderr")
        }
        Step::Closed => Ok(()),
    }
}

fn parse_session_command(
    line: &str,
    kind: Option<ItemKind>,
) -> anyhow::Result<Option<SessionEvent>> {
    let event = match line.trim() {
        "" => return Ok(None),
        "extend" | "e" => SessionEvent::Extend,
        "approve" | "a" => SessionEvent::Decide(Decision::Approved),
        "reject" | "r" => SessionEvent::Decide(Decision::Rejected),
        "replace" => SessionEvent::Decide(Decision::NeedsReplacement),
        "next" | "n" => SessionEvent::OpenNext(kind),
        "quit" | "q" => SessionEvent::Close,
        other => return Err(anyhow::anyhow!("unknown command: {other}")),
    };
    Ok(Some(event))
}

fn discover_repo_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        if current.join(".git").exists() {
            return Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    None
}

fn resolve_store_dir(use_env: bool, explicit: Option<PathBuf>, cwd: &Path) -> PathBuf {
    explicit
        .or_else(|| opt_env_pathbuf(use_env, "REVLOCK_STORE_DIR"))
        .unwrap_or_else(|| {
            let root = discover_repo_root(cwd).unwrap_or_else(|| cwd.to_path_buf());
            paths::default_store_dir(&root)
        })
}

fn resolve_settings(use_env: bool, args: &TimingArgs) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let secs = |flag: Option<i64>, key: &str, default: Duration| -> anyhow::Result<Duration> {
        Ok(match flag.or(opt_env_parse(use_env, key)?) {
            Some(secs) => Duration::seconds(secs),
            None => default,
        })
    };

    let poll_interval = match args.poll_ms.or(opt_env_parse(use_env, "REVLOCK_POLL_MS")?) {
        Some(ms) => std::time::Duration::from_millis(ms),
        None => defaults.activity.poll_interval,
    };
    let credential_ttl = match args
        .credential_ttl_mins
        .or(opt_env_parse(use_env, "REVLOCK_CREDENTIAL_TTL_MINS")?)
    {
        Some(mins) => mins
            .checked_mul(60)
            .map(Duration::seconds)
            .ok_or_else(|| anyhow::anyhow!("credential ttl of {mins} minutes is out of range"))?,
        None => defaults.credential_ttl,
    };

    let settings = Settings {
        reservation: ReservationConfig {
            lock_ttl: secs(
                args.lock_ttl_secs,
                "REVLOCK_LOCK_TTL_SECS",
                defaults.reservation.lock_ttl,
            )?,
            sweep_after: secs(
                args.sweep_after_secs,
                "REVLOCK_SWEEP_AFTER_SECS",
                defaults.reservation.sweep_after,
            )?,
            queue_batch: args
                .queue_batch
                .or(opt_env_parse(use_env, "REVLOCK_QUEUE_BATCH")?)
                .unwrap_or(defaults.reservation.queue_batch),
        },
        activity: ActivityConfig {
            timeout: secs(
                args.idle_timeout_secs,
                "REVLOCK_IDLE_TIMEOUT_SECS",
                defaults.activity.timeout,
            )?,
            warning_window: secs(
                args.warning_secs,
                "REVLOCK_WARNING_SECS",
                defaults.activity.warning_window,
            )?,
            poll_interval,
        },
        credential_ttl,
    };
    settings.validate()?;
    Ok(settings)
}

fn resolve_reviewer(value: Option<String>, use_env: bool) -> anyhow::Result<Reviewer> {
    let raw = require_arg_or_env(value, use_env, "REVLOCK_REVIEWER", "--reviewer")?;
    Reviewer::new(raw)
}

fn opt_env_string(use_env: bool, key: &str) -> Option<String> {
    if !use_env {
        return None;
    }
    std::env::var(key).ok()
}

fn opt_env_pathbuf(use_env: bool, key: &str) -> Option<PathBuf> {
    if !use_env {
        return None;
    }
    std::env::var_os(key).map(PathBuf::from)
}

fn opt_env_parse<T>(use_env: bool, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    opt_env_string(use_env, key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("parse {key}={raw:?}"))
        })
        .transpose()
}

fn require_arg_or_env(
    value: Option<String>,
    use_env: bool,
    env_key: &str,
    arg_flag: &str,
) -> anyhow::Result<String> {
    value
        .or_else(|| opt_env_string(use_env, env_key))
        .ok_or_else(|| {
            if use_env {
                anyhow::anyhow!(
                    "missing {arg_flag}; pass {arg_flag} (or set {env_key} and pass --use-env)"
                )
            } else {
                anyhow::anyhow!("missing {arg_flag}; pass {arg_flag}")
            }
        })
}

fn write_ok(json: bool) -> anyhow::Result<()> {
    if json {
        write_result(true, &OkResult { ok: true })
    } else {
        println!("ok");
        Ok(())
    }
}

fn write_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    let raw = serde_json::to_string_pretty(value).context("serialize JSON")?;
    stdout.write_all(raw.as_bytes()).context("write stdout")?;
    stdout.write_all(b"\n").context("write stdout newline")?;
    Ok(())
}

fn write_result<T: Serialize>(json: bool, value: &T) -> anyhow::Result<()> {
    if json {
        write_json(value)
    } else {
        // human output: best-effort JSON on one line.
        println!("{}", serde_json::to_string(value).context("serialize")?);
        Ok(())
    }
}

//! Operator CLI for replaying dead-lettered envelopes.
//!
//! Emits exactly one structured report line on stdout, prefixed
//! `[replay][PASS]` or `[replay][FAIL]`, and exits 0 on success (including
//! the idempotent no-op case) or non-zero on argument/database errors.

use std::env;

use delivery_outbox::{OutboxRepository, ReplaySelector, SqlxOutboxRepository};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

const USAGE: &str = "\
Usage: outbox-replay <selector> [options]

Selectors (exactly one):
  --event-id <id>       replay a single dead-letter event
  --session-id <id>     replay all dead-letter events of a session
  --all                 replay globally, bounded by --limit (default 20)

Options:
  --limit <n>           row bound, only valid with --all
  --replay-token <t>    idempotency token (auto-generated if omitted)
  --note <text>         operator note stored in the replay log
  --no-reset-attempts   keep attempts instead of resetting them to 0
  --dry-run             print the selection without updating anything

Environment:
  DATABASE_URL          PostgreSQL connection string (required)";

#[derive(Debug)]
struct ReplayArgs {
    selector: ReplaySelector,
    replay_token: String,
    note: Option<String>,
    reset_attempts: bool,
    dry_run: bool,
}

fn parse_args(args: &[String]) -> Result<ReplayArgs, String> {
    let mut event_id: Option<String> = None;
    let mut session_id: Option<String> = None;
    let mut all = false;
    let mut limit: Option<i64> = None;
    let mut replay_token: Option<String> = None;
    let mut note: Option<String> = None;
    let mut reset_attempts = true;
    let mut dry_run = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value_for = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };

        match arg.as_str() {
            "--event-id" => event_id = Some(value_for("--event-id")?),
            "--session-id" => session_id = Some(value_for("--session-id")?),
            "--all" => all = true,
            "--limit" => {
                let raw = value_for("--limit")?;
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| format!("--limit must be a positive integer, got {raw}"))?;
                if parsed <= 0 {
                    return Err(format!("--limit must be a positive integer, got {raw}"));
                }
                limit = Some(parsed);
            }
            "--replay-token" => replay_token = Some(value_for("--replay-token")?),
            "--note" => note = Some(value_for("--note")?),
            "--no-reset-attempts" => reset_attempts = false,
            "--dry-run" => dry_run = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let selector_count = usize::from(event_id.is_some())
        + usize::from(session_id.is_some())
        + usize::from(all);
    if selector_count != 1 {
        return Err("exactly one of --event-id, --session-id, --all is required".to_string());
    }
    if limit.is_some() && !all {
        return Err("--limit is only valid with --all".to_string());
    }

    let selector = if let Some(event_id) = event_id {
        ReplaySelector::EventId(event_id)
    } else if let Some(session_id) = session_id {
        ReplaySelector::Session(session_id)
    } else {
        ReplaySelector::All {
            limit: limit.unwrap_or(20),
        }
    };

    Ok(ReplayArgs {
        selector,
        replay_token: replay_token.unwrap_or_else(|| format!("replay-{}", Uuid::new_v4())),
        note,
        reset_attempts,
        dry_run,
    })
}

async fn run(args: ReplayArgs, database_url: &str) -> anyhow::Result<delivery_outbox::ReplayReport> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await?;

    let repository = SqlxOutboxRepository::new(pool);
    let report = repository
        .replay(
            &args.selector,
            &args.replay_token,
            args.note.as_deref(),
            args.reset_attempts,
            args.dry_run,
        )
        .await?;

    Ok(report)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let parsed = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            println!("[replay][FAIL] {}", serde_json::json!({"error": "DATABASE_URL is not set"}));
            std::process::exit(1);
        }
    };

    match run(parsed, &database_url).await {
        Ok(report) => {
            let line = serde_json::to_string(&report)
                .unwrap_or_else(|e| format!("{{\"error\":\"report serialization failed: {e}\"}}"));
            println!("[replay][PASS] {line}");
        }
        Err(e) => {
            println!("[replay][FAIL] {}", serde_json::json!({"error": e.to_string()}));
            std::process::exit(1);
        }
    }
}

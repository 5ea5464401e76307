mod sample;

use std::fmt;
use std::io::{self, BufRead, Write};

use kioku_core::model::{Unit, UserId};
use services::{ReviewFilters, SessionError, StudyService, StudySettings, TaskStatus};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_DB_URL: &str = "sqlite://kioku.sqlite3";
const DEFAULT_LOG_FILTER: &str = "kioku=info,services=info,storage=warn,kioku_core=warn";
const QUIT: &str = ":q";

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidUserId { raw: String },
    InvalidLevel { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid --user value: {raw}"),
            ArgsError::InvalidLevel { raw } => write!(f, "invalid --level value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  kioku review [--db <sqlite_url>] [--user <uuid>] [--level <n>]");
    eprintln!("  kioku learn  [--db <sqlite_url>] [--user <uuid>] [--level <n>]");
    eprintln!("  kioku seed   [--db <sqlite_url>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db {DEFAULT_DB_URL}");
    eprintln!("  --user 00000000-0000-0000-0000-000000000000 (local learner)");
    eprintln!();
    eprintln!("Type {QUIT} during a session to stop; again/fail counts as a miss.");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  KIOKU_DB_URL, KIOKU_USER_ID, KIOKU_BATCH_SIZE, KIOKU_DAILY_BATCH_LIMIT,");
    eprintln!("  KIOKU_REVIEW_LIMIT, KIOKU_BYPASS_TOKEN, KIOKU_SEED, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Review,
    Learn,
    Seed,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "review" => Some(Self::Review),
            "learn" => Some(Self::Learn),
            "seed" => Some(Self::Seed),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    user: UserId,
    level: Option<u32>,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("KIOKU_DB_URL")
            .ok()
            .map_or_else(|| DEFAULT_DB_URL.into(), normalize_sqlite_url);
        let mut user = match std::env::var("KIOKU_USER_ID") {
            Ok(raw) => parse_user(&raw)?,
            Err(_) => UserId::new(Uuid::nil()),
        };
        let mut level = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user" => {
                    let value = require_value(args, "--user")?;
                    user = parse_user(&value)?;
                }
                "--level" => {
                    let value = require_value(args, "--level")?;
                    let parsed = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|l| *l > 0)
                        .ok_or_else(|| ArgsError::InvalidLevel { raw: value.clone() })?;
                    level = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            user,
            level,
        })
    }
}

fn parse_user(raw: &str) -> Result<UserId, ArgsError> {
    raw.parse::<UserId>()
        .map_err(|_| ArgsError::InvalidUserId { raw: raw.to_owned() })
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Reads one trimmed line; `None` on end of input or the quit command.
fn prompt(lines: &mut impl Iterator<Item = io::Result<String>>, label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => {
            let line = line?;
            let line = line.trim();
            Ok((line != QUIT).then(|| line.to_owned()))
        }
        None => Ok(None),
    }
}

fn describe(unit: &Unit) {
    println!();
    println!("  {}  ({}, level {})", unit.character(), unit.unit_type().as_str(), unit.level());
    println!("  meaning: {}", unit.kind().meanings().join(", "));
    let readings = unit.kind().readings();
    if !readings.is_empty() {
        println!("  reading: {}", readings.join(", "));
    }
}

async fn review(
    service: &StudyService,
    args: &Args,
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let filters = ReviewFilters {
        level: args.level,
        ..ReviewFilters::default()
    };
    let started = match service.start_review_session(args.user, filters).await {
        Ok(started) => started,
        Err(SessionError::Empty) => {
            println!("Nothing is due. Come back later or run `kioku learn`.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("{} reviews due.", started.items.len());

    while let Some(item) = service.current_review_item(started.session_id).await? {
        println!();
        println!("[{}] {}", item.unit_type.as_str(), item.prompt);
        let Some(input) = prompt(lines, "> ")? else {
            service.abandon_review_session(started.session_id).await?;
            println!("Session stopped.");
            return Ok(());
        };
        let response = service
            .submit_review_answer(started.session_id, item.id, &input)
            .await?;
        if response.correct {
            println!("correct ({}/{})", response.progress.completed, response.progress.total);
        } else {
            println!("not quite; accepted: {}", item.answers.accepted().join(", "));
        }
        if response.is_complete {
            if let Some(done) = response.completed_at {
                let minutes = (done - started.started_at).num_minutes();
                println!();
                println!("Session complete: {} items in {minutes} min.", response.progress.total);
            }
            break;
        }
    }
    Ok(())
}

async fn learn(
    service: &StudyService,
    args: &Args,
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let started = match service.start_discovery_batch(args.user, args.level).await {
        Ok(started) => started,
        Err(SessionError::Empty) => {
            println!("No new units left at this level.");
            return Ok(());
        }
        Err(SessionError::DailyLimitReached { limit }) => {
            println!("You already started {limit} lesson batches today.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("Level {}: {} new units.", started.level, started.units.len());

    while let Some(unit) = service.current_lesson(started.batch_id).await? {
        describe(&unit);
        if prompt(lines, "(enter to continue) ")?.is_none() {
            service.abandon_discovery_batch(started.batch_id).await?;
            return Ok(());
        }
        service.advance_lesson(started.batch_id).await?;
    }

    let quiz = service.start_quiz(started.batch_id).await?;
    println!();
    println!("Quiz: {} questions.", quiz.len());
    while let Some(item) = service.current_quiz_item(started.batch_id).await? {
        println!();
        println!("[{}] {}", item.unit_type.as_str(), item.prompt);
        let Some(input) = prompt(lines, "> ")? else {
            service.abandon_discovery_batch(started.batch_id).await?;
            println!("Batch stopped; passed units keep their progress.");
            return Ok(());
        };
        let response = service
            .submit_discovery_answer(started.batch_id, item.id, &input)
            .await?;
        if response.correct {
            println!("correct ({}/{})", response.progress.completed, response.progress.total);
        } else {
            println!("not quite; accepted: {}", item.answers.accepted().join(", "));
        }
        if response.is_complete {
            println!();
            println!("Batch complete. First reviews unlock in a few hours.");
            break;
        }
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None => Command::Review,
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => Command::Review,
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            io::Error::new(io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };
    if !argv.is_empty() && !argv[0].starts_with("--") {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let args = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    init_tracing();
    let settings = StudySettings::from_env()?;
    prepare_sqlite_file(&args.db_url)?;
    let service = StudyService::new_sqlite(&args.db_url, settings).await?;
    tracing::debug!(db = %args.db_url, user = %args.user, ?cmd, "starting");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    match cmd {
        Command::Seed => {
            let units = sample::sample_units()?;
            for unit in &units {
                service.storage().content.upsert_unit(unit).await?;
            }
            println!("Seeded {} units into {}.", units.len(), args.db_url);
        }
        Command::Review => review(&service, &args, &mut lines).await?,
        Command::Learn => learn(&service, &args, &mut lines).await?,
    }

    let flush = service.retry_pending_writes().await;
    if flush.remaining > 0 {
        eprintln!("{} scheduling writes could not be saved.", flush.remaining);
    }
    for report in service.drain_tasks().await {
        match report.status {
            TaskStatus::Completed(detail) => println!("{}: {detail}", report.name),
            TaskStatus::Failed(detail) | TaskStatus::Aborted(detail) => {
                eprintln!("{} failed: {detail}", report.name);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

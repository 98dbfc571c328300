//! Network State Database
//!
//! Loads the state of one or more origins into the store and prints a view
//! of it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - File and command-line configuration

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use sonic_ndbsyncd::config::DEFAULT_CONFIG_PATH;
use sonic_ndbsyncd::types::record_to_string;
use sonic_ndbsyncd::{DbConfig, FieldMap, Ndb, NdbConfig, ObjectKind, Value};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Output format of the printed view
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Summary,
    Dump,
    Csv,
}

/// SONiC network state database
#[derive(Parser, Debug)]
#[command(name = "ndbsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Database: a sqlite file, ":memory:", or a postgres:// URL
    #[arg(long)]
    db: Option<String>,

    /// Origin to load from a JSON message file, as NAME=PATH
    #[arg(short = 's', long = "source", value_parser = parse_source)]
    sources: Vec<(String, PathBuf)>,

    /// View to print (interfaces, bridges, vlans, addresses, routes, neighbours)
    #[arg(short = 'v', long, default_value = "interfaces")]
    view: String,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "summary")]
    format: Format,

    /// Restrict dump and csv output to rows with FIELD=VALUE
    #[arg(short = 'm', long = "match", value_parser = parse_match)]
    matches: Vec<(String, Value)>,

    /// Mirror every inbound message into the rtnl_log table
    #[arg(long)]
    rtnl_log: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_source(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got '{}'", arg)),
    }
}

fn parse_match(arg: &str) -> Result<(String, Value), String> {
    let Some((field, value)) = arg.split_once('=') else {
        return Err(format!("expected FIELD=VALUE, got '{}'", arg));
    };
    let value = match value.parse::<i64>() {
        Ok(i) => Value::Integer(i),
        Err(_) => Value::from(value),
    };
    Ok((field.to_string(), value))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("ndbsyncd: Starting network state database");
    match run(args) {
        Ok(()) => {
            info!("ndbsyncd: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "ndbsyncd: Exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format with thread names
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

fn load_config(args: &Args) -> anyhow::Result<NdbConfig> {
    let mut config = match &args.config {
        Some(path) => NdbConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => NdbConfig::from_file(DEFAULT_CONFIG_PATH)?,
        None => NdbConfig::default(),
    };
    if let Some(db) = &args.db {
        config.db = if db.starts_with("postgres://") || db.starts_with("postgresql://") {
            DbConfig::Postgres { url: db.clone() }
        } else {
            DbConfig::Sqlite { spec: db.clone() }
        };
    }
    for (name, path) in &args.sources {
        config.sources.insert(name.clone(), path.clone());
    }
    config.rtnl_log |= args.rtnl_log;
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let Some(kind) = ObjectKind::from_view_name(&args.view) else {
        bail!("unknown view '{}'", args.view);
    };
    let matches: FieldMap = args.matches.into_iter().collect();
    if args.format == Format::Summary && !matches.is_empty() {
        bail!("--match applies to dump and csv output only");
    }

    let ndb = Ndb::new(config, Vec::new()).context("Failed to start the database")?;
    info!(sources = ?ndb.sources(), "ndbsyncd: Sources loaded");

    let view = ndb.view(kind);
    match args.format {
        Format::Summary => print_all(view.summary().iter(), |row| {
            record_to_string(&row)
        })?,
        Format::Dump => print_all(view.dump(&matches)?.iter(), |row| {
            record_to_string(&row)
        })?,
        Format::Csv => print_all(view.csv(&matches)?.iter(), |line| line)?,
    }

    ndb.close()?;
    Ok(())
}

/// Print every row; unlike the report preview this is not truncated
fn print_all<T>(
    rows: impl Iterator<Item = sonic_ndbsyncd::Result<T>>,
    render: impl Fn(T) -> String,
) -> anyhow::Result<()> {
    for row in rows {
        println!("{}", render(row?));
    }
    Ok(())
}

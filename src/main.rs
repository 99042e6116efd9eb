use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use stream_archiver::clock::SystemClock;
use stream_archiver::config::ArchiveConfig;
use stream_archiver::db;
use stream_archiver::indexer::Indexer;
use stream_archiver::retrieval::{self, RetrievalMode};
use stream_archiver::serve::serve_catalog;
use stream_archiver::watchdog::Watchdog;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Archive a segmented live audio stream and serve gapless time-range retrievals"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Promote finalized segments from the landing directory into the archive
    Watchdog {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Consume segment-ready events into the catalog database
    Index {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Serve the catalog query and retrieval API over HTTP
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Retrieve a time range from the archive into a local file
    Export {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Range start (RFC 3339, e.g. 2025-02-14T00:00:00Z)
        #[arg(long)]
        start: String,

        /// Range end (RFC 3339, exclusive)
        #[arg(long)]
        end: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Return available audio plus a gap report instead of failing on gaps
        #[arg(long)]
        best_effort: bool,
    },
    /// Create or upgrade the catalog database schema
    InitDb {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Command::Watchdog { config } => {
            let config = ArchiveConfig::load(&config)?;
            let watchdog = Watchdog::new(config, Arc::new(SystemClock))?;
            // Runs until the process is stopped; the supervisor restarts us
            let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
            watchdog.run(shutdown_rx);
            Ok(())
        }
        Command::Index { config } => {
            let config = ArchiveConfig::load(&config)?;
            let mut indexer = Indexer::new(config)?;
            let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
            indexer.run(shutdown_rx);
            Ok(())
        }
        Command::Serve { config, port } => {
            let config = ArchiveConfig::load(&config)?;
            let port = port.unwrap_or(config.api_port);
            serve_catalog(config, port)
        }
        Command::Export {
            config,
            start,
            end,
            output,
            best_effort,
        } => export(&config, &start, &end, &output, best_effort),
        Command::InitDb { config } => {
            let config = ArchiveConfig::load(&config)?;
            std::fs::create_dir_all(&config.state_dir)?;
            let conn = db::open_database_connection(&config.db_path())?;
            db::init_schema(&conn)?;
            println!("Catalog schema ready: {}", config.db_path().display());
            Ok(())
        }
    }
}

// Export subcommand implementation
fn export(
    config_path: &PathBuf,
    start: &str,
    end: &str,
    output: &PathBuf,
    best_effort: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ArchiveConfig::load(config_path)?;

    let start = parse_rfc3339(start)?;
    let end = parse_rfc3339(end)?;
    let mode = if best_effort {
        RetrievalMode::BestEffort
    } else {
        RetrievalMode::Strict
    };

    let conn = db::open_readonly_connection(&config.db_path())?;
    db::check_version(&conn)?;

    // Operator tool: unpublished segments stay hidden here too
    let plan = retrieval::resolve_range(&conn, start, end, config.segment_duration(), false, mode)
        .map_err(|e| format!("{}", e))?;

    let file = File::create(output)?;
    let mut writer = BufWriter::new(file);
    let bytes = retrieval::concat_clips(&plan, &mut writer)?;
    writer.flush()?;

    println!(
        "Exported {} clips ({} bytes, {}s of audio) to {}",
        plan.clips.len(),
        bytes,
        plan.covered_duration().num_seconds(),
        output.display()
    );
    if !plan.gaps.is_empty() {
        println!("Coverage gaps skipped:");
        for gap in &plan.gaps {
            println!("  - {}", gap);
        }
    }
    Ok(())
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("Invalid instant '{}': {}", s, e))
}

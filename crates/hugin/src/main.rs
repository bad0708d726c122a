//! hugin: inspect and maintain multi-agent execution traces
//!
//! Hugin reads the traces an instrumented agent system stores under
//! `.hugin/traces/`, renders them as agent / stage / event hierarchies, and
//! prunes expired days.

mod config;
mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use hugin_trace::render;
use hugin_trace::storage::{self, SharedTraceStorage};
use hugin_trace::{
    FilesystemStorage, StorageKind, TraceCollector, TraceFilter, TraceHierarchy, TraceListing,
    TraceSource, TraceStorage,
};

/// Inspect and maintain multi-agent execution traces
#[derive(Parser)]
#[command(name = "hugin")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .hugin directory (default: search for .hugin/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trace storage directory (overrides config and HUGIN_TRACE_DIR)
    #[arg(long, global = true)]
    trace_dir: Option<PathBuf>,

    /// Log to .hugin/logs/ instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .hugin directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// List stored traces, newest first
    List {
        /// Only traces from this source
        #[arg(long, value_enum)]
        source: Option<SourceArg>,

        /// Only traces for this user
        #[arg(long)]
        user: Option<String>,

        /// Only traces for this test case
        #[arg(long)]
        test_case: Option<String>,

        /// Only traces for this session
        #[arg(long)]
        session: Option<String>,

        /// Maximum number of traces
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Number of traces to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one trace
    Show {
        /// Trace id
        trace_id: String,

        /// Output format
        #[arg(long, value_enum, default_value = "outline")]
        format: ShowFormat,
    },

    /// Delete one trace
    Delete {
        /// Trace id
        trace_id: String,
    },

    /// Remove dated trace directories older than the retention window
    Cleanup {
        /// Override the configured retention in days
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Record a scripted multi-agent trace and print its outline
    Demo {
        /// Number of parallel research workers
        #[arg(long, default_value = "2")]
        workers: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Evaluation,
    Production,
}

impl From<SourceArg> for TraceSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Evaluation => TraceSource::Evaluation,
            SourceArg::Production => TraceSource::Production,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ShowFormat {
    /// Indented agent / stage / event outline
    Outline,
    /// Hierarchy as JSON
    Hierarchy,
    /// The stored trace record
    Raw,
}

fn env_filter(verbose: bool, default_level: &str) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    }
}

/// Initialize logging to stderr for interactive use.
fn init_logging(verbose: bool, default_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose, default_level))
        .init();
}

/// Initialize logging to rotating files in `logs_dir` with daily rotation.
fn init_file_logging(logs_dir: &Path, verbose: bool, default_level: &str) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        // Fall back to stderr logging
        init_logging(verbose, default_level);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "hugin.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard would stop logging
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose, default_level))
        .init();
}

/// Backend holding stored traces; in-memory storage has nothing to inspect.
fn open_storage(config: &Config) -> Result<SharedTraceStorage> {
    if config.traces.storage == StorageKind::InMemory {
        anyhow::bail!("Configured storage is in-memory; there are no stored traces to inspect.");
    }
    Ok(storage::from_config(&config.traces)?)
}

fn format_listing(listing: &TraceListing) -> String {
    let duration = listing
        .total_duration_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {}  {:<10} {:>5} events {:>9}  {}",
        listing.trace_id,
        listing.start_time.format("%Y-%m-%d %H:%M:%S"),
        listing.source.as_str(),
        listing.event_count,
        duration,
        listing.initial_input
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, hugin_dir) = Config::load(cli.config.as_deref())?;
    config.traces.apply_env();
    if let Some(dir) = &cli.trace_dir {
        config.traces.root = dir.clone();
    }
    config.traces.root = config.resolve_trace_root(hugin_dir.as_deref());

    if cli.log_file || config.logging.to_file {
        init_file_logging(
            &Config::logs_dir(hugin_dir.as_deref()),
            cli.verbose,
            &config.logging.level,
        );
    } else {
        init_logging(cli.verbose, &config.logging.level);
    }

    match &hugin_dir {
        Some(dir) => tracing::debug!("Using hugin directory {}", dir.display()),
        None => tracing::debug!("No .hugin/config.toml found, using defaults"),
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("Invalid configuration: {}", e);
        }
        anyhow::bail!("Configuration has {} error(s)", errors.len());
    }

    match cli.command {
        Commands::Init { force } => {
            use config::{CONFIG_FILE, DEFAULT_CONFIG, HUGIN_DIR};

            let hugin_dir = cli.config.clone().unwrap_or_else(|| PathBuf::from(HUGIN_DIR));
            let config_path = hugin_dir.join(CONFIG_FILE);

            if config_path.exists() && !force {
                anyhow::bail!("{} already exists. Use --force to overwrite.", config_path.display());
            }

            if !hugin_dir.exists() {
                std::fs::create_dir_all(&hugin_dir)?;
                info!("Created {}/", hugin_dir.display());
            }

            std::fs::write(&config_path, DEFAULT_CONFIG)?;
            info!("Created {}", config_path.display());
            info!("Next steps:");
            info!("  1. Edit {} to configure trace storage", config_path.display());
            info!("  2. Run 'hugin demo' to record a sample trace");
            info!("  3. Run 'hugin list' to browse stored traces");
        }

        Commands::List {
            source,
            user,
            test_case,
            session,
            limit,
            offset,
            json,
        } => {
            let storage = open_storage(&config)?;
            let filter = TraceFilter {
                source: source.map(TraceSource::from),
                user_id: user,
                test_case_id: test_case,
                session_id: session,
            };
            let listings = storage.list(&filter, limit, offset).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else if listings.is_empty() {
                println!("No traces found in {}", config.traces.root.display());
            } else {
                for listing in &listings {
                    println!("{}", format_listing(listing));
                }
            }
        }

        Commands::Show { trace_id, format } => {
            let storage = open_storage(&config)?;
            let Some(trace) = storage.get(&trace_id).await? else {
                anyhow::bail!("Trace {} not found", trace_id);
            };

            match format {
                ShowFormat::Raw => println!("{}", serde_json::to_string_pretty(&trace)?),
                ShowFormat::Hierarchy => {
                    let hierarchy = TraceHierarchy::build(&trace, &config.traces.hierarchy);
                    println!("{}", serde_json::to_string_pretty(&hierarchy)?);
                }
                ShowFormat::Outline => {
                    let hierarchy = TraceHierarchy::build(&trace, &config.traces.hierarchy);
                    print!("{}", render::outline(&hierarchy));
                }
            }
        }

        Commands::Delete { trace_id } => {
            let storage = open_storage(&config)?;
            if storage.delete(&trace_id).await? {
                info!("Deleted trace {}", trace_id);
            } else {
                anyhow::bail!("Trace {} not found", trace_id);
            }
        }

        Commands::Cleanup { retention_days } => {
            if config.traces.storage != StorageKind::Filesystem {
                anyhow::bail!("Cleanup only applies to filesystem storage.");
            }
            let mut storage = FilesystemStorage::from_config(&config.traces)?;
            if let Some(days) = retention_days {
                storage = storage.with_retention_days(days);
            }

            let removed = storage.cleanup_expired().await?;
            for dir in &removed {
                info!("Removed {}", dir.display());
            }
            info!(
                "Cleanup finished: {} day(s) removed, keeping the last {} day(s)",
                removed.len(),
                storage.retention_days()
            );
        }

        Commands::Demo { workers } => {
            let collector = TraceCollector::from_config(&config.traces)?.with_sampling(true, 1.0);
            let trace = demo::run(Arc::new(collector), workers).await?;

            let hierarchy = TraceHierarchy::build(&trace, &config.traces.hierarchy);
            print!("{}", render::outline(&hierarchy));
            if config.traces.storage == StorageKind::Filesystem {
                println!("\nStored in {}", config.traces.root.display());
            }
            println!("Trace ID: {}", trace.trace_id);
        }
    }

    Ok(())
}

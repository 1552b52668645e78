//! Command-line front end for the strand query engine.
//!
//! Loads configuration from (in precedence order): defaults, config file,
//! environment variables (`STRAND_*`), and CLI flags. Supports validating the
//! effective configuration, browsing a metric index file, and listing the
//! built-in render functions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strand::config::{ConfigSources, EngineFileConfig};
use strand::functions::FunctionRegistry;
use strand::search::IndexSearcher;
use strand::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ---------- CLI ----------

/// Federated time-series query engine.
#[derive(Parser, Debug)]
#[command(name = "strand", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `strand.toml` is loaded when present.
    #[arg(long, env = "STRAND_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Log engine events (failed finders, fetch cycles, cache hits) to stderr.
    #[arg(long, default_value_t = false)]
    pub log_events: bool,

    /// Debug-level logging.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Browse the metric namespace recorded in an index file.
    Search {
        /// Glob query, e.g. `servers.*.cpu`.
        query: String,
        /// Index file, one metric path per line. Falls back to `index_file` from config.
        #[arg(long)]
        index: Option<PathBuf>,
        /// Cap on the number of results.
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// List the built-in render functions.
    Functions,
}

/// Merged CLI + file settings.
struct Options {
    engine: EngineConfig,
    log_events: bool,
    index_file: Option<PathBuf>,
}

fn load_options(cli: &Cli) -> Result<Options, String> {
    let sources = ConfigSources {
        file: cli.config.clone(),
        no_config: cli.no_config,
    };
    let mut partial = EngineFileConfig::load(&sources).map_err(|e| e.to_string())?;
    if cli.log_events {
        partial.log_events = Some(true);
    }
    let engine = partial.to_engine_config().map_err(|e| e.to_string())?;
    Ok(Options {
        engine,
        log_events: partial.log_events.unwrap_or(false),
        index_file: partial.index_file.map(PathBuf::from),
    })
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .init();
}

fn print_effective(options: &Options) {
    let engine = &options.engine;
    println!("max_grid_step={}", engine.max_grid_step);
    println!("fallback_step={}", engine.fallback_step);
    match engine.fetch_timeout {
        Some(timeout) => println!("fetch_timeout_ms={}", timeout.as_millis()),
        None => println!("fetch_timeout_ms=none"),
    }
    match engine.worker_threads {
        Some(n) => println!("worker_threads={}", n),
        None => println!("worker_threads=auto"),
    }
    println!("consolidation_rules={}", engine.consolidation_rules.len());
    for rule in &engine.consolidation_rules {
        println!("consolidation.{}={}", rule.pattern, rule.func);
    }
    println!("log_events={}", options.log_events);
    match &options.index_file {
        Some(path) => println!("index_file={}", path.display()),
        None => println!("index_file=none"),
    }
}

fn run_search(
    options: &Options,
    query: &str,
    index: Option<PathBuf>,
    max_results: Option<usize>,
) -> Result<(), String> {
    let index = index
        .or_else(|| options.index_file.clone())
        .ok_or_else(|| "search needs --index or index_file in config".to_string())?;
    let searcher = IndexSearcher::open(&index).map_err(|e| e.to_string())?;
    let results = searcher.search(query, max_results).map_err(|e| e.to_string())?;
    tracing::debug!(query, results = results.len(), "search finished");
    for result in results {
        println!("{}", result.path);
    }
    Ok(())
}

fn run_functions() {
    let registry = FunctionRegistry::builtin();
    for name in registry.names() {
        if let Some(def) = registry.get(name) {
            println!("{}\t{:?}", name, def.kind);
        }
    }
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = load_options(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective(&options);
        return Ok(());
    }

    match cli.command {
        Some(Command::Search {
            query,
            index,
            max_results,
        }) => run_search(&options, &query, index, max_results).map_err(|e| {
            eprintln!("search failed: {}", e);
            e
        })?,
        Some(Command::Functions) => run_functions(),
        None => {
            eprintln!("no command given; see --help");
            return Err("no command given".into());
        }
    }
    Ok(())
}

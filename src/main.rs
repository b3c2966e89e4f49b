//! Zentinel SOAP keyword runner binary.
//!
//! Run with: `zentinel-soap-keywords --config config.yaml --suite suite.yaml`

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_keywords::{KeywordLibrary, KeywordSuite, LibraryConfig};

/// Runs a suite of SOAP client keywords.
///
/// Each step names a keyword with positional and named arguments. Steps
/// run in order and the first failure stops the suite.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the keyword suite (YAML)
    #[arg(short, long)]
    suite: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel SOAP keywords v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let config: LibraryConfig = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config).context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        LibraryConfig::default()
    };

    info!(
        xop = config.settings.xop,
        debug = config.settings.debug,
        soap_version = ?config.envelope.soap_version,
        xop_includes = config.multipart.xop_includes.len(),
        "Configuration loaded"
    );

    let content = std::fs::read_to_string(&args.suite)
        .with_context(|| format!("Failed to read suite file {}", args.suite.display()))?;
    let suite: KeywordSuite = serde_yaml::from_str(&content).context("Failed to parse suite file")?;

    let mut library = KeywordLibrary::new(config);
    let outcome = run_suite(&mut library, &suite);
    library.close_all_clients();
    outcome?;

    info!(steps = suite.steps.len(), "Suite passed");
    Ok(())
}

fn run_suite(library: &mut KeywordLibrary, suite: &KeywordSuite) -> Result<()> {
    let name = suite.name.as_deref().unwrap_or("unnamed");
    info!(suite = %name, steps = suite.steps.len(), "Running suite");

    for (index, step) in suite.steps.iter().enumerate() {
        let result = library
            .run_keyword(&step.keyword, &step.args, &step.kwargs)
            .with_context(|| format!("Step {} '{}' failed", index + 1, step.keyword))?;
        if !result.is_null() {
            info!(step = index + 1, keyword = %step.keyword, result = %result, "Keyword returned");
        }
    }
    Ok(())
}

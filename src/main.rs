//! # loganom - CLI Entry Point
//!
//! Command-line interface for the loganom batch pipeline.
//!
//! Commands:
//! - `init-config` - Generate a default configuration file
//! - `ingest`      - Partition a raw event file by date
//! - `featurize`   - Build per-day feature tables and the combined sample
//! - `ensemble`    - Fuse the two detector score tables
//! - `alerts`      - Print the selected alerts and threshold
//! - `respond`     - Run the response policy against the selected alerts
//! - `run`         - ensemble -> alerts -> respond -> custody manifest
//! - `status`      - Show configured paths and table sizes

use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use loganom::alerting::{self, AlertSet};
use loganom::custody::Manifest;
use loganom::features::{self, FeatureBuilder, FeatureSchema};
use loganom::response::{ResponseEngine, ResponseSummary};
use loganom::{scoring, store};
use loganom::{LoganomConfig, LoganomError, LoganomResult};

/// loganom - Behavioral anomaly pipeline for security logs.
///
/// Builds features from normalized events, fuses two detector scores,
/// selects alerts adaptively and runs an audited response policy.
#[derive(Parser, Debug)]
#[command(name = "loganom")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "loganom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    InitConfig,

    /// Normalize a raw NDJSON event file into date partitions.
    Ingest {
        /// Raw event file (one JSON object per line).
        file: PathBuf,

        /// Source name; partitions land under `<events_dir>/<source>/`.
        #[arg(short, long)]
        source: String,
    },

    /// Build per-day feature tables, the combined sample and the schema.
    Featurize,

    /// Join and fuse the two detector score tables.
    Ensemble,

    /// Print the alerts selected from the ensemble table.
    Alerts {
        /// Override the configured alert cap.
        #[arg(long)]
        top_n: Option<usize>,
    },

    /// Evaluate the response policy against the selected alerts.
    Respond(ResponseArgs),

    /// Ensemble, alerts, response and custody manifest in one pass.
    Run(ResponseArgs),

    /// Show configured paths and table sizes.
    Status,
}

#[derive(Args, Debug)]
struct ResponseArgs {
    /// Execute actions instead of recording a dry run.
    #[arg(long)]
    apply: bool,

    /// Override the configured alert cap.
    #[arg(long)]
    top_n: Option<usize>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::InitConfig => cmd_init_config(&cli.config),
        Commands::Ingest { ref file, ref source } => {
            load_config(&cli.config).and_then(|c| cmd_ingest(&c, file, source))
        }
        Commands::Featurize => load_config(&cli.config).and_then(|c| cmd_featurize(&c)),
        Commands::Ensemble => load_config(&cli.config).and_then(|c| cmd_ensemble(&c)),
        Commands::Alerts { top_n } => {
            load_config(&cli.config).and_then(|c| cmd_alerts(&with_overrides(c, false, top_n)))
        }
        Commands::Respond(ref args) => load_config(&cli.config)
            .and_then(|c| cmd_respond(&with_overrides(c, args.apply, args.top_n))),
        Commands::Run(ref args) => load_config(&cli.config)
            .and_then(|c| cmd_run(&with_overrides(c, args.apply, args.top_n))),
        Commands::Status => load_config(&cli.config).and_then(|c| cmd_status(&c)),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Load the configuration file, or defaults when it does not exist.
fn load_config(config_path: &Path) -> LoganomResult<LoganomConfig> {
    if config_path.exists() {
        info!("Loading configuration from: {}", config_path.display());
        LoganomConfig::from_file(config_path)
    } else {
        info!("No config file found, using defaults. Run 'init-config' to generate one.");
        Ok(LoganomConfig::default())
    }
}

/// Apply per-invocation CLI overrides. `--apply` only ever disables dry-run.
fn with_overrides(mut config: LoganomConfig, apply: bool, top_n: Option<usize>) -> LoganomConfig {
    if apply {
        config.response.dry_run = false;
    }
    if let Some(n) = top_n {
        config.alerting.top_n = n.max(1);
    }
    config
}

/// Generate a default configuration file.
fn cmd_init_config(config_path: &Path) -> LoganomResult<()> {
    if config_path.exists() {
        return Err(LoganomError::Config(format!(
            "Configuration file already exists: {}. Remove it first or use a different path.",
            config_path.display()
        )));
    }

    LoganomConfig::write_default(config_path)?;
    println!("Default configuration written to: {}", config_path.display());
    println!();
    println!("Key settings to configure:");
    println!("  [general]   - Data directory layout");
    println!("  [features]  - Session timeout, window sizes, behavioral flags");
    println!("  [scoring]   - Detector score files, weights and polarity");
    println!("  [alerting]  - Contamination (default 0.05) and top_n (default 10)");
    println!("  [response]  - Policy file; dry_run stays true until you pass --apply");

    Ok(())
}

fn cmd_ingest(config: &LoganomConfig, file: &Path, source: &str) -> LoganomResult<()> {
    let summary = store::ingest_file(file, &config.general.events_dir, source)?;
    println!(
        "Ingested {} events from {} into {} partitions ({} dropped, {} malformed lines)",
        summary.events,
        file.display(),
        summary.partitions.len(),
        summary.dropped,
        summary.malformed
    );
    for path in &summary.partitions {
        println!("  {}", path.display());
    }
    Ok(())
}

fn cmd_featurize(config: &LoganomConfig) -> LoganomResult<()> {
    let builder = FeatureBuilder::new(&config.features);
    let summary = builder.build(&config.general)?;
    println!(
        "Built {} feature rows over {} days ({} skipped, {} rows dropped)",
        summary.rows, summary.days_built, summary.days_skipped, summary.dropped_rows
    );
    if summary.pruned_partitions > 0 {
        println!("  Removed {} stale partitions", summary.pruned_partitions);
    }
    println!("  Sample: {} ({} rows)", summary.sample_path.display(), summary.sample_rows);
    println!(
        "  Schema: {} (v{}, {} columns)",
        summary.schema_path.display(),
        builder.schema().version,
        builder.schema().columns.len()
    );
    Ok(())
}

fn cmd_ensemble(config: &LoganomConfig) -> LoganomResult<()> {
    let records = scoring::build_ensemble(config)?;
    println!(
        "Wrote {} ensemble rows to {}",
        records.len(),
        config.ensemble_path().display()
    );
    Ok(())
}

/// Select alerts from the persisted ensemble table.
fn select_from_table(config: &LoganomConfig) -> LoganomResult<AlertSet> {
    let records = scoring::load_ensemble(&config.ensemble_path())?;
    Ok(alerting::select_alerts(&records, &config.alerting))
}

fn print_alerts(set: &AlertSet) {
    println!(
        "Threshold: {} ({} qualifying, {} selected)",
        set.decision,
        set.qualifying,
        set.alerts.len()
    );
    for alert in &set.alerts {
        let r = &alert.record;
        println!(
            "  {}  score={:.4}  a={:.4}  b={}  host={}  user={}",
            r.timestamp.to_rfc3339(),
            r.ensemble_score,
            r.score_a,
            r.score_b.map_or_else(|| "-".to_string(), |b| format!("{:.4}", b)),
            r.host.as_deref().unwrap_or("-"),
            r.user.as_deref().unwrap_or("-"),
        );
    }
}

fn cmd_alerts(config: &LoganomConfig) -> LoganomResult<()> {
    let set = select_from_table(config)?;
    print_alerts(&set);
    Ok(())
}

fn respond_to(config: &LoganomConfig, set: &AlertSet) -> LoganomResult<ResponseSummary> {
    let engine = ResponseEngine::from_config(&config.response)?;
    let summary = engine.respond(&set.alerts)?;
    println!(
        "Response ({}): {} rule matches, {} audit records, {} failed actions -> {}",
        if config.response.dry_run { "dry-run" } else { "apply" },
        summary.matched_rules,
        summary.records_written,
        summary.failed_actions,
        engine.audit_log().path().display()
    );
    Ok(summary)
}

fn cmd_respond(config: &LoganomConfig) -> LoganomResult<()> {
    let set = select_from_table(config)?;
    print_alerts(&set);
    respond_to(config, &set)?;
    Ok(())
}

fn cmd_run(config: &LoganomConfig) -> LoganomResult<()> {
    let records = scoring::build_ensemble(config)?;
    let set = alerting::select_alerts(&records, &config.alerting);
    print_alerts(&set);
    respond_to(config, &set)?;

    let inputs = vec![
        config.score_a_path(),
        config.score_b_path(),
        config.response.policy_path.clone(),
    ];
    let outputs = vec![config.ensemble_path(), config.response.audit_log_path.clone()];
    let manifest_path = Manifest::build(&inputs, &outputs)?.write(&config.general.data_dir)?;
    println!("Custody manifest: {}", manifest_path.display());
    Ok(())
}

/// Report configured paths and the size of every table.
fn cmd_status(config: &LoganomConfig) -> LoganomResult<()> {
    let g = &config.general;
    println!("Data directory: {}", g.data_dir.display());

    let partitions = store::list_event_partitions(&g.events_dir)?;
    let event_files: usize = partitions.values().map(Vec::len).sum();
    println!(
        "Events: {} ({} days, {} files)",
        g.events_dir.display(),
        partitions.len(),
        event_files
    );

    let schema = FeatureSchema::from_config(&config.features);
    let sample = g.features_dir.join(features::SAMPLE_FILE);
    match features::load_feature_table(&sample, &schema) {
        Ok(rows) => println!("Feature sample: {} ({} valid rows)", sample.display(), rows.len()),
        Err(LoganomError::MissingInput { .. }) => {
            println!("Feature sample: not found (run 'featurize')")
        }
        Err(e) => println!("Feature sample: unreadable ({})", e),
    }

    for (label, path) in [
        ("Detector A scores", config.score_a_path()),
        ("Detector B scores", config.score_b_path()),
        ("Ensemble scores", config.ensemble_path()),
    ] {
        if path.exists() {
            println!("{}: {} ({} rows)", label, path.display(), store::count_lines(&path)?);
        } else {
            println!("{}: {} (missing)", label, path.display());
        }
    }

    let policy = &config.response.policy_path;
    println!(
        "Policy: {}{}",
        policy.display(),
        if policy.exists() { "" } else { " (missing, built-in default rule applies)" }
    );
    println!(
        "Audit log: {} ({} records)",
        config.response.audit_log_path.display(),
        store::count_lines(&config.response.audit_log_path)?
    );

    println!();
    println!("Configuration:");
    println!("  Session timeout: {}s", config.features.session_timeout_secs);
    println!("  Windows: {:?} minutes", config.features.window_minutes);
    println!(
        "  Weights: a={} b={} (tolerance {}s)",
        config.scoring.weight_a, config.scoring.weight_b, config.scoring.join_tolerance_secs
    );
    println!(
        "  Contamination: {} (top {})",
        config.alerting.contamination, config.alerting.top_n
    );
    println!("  Dry run: {}", config.response.dry_run);

    Ok(())
}

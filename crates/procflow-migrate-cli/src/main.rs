//! procflow-migrate CLI - migrate and reconcile process-definition records.

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use procflow_migrate::fix::{BackupStore, FileBackupStore, MemoryBackupStore};
use procflow_migrate::{
    write_artifact, AutoApprove, AutoFixEngine, Config, ConfirmPolicy, EntityKind, FixAction,
    GapDetector, GapSummary, JsonLinesReporter, MemorySource, MemoryTarget, MigrateError,
    MigrationOrchestrator, MigrationResult, MigrationSession, ProgressReporter, Scope,
    TracingReporter,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "procflow-migrate")]
#[command(about = "Migrate and reconcile process-definition records across relational, graph and vector stores")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    /// Directory for signed result, report, gap and backup artifacts
    #[arg(long)]
    report_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the source snapshot into the target stores
    Run {
        /// Dry run: validate mappings without writing to the target
        #[arg(long)]
        dry_run: bool,

        /// Override records per batch
        #[arg(long)]
        batch_size: Option<i64>,

        /// Record failed batches and keep going instead of aborting
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Detect gaps between source and target
    Gaps {
        /// Scan scope: pre or post
        #[arg(long, default_value = "post")]
        scope: String,

        /// Limit the scan to one entity kind
        #[arg(long)]
        kind: Option<String>,
    },

    /// Detect gaps, plan repairs and execute them
    Fix {
        /// Approve every action that requires confirmation
        #[arg(long, short)]
        yes: bool,

        /// Dry run: plan and back up without modifying the target
        #[arg(long)]
        dry_run: bool,
    },

    /// Load and validate the configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    let base = cli.config.parent().map(Path::to_path_buf).unwrap_or_default();
    config.source.path = resolve(&base, &config.source.path);
    config.target.path = resolve(&base, &config.target.path);
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler();

    match cli.command {
        Commands::Run {
            dry_run,
            batch_size,
            continue_on_error,
        } => {
            // Apply overrides
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            config.migration.dry_run |= dry_run;
            config.migration.continue_on_error |= continue_on_error;

            let source = Arc::new(MemorySource::load(&config.source.path)?);
            let target = Arc::new(MemoryTarget::load_dir(&config.target.path)?);
            let reporter: Arc<dyn ProgressReporter> = if cli.progress {
                Arc::new(JsonLinesReporter::stderr())
            } else {
                Arc::new(TracingReporter)
            };

            let orchestrator = MigrationOrchestrator::new(source, target.clone())
                .with_mapper(config.mapper())
                .with_reporter(reporter)
                .with_cancel(cancel_token);
            let result = orchestrator.run(&config.migration).await?;

            if !result.dry_run {
                target.save_dir(&config.target.path)?;
            }
            if let Some(dir) = &cli.report_dir {
                let path = write_artifact(dir, "migration_result", &result.run_id, result.clone(), &config.hash())?;
                info!("Wrote migration result to {}", path.display());
            }

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
            for warning in result.warnings() {
                warn!("{}", warning);
            }
            Ok(result.exit_code())
        }

        Commands::Gaps { scope, kind } => {
            let scope: Scope = scope.parse()?;
            let kinds = match kind {
                Some(kind) => vec![kind.parse::<EntityKind>()?],
                None => config.migration.entity_kinds.clone(),
            };

            let source = Arc::new(MemorySource::load(&config.source.path)?);
            let target = Arc::new(MemoryTarget::load_dir(&config.target.path)?);
            let session = Arc::new(MigrationSession::new());
            let detector =
                GapDetector::new(source, target, session.clone()).with_mapper(config.mapper());
            let gaps = detector.detect_all(&kinds, scope).await?;

            if let Some(dir) = &cli.report_dir {
                let path = write_artifact(dir, "gaps", session.id(), gaps.clone(), &config.hash())?;
                info!("Wrote gap list to {}", path.display());
            }

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&gaps)?);
            } else {
                for gap in &gaps {
                    println!(
                        "  [{:?}] {} {} {}: {}",
                        gap.severity,
                        gap.gap_type,
                        gap.entity_kind,
                        gap.record_id(),
                        gap.details.message
                    );
                }
                print_gap_summary(&GapSummary::from_gaps(&gaps));
            }
            Ok(0)
        }

        Commands::Fix { yes, dry_run } => {
            let source = Arc::new(MemorySource::load(&config.source.path)?);
            let target = Arc::new(MemoryTarget::load_dir(&config.target.path)?);
            let session = Arc::new(MigrationSession::new());
            let key = config.hash();

            let detector = GapDetector::new(source.clone(), target.clone(), session.clone())
                .with_mapper(config.mapper());
            let gaps = detector
                .detect_all(&config.migration.entity_kinds, Scope::Post)
                .await?;
            info!("Detected {} gaps", gaps.len());

            let backups: Arc<dyn BackupStore> = match &cli.report_dir {
                Some(dir) => Arc::new(FileBackupStore::new(dir.join("backups"), key.clone())?),
                None => Arc::new(MemoryBackupStore::new()),
            };
            let engine = AutoFixEngine::new(source, target.clone(), session)
                .with_repair_config(&config.repair)
                .with_backup_store(backups);

            let plan = engine.plan(&gaps);
            info!(
                "Planned {} actions, {} gaps need manual handling",
                plan.actions.len(),
                plan.manual.len()
            );
            let confirm: Box<dyn ConfirmPolicy> = if yes {
                Box::new(AutoApprove)
            } else {
                Box::new(InteractiveConfirm)
            };
            let report = engine.execute(plan, confirm.as_ref(), dry_run).await;

            if !report.dry_run {
                target.save_dir(&config.target.path)?;
            }
            if let Some(dir) = &cli.report_dir {
                let path = write_artifact(dir, "fix_report", &report.report_id, report.clone(), &key)?;
                info!("Wrote fix report to {}", path.display());
            }

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.summary());
            }
            Ok(if report.failed > 0 { 1 } else { 0 })
        }

        Commands::CheckConfig => {
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Configuration OK");
                println!("  Source: {}", config.source.path.display());
                println!("  Target: {}", config.target.path.display());
                println!(
                    "  Entity kinds: {}",
                    config
                        .migration
                        .entity_kinds
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                println!("  Batch size: {}", config.migration.batch_size);
                println!("  Hash: {}", config.hash());
            }
            Ok(0)
        }
    }
}

fn print_result(result: &MigrationResult) {
    let status_msg = if result.dry_run { "Dry run completed" } else { "Migration completed" };
    println!("\n{}: {:?}", status_msg, result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Records: {}/{} migrated, {} failed",
        result.migrated_records, result.total_records, result.failed_records
    );
    println!(
        "  Batches: {} ({} failed)",
        result.batches_total, result.batches_failed
    );
    if result.rolled_back_records > 0 {
        println!("  Rolled back: {}", result.rolled_back_records);
    }
    for (kind, stats) in &result.per_kind {
        println!(
            "    {}: {}/{} ({} failed)",
            kind, stats.migrated, stats.total, stats.failed
        );
    }
    if let Some(after) = &result.gaps_after {
        print_gap_summary(after);
    }
}

fn print_gap_summary(summary: &GapSummary) {
    println!(
        "  Gaps: {} ({} auto-fixable)",
        summary.total, summary.auto_fixable
    );
    for (gap_type, count) in &summary.by_type {
        println!("    {}: {}", gap_type, count);
    }
}

/// Prompts on the terminal for every action that needs confirmation.
///
/// Declines when stdin is not a terminal.
struct InteractiveConfirm;

impl ConfirmPolicy for InteractiveConfirm {
    fn confirm(&self, action: &FixAction) -> bool {
        Confirm::new()
            .with_prompt(format!(
                "Apply {} to {} {} ({})?",
                action.strategy,
                action.gap.entity_kind,
                action.record_id(),
                action.gap.gap_type
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout stays parseable with --output-json
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Stopping after the current batch...", name);
                    token.cancel();
                }
                Err(e) => eprintln!("Failed to setup {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    cancel_token
}

/// Resolve a configured path relative to the configuration file.
fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

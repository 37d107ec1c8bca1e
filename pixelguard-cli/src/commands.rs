use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use pixelguard_config::PixelGuardConfig;
use pixelguard_core::model::Snapshot;
use pixelguard_detection::{scan_body, NullClassifier, PatternIndex, ScanReport};
use pixelguard_engine::{Orchestrator, OrchestratorStatus};
use pixelguard_ledger::{AuditTrail, PatternLedger};
use pixelguard_monitor::FileFetcher;
use pixelguard_telemetry::EventLogger;
use pixelguard_validator::{PatternReport, PatternValidator};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pixelguard", version, about)]
pub struct Cli {
    /// Configuration file; defaults to config/pixelguard.yaml plus environment overrides
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the update pipeline until interrupted
    Run,
    /// Print the pipeline status without starting it
    Status,
    /// Print the commit history of the current branch
    History(HistoryArgs),
    /// Compare the snapshots of two commits
    Diff(DiffArgs),
    /// Create a rollback commit restoring an earlier snapshot
    Rollback(RollbackArgs),
    /// Export commits and aggregate counts for a time window
    Audit(AuditArgs),
    /// List branches or create one
    Branch(BranchArgs),
    /// Commits that added, removed or contained a pattern
    PatternHistory(PatternHistoryArgs),
    /// Print the validation-failure log
    Failures,
    /// Run candidate patterns through every validation stage
    Validate(ValidateArgs),
    /// Look a URL up in the index built from the ledger head
    Lookup(LookupArgs),
    /// Scan a decoded email body for tracking resources
    Scan(ScanArgs),
    /// Print the effective configuration as YAML
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct DiffArgs {
    pub from: String,
    pub to: String,
}

#[derive(Args, Debug, Clone)]
pub struct RollbackArgs {
    /// Commit whose snapshot is restored
    pub commit: String,
    #[arg(short, long, default_value = "manual rollback")]
    pub reason: String,
}

#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    /// RFC 3339 lower bound
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,
    /// RFC 3339 upper bound (default: now)
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
    /// Write the trail to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BranchArgs {
    /// Name of a branch to create; lists branches when absent
    pub name: Option<String>,
    /// Commit the new branch starts from (default: current head)
    #[arg(long)]
    pub from: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PatternHistoryArgs {
    pub pattern: String,
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(required = true)]
    pub patterns: Vec<String>,
    #[arg(short, long, default_value = "cli")]
    pub source: String,
}

#[derive(Args, Debug, Clone)]
pub struct LookupArgs {
    pub url: String,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// File holding the decoded HTML body
    pub body: PathBuf,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PixelGuardConfig> {
    let config = match path {
        Some(path) => PixelGuardConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PixelGuardConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    EventLogger::init_with_level(&config.telemetry.log_level);

    match cli.command {
        Commands::Run => run_pipeline(config).await,
        Commands::Status => print_json(&offline_status(config).await?),
        Commands::History(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            print_json(&ledger.get_history(args.limit)?)
        }
        Commands::Diff(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            print_json(&ledger.diff(&args.from, &args.to)?)
        }
        Commands::Rollback(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            let id = rollback(&ledger, &args)?;
            println!("{id}");
            Ok(())
        }
        Commands::Audit(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            let trail = ledger.export_audit_trail(args.start, args.end)?;
            export_audit(&trail, args.output.as_deref())
        }
        Commands::Branch(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            if let Some(name) = &args.name {
                ledger.create_branch(name, args.from.as_deref())?;
            }
            print_json(&ledger.list_branches()?)
        }
        Commands::PatternHistory(args) => {
            let ledger = PatternLedger::open(&config.ledger)?;
            print_json(&ledger.pattern_history(&args.pattern, args.limit)?)
        }
        Commands::Failures => {
            let ledger = PatternLedger::open(&config.ledger)?;
            print_json(&ledger.validation_failures()?)
        }
        Commands::Validate(args) => print_json(&validate(&config, &args)?),
        Commands::Lookup(args) => {
            let index = head_index(&config)?;
            match index.lookup(&args.url) {
                Some(entry) => print_json(&*entry),
                None => bail!("{} is not indexed", args.url),
            }
        }
        Commands::Scan(args) => print_json(&scan(&config, &args.body)?),
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn run_pipeline(config: PixelGuardConfig) -> anyhow::Result<()> {
    let metrics_enabled = config.telemetry.metrics_enabled;
    let ledger = PatternLedger::open(&config.ledger)?;
    let orchestrator = Arc::new(Orchestrator::new(config, ledger, Arc::new(FileFetcher)).await?);
    orchestrator.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupt received");
    orchestrator.shutdown().await;

    if metrics_enabled {
        print!("{}", orchestrator.metrics().gather_metrics()?);
    }
    Ok(())
}

async fn offline_status(config: PixelGuardConfig) -> anyhow::Result<OrchestratorStatus> {
    let ledger = PatternLedger::open(&config.ledger)?;
    let orchestrator = Orchestrator::new(config, ledger, Arc::new(FileFetcher)).await?;
    orchestrator.reload_index()?;
    Ok(orchestrator.status())
}

fn rollback(ledger: &PatternLedger, args: &RollbackArgs) -> anyhow::Result<String> {
    let id = ledger
        .rollback_to_commit(&args.commit, &args.reason, None, false)
        .with_context(|| format!("rolling back to {}", args.commit))?;
    info!(commit = %id, target_commit = %args.commit, "Manual rollback committed");
    EventLogger::record_event(
        "manual_rollback",
        vec![
            KeyValue::new("commit_id", id.clone()),
            KeyValue::new("target_commit", args.commit.clone()),
            KeyValue::new("reason", args.reason.clone()),
        ],
    );
    Ok(id)
}

fn export_audit(trail: &AuditTrail, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, serde_json::to_vec_pretty(trail)?)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), commits = trail.total_commits, "Audit trail exported");
            Ok(())
        }
        None => print_json(trail),
    }
}

fn validate(config: &PixelGuardConfig, args: &ValidateArgs) -> anyhow::Result<Vec<PatternReport>> {
    let validator = PatternValidator::from_config(&config.validation)?;
    let candidates: Vec<(String, String)> = args
        .patterns
        .iter()
        .map(|p| (p.clone(), args.source.clone()))
        .collect();
    Ok(validator.validate_batch(&candidates))
}

fn head_index(config: &PixelGuardConfig) -> anyhow::Result<PatternIndex> {
    let ledger = PatternLedger::open(&config.ledger)?;
    let snapshot: Snapshot = ledger.head()?.pattern_snapshot;
    let priorities = config
        .monitor
        .sources
        .iter()
        .map(|s| (s.name.clone(), s.priority))
        .collect();
    let index = PatternIndex::new(priorities);
    index.rebuild(&snapshot)?;
    Ok(index)
}

fn scan(config: &PixelGuardConfig, body: &Path) -> anyhow::Result<ScanReport> {
    let html = std::fs::read_to_string(body)
        .with_context(|| format!("reading {}", body.display()))?;
    let index = head_index(config)?;
    Ok(scan_body(&index, &NullClassifier, &html))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn config(dir: &Path) -> PixelGuardConfig {
        let mut config = PixelGuardConfig::default();
        config.ledger.root = dir.join("ledger");
        config.monitor.cache_dir = dir.join("cache");
        config
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_rollback_with_reason() {
        let cli = Cli::try_parse_from([
            "pixelguard",
            "--config",
            "custom.yaml",
            "rollback",
            "abc123",
            "--reason",
            "bad list",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
        let Commands::Rollback(args) = cli.command else {
            panic!("expected rollback");
        };
        assert_eq!(args.commit, "abc123");
        assert_eq!(args.reason, "bad list");
    }

    #[test]
    fn validate_requires_a_pattern() {
        assert!(Cli::try_parse_from(["pixelguard", "validate"]).is_err());
    }

    #[test]
    fn audit_bounds_parse_as_rfc3339() {
        let cli = Cli::try_parse_from(["pixelguard", "audit", "--start", "2024-01-01T00:00:00Z"])
            .unwrap();
        let Commands::Audit(args) = cli.command else {
            panic!("expected audit");
        };
        assert!(args.start.is_some());
        assert!(args.end.is_none());
    }

    #[test]
    fn rollback_and_scan_use_the_file_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let ledger = PatternLedger::open(&config.ledger).unwrap();
        let root = ledger.head_id().unwrap().unwrap();
        ledger
            .commit(
                Snapshot::from_sources([("s", vec!["||tracker.example^"])]),
                "add tracker",
                "test",
                None,
            )
            .unwrap();

        let body = dir.path().join("mail.html");
        std::fs::write(&body, r#"<img src="https://tracker.example/open.gif" width="1">"#)
            .unwrap();
        let report = scan(&config, &body).unwrap();
        assert_eq!(report.findings.len(), 1);

        let args = RollbackArgs {
            commit: root,
            reason: "test".into(),
        };
        rollback(&ledger, &args).unwrap();
        drop(ledger);
        let report = scan(&config, &body).unwrap();
        assert!(report.findings.is_empty());
    }

    #[test]
    fn validate_reports_each_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let args = ValidateArgs {
            patterns: vec!["||doubleclick.net^".into(), "/(a+)+b/".into()],
            source: "cli".into(),
        };
        let reports = validate(&config(dir.path()), &args).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].all_passed());
        assert!(!reports[1].syntax_passed());
    }
}

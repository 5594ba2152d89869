//! CLI definition and dispatch.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::audit_sink::{LogAuditSink, MemoryAuditSink};
use crate::adapters::csv_adapter::CsvBarSource;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::kill_switch::InMemoryKillSwitch;
use crate::adapters::rule_file_adapter::FileRuleSource;
use crate::adapters::snapshot_indicator::SnapshotIndicatorBuilder;
use crate::domain::cascade::{CascadeOrchestrator, RunOptions};
use crate::domain::error::CascadeError;
use crate::domain::pipeline::{SignalPipeline, SignalReport};
use crate::domain::processor::{RuleTimeframeProcessor, RunFlags};
use crate::domain::registry::ConditionRegistry;
use crate::domain::result::SymbolStatus;
use crate::domain::rulebook::{RuleBook, RuleBookHandle};
use crate::domain::settings::EngineSettings;
use crate::domain::timeframe::Timeframe;
use crate::domain::universe::parse_symbols;
use crate::domain::validator;
use crate::ports::audit_port::{AuditRecord, AuditSink};
use crate::ports::rule_source_port::RuleConfigSource;

#[derive(Parser, Debug)]
#[command(name = "tfcascade", about = "Multi-timeframe trading signal cascade")]
pub struct Cli {
    /// Log level for tfcascade output (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Statically validate a rule configuration file
    Validate {
        #[arg(short, long)]
        rules: PathBuf,
        /// Print the validation report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the cascade for one or more symbols
    Run(RunArgs),
    /// List the built-in conditions
    Conditions,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(short, long)]
    pub rules: PathBuf,
    /// INI engine settings
    #[arg(short, long)]
    pub settings: Option<PathBuf>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Comma separated symbols, e.g. BTCUSDT,ETHUSDT
    #[arg(long)]
    pub symbols: String,
    #[arg(long)]
    pub start_from: Option<Timeframe>,
    /// Evaluation time (RFC 3339); defaults to the current time
    #[arg(long)]
    pub now: Option<String>,
    #[arg(long)]
    pub force_run: bool,
    #[arg(long)]
    pub force_timeframe_check: bool,
    #[arg(long)]
    pub workers: Option<usize>,
    /// Print reports and the audit trail as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Validate { rules, json } => {
            if let Err(code) = init_logging(cli.log_level.as_deref()) {
                return code;
            }
            run_validate(&rules, json)
        }
        Command::Run(args) => run_cascade(args, cli.log_level),
        Command::Conditions => run_conditions(),
    }
}

/// Quiet for dependencies, `level` (default info) for this crate and the audit trail.
/// `RUST_LOG` still applies on top.
pub fn init_logging(level: Option<&str>) -> Result<(), ExitCode> {
    let level = match level {
        Some(raw) => raw.parse::<log::LevelFilter>().map_err(|_| {
            fail(CascadeError::ConfigInvalid {
                section: "engine".into(),
                key: "log_level".into(),
                reason: format!("unknown log level '{raw}'"),
            })
        })?,
        None => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter(None, log::LevelFilter::Warn)
        .filter(Some("tfcascade"), level)
        .filter(Some("audit"), level)
        .parse_default_env();
    // A logger may already be installed when dispatch runs twice in one process.
    let _ = builder.try_init();
    Ok(())
}

fn fail(err: CascadeError) -> ExitCode {
    eprintln!("error: {err}");
    (&err).into()
}

pub fn load_settings(path: Option<&Path>) -> Result<EngineSettings, CascadeError> {
    match path {
        Some(p) => {
            let adapter = FileConfigAdapter::from_file(p)?;
            EngineSettings::from_config(&adapter)
        }
        None => Ok(EngineSettings::default()),
    }
}

fn run_validate(rules_path: &Path, json: bool) -> ExitCode {
    let source = FileRuleSource::new(rules_path);
    let config = match source.load() {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let registry = ConditionRegistry::with_builtins();
    let report = validator::validate(&config, &registry);

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{out}"),
            Err(e) => return fail(e.into()),
        }
    } else {
        for issue in &report.errors {
            println!("error: {issue}");
        }
        for issue in &report.warnings {
            println!("warning: {issue}");
        }
    }

    if report.has_errors() {
        eprintln!(
            "{}: {} error(s), {} warning(s)",
            source.describe(),
            report.errors.len(),
            report.warnings.len()
        );
        return ExitCode::from(4);
    }

    if let Err(e) = RuleBook::compile(&config, &registry) {
        return fail(e);
    }
    if !json {
        println!(
            "{}: OK ({} warning(s))",
            source.describe(),
            report.warnings.len()
        );
    }
    ExitCode::SUCCESS
}

fn run_conditions() -> ExitCode {
    let registry = ConditionRegistry::with_builtins();
    let mut names = registry.names();
    names.sort_unstable();
    for name in names {
        println!("{name}");
    }
    ExitCode::SUCCESS
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunOutput<'a> {
    reports: &'a [SignalReport],
    audit: Vec<AuditRecord>,
}

fn run_cascade(args: RunArgs, log_level: Option<String>) -> ExitCode {
    let settings = match load_settings(args.settings.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            let _ = init_logging(log_level.as_deref());
            return fail(e);
        }
    };
    if let Err(code) = init_logging(log_level.as_deref().or(settings.log_level.as_deref())) {
        return code;
    }

    let symbols = match parse_symbols(&args.symbols) {
        Ok(s) => s,
        Err(e) => {
            return fail(CascadeError::ConfigInvalid {
                section: "run".into(),
                key: "symbols".into(),
                reason: e.to_string(),
            });
        }
    };

    let data_dir = match args.data_dir.clone().or_else(|| settings.data_dir.clone()) {
        Some(d) => d,
        None => {
            return fail(CascadeError::ConfigMissing {
                section: "engine".into(),
                key: "data_dir".into(),
            });
        }
    };

    let now = match args.now.as_deref().map(parse_now).transpose() {
        Ok(n) => n.unwrap_or_else(Utc::now),
        Err(e) => return fail(e),
    };

    let source = FileRuleSource::new(&args.rules);
    eprintln!("Loading rules from {}", source.describe());
    let book = match source
        .load()
        .and_then(|config| RuleBook::load(&config, &ConditionRegistry::with_builtins()))
    {
        Ok((book, _)) => book,
        Err(e) => return fail(e),
    };

    let memory_audit = Arc::new(MemoryAuditSink::new());
    let audit: Arc<dyn AuditSink> = if args.json {
        Arc::clone(&memory_audit) as Arc<dyn AuditSink>
    } else {
        Arc::new(LogAuditSink)
    };

    let pipeline = build_pipeline(
        &data_dir,
        &settings,
        audit,
        book,
        args.workers.unwrap_or(settings.workers),
    );

    let options = RunOptions {
        run_id: None,
        now,
        start_from: args.start_from.or(settings.start_from),
        flags: RunFlags {
            force_run: args.force_run,
            force_timeframe_check: args.force_timeframe_check,
        },
    };

    let reports = match pipeline.run_all(&symbols, &options) {
        Ok(r) => r,
        Err(e) => return fail(e),
    };

    if args.json {
        let output = RunOutput {
            reports: &reports,
            audit: memory_audit.records(),
        };
        match serde_json::to_string_pretty(&output) {
            Ok(out) => println!("{out}"),
            Err(e) => return fail(e.into()),
        }
    } else {
        for report in &reports {
            println!("{}", summary_line(report));
        }
    }

    if reports.iter().any(|r| r.result.status == SymbolStatus::Error) {
        ExitCode::from(3)
    } else {
        ExitCode::SUCCESS
    }
}

/// Wire the file-backed collaborators into a pipeline.
pub fn build_pipeline(
    data_dir: &Path,
    settings: &EngineSettings,
    audit: Arc<dyn AuditSink>,
    book: RuleBook,
    workers: usize,
) -> SignalPipeline {
    let bars = Arc::new(CsvBarSource::new(data_dir));
    let indicators = Arc::new(SnapshotIndicatorBuilder::new());
    let kill_switch = Arc::new(InMemoryKillSwitch::with_switches_off(
        settings.kill_switch_off.iter().cloned(),
    ));
    let orchestrator = CascadeOrchestrator::new(audit).with_processors(
        RuleTimeframeProcessor::for_all(bars, indicators, kill_switch),
    );
    SignalPipeline::new(orchestrator, Arc::new(RuleBookHandle::new(book)), workers)
}

fn parse_now(raw: &str) -> Result<DateTime<Utc>, CascadeError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CascadeError::ConfigInvalid {
            section: "run".into(),
            key: "now".into(),
            reason: e.to_string(),
        })
}

pub fn summary_line(report: &SignalReport) -> String {
    let r = &report.result;
    let mut line = format!("{} {}", r.symbol, r.status);
    if let Some(side) = r.signal_side {
        line.push_str(&format!(" side={side}"));
    }
    if let Some(tf) = r.execution_tf {
        line.push_str(&format!(" exec={tf}"));
    }
    if let Some(tf) = r.failed_timeframe {
        line.push_str(&format!(" failed={tf}"));
    }
    if let Some(price) = r.current_price {
        line.push_str(&format!(" price={price}"));
    }
    if let Some(reason) = &r.reason {
        line.push_str(&format!(" reason={reason}"));
    }
    if let Some(decision) = &report.decision {
        line.push_str(&format!(" selector={}", decision.reason));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "tfcascade",
            "--log-level",
            "debug",
            "run",
            "--rules",
            "rules.json",
            "--symbols",
            "BTCUSDT,ETHUSDT",
            "--start-from",
            "1h",
            "--force-run",
            "--workers",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.rules, PathBuf::from("rules.json"));
                assert_eq!(args.start_from, Some(Timeframe::H1));
                assert!(args.force_run);
                assert!(!args.force_timeframe_check);
                assert_eq!(args.workers, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_start_timeframe() {
        let parsed = Cli::try_parse_from([
            "tfcascade",
            "run",
            "--rules",
            "r.json",
            "--symbols",
            "BTCUSDT",
            "--start-from",
            "2h",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_now_accepts_offsets() {
        let t = parse_now("2024-05-01T14:00:00+02:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert!(parse_now("yesterday").is_err());
    }

    #[test]
    fn missing_settings_file_is_config_error() {
        let err = load_settings(Some(Path::new("/nonexistent/settings.ini"))).unwrap_err();
        assert!(matches!(err, CascadeError::ConfigParse { .. }));
        assert_eq!(load_settings(None).unwrap(), EngineSettings::default());
    }
}

//! CLI entry point for the manuscript downloader.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use manuscript_core::config::MAX_CONCURRENCY;
use manuscript_core::source::source_table;
use manuscript_core::{
    CanonicalManifest, Database, EngineConfig, JobHandle, JobId, JobOptions, JobReport, JobStatus,
    ManifestCache, Orchestrator, OutputFormat, ResolveContext, build_default_registry,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::{FileConfig, default_data_dir, load_default_file_config};
use cli::{Cli, Command, DownloadArgs};
use progress::JobProgress;

/// Process outcome mapped to the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Every page made it into the document.
    Success,
    /// A document was written with gaps.
    Partial,
    /// Nothing usable was produced.
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Partial => ExitCode::from(2),
            ProcessExit::Failure => ExitCode::from(1),
        }
    }
}

/// Maps page counts of a finished job to the exit outcome.
fn determine_exit_outcome(completed: usize, failed: usize) -> ProcessExit {
    if failed == 0 {
        ProcessExit::Success
    } else if completed > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            // Usage errors exit 1; exit 2 is reserved for partial documents.
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.verbose, cli.quiet);
    debug!(?cli, "CLI arguments parsed");

    match run(cli).await {
        Ok(exit) => exit.into(),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::from(1)
        }
    }
}

/// Priority: `RUST_LOG` > `--quiet` > `-v` count > `info`. Logs go to
/// stderr so `resolve --json` output stays machine-readable.
fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ProcessExit> {
    let quiet = cli.quiet;
    match cli.command {
        Command::Sources => {
            print_sources();
            Ok(ProcessExit::Success)
        }
        Command::Resolve {
            url,
            json,
            no_cache,
            state_db,
        } => {
            let file = load_default_file_config()?;
            let use_cache = !no_cache && file.manifest_cache.unwrap_or(true);
            let db = if use_cache {
                Some(open_database(&state_db_path(state_db, &file)).await?)
            } else {
                None
            };
            let manifest = resolve_manifest(&url, db.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                print_manifest(&manifest);
            }
            Ok(ProcessExit::Success)
        }
        Command::Download(args) => download(args, quiet).await,
        Command::Resume { job_id, state_db } => {
            let file = load_default_file_config()?;
            let state_db = state_db_path(state_db, &file);
            let db = open_database(&state_db).await?;
            let orchestrator = Orchestrator::new(engine_config(&file, None, &state_db), db)?;
            let job_id = JobId::from_string(job_id);
            let title = orchestrator
                .job(&job_id)
                .await?
                .map(|job| job.display_name)
                .unwrap_or_default();
            let handle = orchestrator.resume_job(&job_id).await?;
            drive_job(&orchestrator, handle, &title, quiet).await
        }
        Command::Jobs { state_db } => {
            let file = load_default_file_config()?;
            let state_db = state_db_path(state_db, &file);
            let db = open_database(&state_db).await?;
            let orchestrator = Orchestrator::new(engine_config(&file, None, &state_db), db)?;
            let jobs = orchestrator.jobs().await?;
            if jobs.is_empty() {
                println!("No persisted jobs in {}", state_db.display());
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {:>4} pages  {}  -> {}",
                    job.job_id,
                    job.status,
                    job.manifest.page_count(),
                    job.display_name,
                    job.options.output.display()
                );
            }
            Ok(ProcessExit::Success)
        }
    }
}

#[tracing::instrument(skip(args), fields(url = %args.url))]
async fn download(args: DownloadArgs, quiet: bool) -> Result<ProcessExit> {
    let file = load_default_file_config()?;
    let state_db = state_db_path(args.state_db.clone(), &file);
    let db = open_database(&state_db).await?;

    let use_cache = !args.no_cache && file.manifest_cache.unwrap_or(true);
    let manifest = resolve_manifest(&args.url, use_cache.then_some(&db)).await?;

    let format = args
        .format
        .map(OutputFormat::from)
        .or_else(|| file.format.as_deref().and_then(OutputFormat::parse))
        .unwrap_or_default();
    let output = args.output.clone().unwrap_or_else(|| {
        file.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(default_file_name(manifest.display_name(), format))
    });

    let mut options = JobOptions::new(output)
        .with_format(format)
        .with_invert(args.invert);
    if let Some(concurrency) = args.concurrency.map(usize::from).or(file.concurrency) {
        options = options.with_concurrency(concurrency);
    }
    if let Some(pages) = args.pages.clone() {
        options = options.with_page_range(pages);
    }

    let orchestrator = Orchestrator::new(engine_config(&file, Some(&args), &state_db), db)?;
    let title = manifest.display_name().to_string();
    let handle = orchestrator.submit_job(manifest, options).await?;
    drive_job(&orchestrator, handle, &title, quiet).await
}

/// Streams events into the progress bar, wires Ctrl-C to `cancel_job`, and
/// maps the report to an exit outcome.
async fn drive_job(
    orchestrator: &Orchestrator,
    mut handle: JobHandle,
    title: &str,
    quiet: bool,
) -> Result<ProcessExit> {
    let job_id = handle.id().clone();
    info!(job_id = %job_id, "job started");

    let interrupt = {
        let orchestrator = orchestrator.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling job");
                orchestrator.cancel_job(&job_id);
            }
        })
    };

    let show_progress = !quiet && io::stderr().is_terminal();
    let mut progress = JobProgress::new(show_progress, 0, title);
    while let Some(event) = handle.next_event().await {
        progress.apply(&event);
    }
    progress.finish();
    interrupt.abort();

    let report = handle.wait().await?;
    if !quiet {
        print_report(&report);
    }

    Ok(match report.status {
        JobStatus::Completed => {
            if let Err(error) = orchestrator.forget_job(&job_id).await {
                warn!(job_id = %job_id, %error, "failed to clean up finished job");
            }
            ProcessExit::Success
        }
        JobStatus::Cancelled => {
            eprintln!("Interrupted. Resume with: manuscript-downloader resume {job_id}");
            ProcessExit::Failure
        }
        JobStatus::Failed | JobStatus::Running => {
            determine_exit_outcome(report.completed_pages, report.failures.len())
        }
    })
}

async fn resolve_manifest(url: &str, db: Option<&Database>) -> Result<CanonicalManifest> {
    let registry = build_default_registry()?;
    let ctx = ResolveContext::new();
    let cancel = ctx.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let manifest = match db {
        Some(db) => {
            ManifestCache::new(db.clone())
                .resolve_cached(&registry, url, &ctx)
                .await
        }
        None => registry.resolve(url, &ctx).await,
    };
    interrupt.abort();

    let manifest = manifest?;
    for warning in manifest.warnings() {
        warn!(%warning, "manifest warning");
    }
    Ok(manifest)
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory '{}'", parent.display()))?;
    }
    Database::new(path)
        .await
        .with_context(|| format!("Failed to open state database '{}'", path.display()))
}

fn state_db_path(flag: Option<PathBuf>, file: &FileConfig) -> PathBuf {
    flag.or_else(|| file.state_db.clone())
        .unwrap_or_else(|| default_data_dir().join("state.db"))
}

/// Engine settings: CLI flags, then the config file, then defaults. Page
/// bytes live next to the state database unless `work_dir` is configured.
fn engine_config(file: &FileConfig, args: Option<&DownloadArgs>, state_db: &Path) -> EngineConfig {
    let work_dir = file.work_dir.clone().unwrap_or_else(|| {
        state_db
            .parent()
            .map_or_else(|| PathBuf::from("pages"), |dir| dir.join("pages"))
    });
    let mut config = EngineConfig::with_work_dir(work_dir);
    if let Some(concurrency) = file.concurrency {
        config.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
    }
    if let Some(limit) = file.per_host_limit {
        config.per_host_limit = limit;
    }
    if let Some(attempts) = args.and_then(|a| a.max_attempts).or(file.max_attempts) {
        config.max_attempts = attempts;
    }
    if let Some(ms) = args.and_then(|a| a.rate_limit).or(file.rate_limit_ms) {
        config.request_spacing = Duration::from_millis(ms);
    }
    if let Some(secs) = file.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.read_timeout_secs {
        config.read_timeout = Duration::from_secs(secs);
    }
    config
}

/// File name derived from a display name: path-hostile characters become
/// `_`, length is capped.
fn default_file_name(display_name: &str, format: OutputFormat) -> String {
    let mut stem: String = display_name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')' | ',') {
                c
            } else {
                '_'
            }
        })
        .collect();
    stem = stem.trim().trim_matches('.').to_string();
    if stem.chars().count() > 120 {
        stem = stem.chars().take(120).collect::<String>().trim_end().to_string();
    }
    if stem.is_empty() {
        stem = "manuscript".to_string();
    }
    format!("{stem}.{}", format.extension())
}

fn print_manifest(manifest: &CanonicalManifest) {
    println!("{}", manifest.display_name());
    println!("  source: {}", manifest.source_id());
    println!("  pages:  {}", manifest.page_count());
    for warning in manifest.warnings() {
        println!("  warning: {warning}");
    }
    for page in manifest.pages() {
        println!(
            "  {:>5}  {:<12}  {}",
            page.index + 1,
            page.label.as_deref().unwrap_or("-"),
            page.target.locator()
        );
    }
}

fn print_sources() {
    for descriptor in source_table() {
        let caps = descriptor.capabilities();
        let mut flags = Vec::new();
        if caps.geo_block.is_some() {
            flags.push("geo-restricted".to_string());
        }
        if caps.relaxed_tls {
            flags.push("relaxed-tls".to_string());
        }
        if let Some(max) = caps.max_concurrency {
            flags.push(format!("max {max} parallel"));
        }
        println!(
            "{:<20} {:<8} {}{}",
            descriptor.id(),
            descriptor.strategy().as_str(),
            descriptor.name(),
            if flags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", flags.join(", "))
            }
        );
    }
}

fn print_report(report: &JobReport) {
    match (&report.output, report.status) {
        (Some(output), _) => {
            println!(
                "Saved {} ({}/{} pages)",
                output.display(),
                report.completed_pages,
                report.total_pages
            );
        }
        (None, JobStatus::Cancelled) => {
            println!(
                "Cancelled after {}/{} pages (job {})",
                report.completed_pages, report.total_pages, report.job_id
            );
        }
        (None, _) => {}
    }
    if report.has_gaps() {
        println!("{} page(s) missing:", report.failures.len());
        for gap in &report.failures {
            println!("  page {}: {}", gap.index + 1, gap.reason);
        }
        if let Some(sidecar) = &report.gaps_sidecar {
            println!("Gap manifest: {}", sidecar.display());
        }
    }
    if let Some(assembly) = &report.assembly {
        for warning in &assembly.warnings {
            warn!(%warning, "assembly warning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_outcome_success_when_no_failures() {
        assert_eq!(determine_exit_outcome(3, 0), ProcessExit::Success);
    }

    #[test]
    fn test_exit_outcome_partial_when_mixed() {
        assert_eq!(determine_exit_outcome(8, 2), ProcessExit::Partial);
    }

    #[test]
    fn test_exit_outcome_failure_when_all_failed() {
        assert_eq!(determine_exit_outcome(0, 2), ProcessExit::Failure);
    }

    #[test]
    fn test_default_file_name_sanitizes() {
        assert_eq!(
            default_file_name("Vat. lat. 3225 / Vergilius", OutputFormat::Pdf),
            "Vat. lat. 3225 _ Vergilius.pdf"
        );
        assert_eq!(default_file_name("  ", OutputFormat::Cbz), "manuscript.cbz");
        assert_eq!(default_file_name("a:b*c?", OutputFormat::Pdf), "a_b_c_.pdf");
    }

    #[test]
    fn test_engine_config_layers_flags_over_file() {
        let file = FileConfig {
            max_attempts: Some(5),
            rate_limit_ms: Some(100),
            concurrency: Some(6),
            ..FileConfig::default()
        };
        let args = DownloadArgs {
            url: "u".into(),
            output: None,
            format: None,
            concurrency: None,
            pages: None,
            invert: false,
            rate_limit: Some(900),
            max_attempts: None,
            no_cache: false,
            state_db: None,
        };
        let config = engine_config(&file, Some(&args), Path::new("/data/state.db"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.request_spacing, Duration::from_millis(900));
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.work_dir, PathBuf::from("/data/pages"));
    }

    #[test]
    fn test_state_db_path_prefers_flag() {
        let file = FileConfig {
            state_db: Some(PathBuf::from("/cfg/state.db")),
            ..FileConfig::default()
        };
        assert_eq!(
            state_db_path(Some(PathBuf::from("/flag.db")), &file),
            PathBuf::from("/flag.db")
        );
        assert_eq!(state_db_path(None, &file), PathBuf::from("/cfg/state.db"));
    }
}

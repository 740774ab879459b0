use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use indicatif::ProgressBar;
use reqwest::Url;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::args::BaseArgs;
use crate::config::{self, FileConfig};
use crate::pipeline::{Pipeline, PipelineReport, StopHandle};
use crate::planner::{
    BlockSizing, Plan, PlanConfig, ProgressConfig, DEFAULT_BLOCK_SPAN, DEFAULT_PROGRESS_METRIC,
};
use crate::remote::prompb::LabelMatcher;
use crate::remote::{parse_selector, Auth, ClientOptions, RemoteClient, DEFAULT_SELECTOR};
use crate::store::{CheckpointReader, NoCheckpoints, ProgressSeries};
use crate::ui::{
    bounded_bar, format_bytes, format_duration, format_timestamp_ms, format_u64_commas,
    print_command_status, spinner_bar, CommandStatus,
};
use crate::utils::pluralize;

const DEFAULT_MIN_BLOCK_SPAN: Duration = Duration::from_secs(60);
const DEFAULT_MAX_BLOCK_SPAN: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_TARGET_BLOCK_BYTES: u64 = 16 * 1024 * 1024;
const DRY_RUN_PREVIEW: usize = 10;

#[derive(Debug, Clone, Args)]
pub struct RangeArgs {
    /// Start of the migration range (RFC 3339, Unix seconds, or `now`)
    #[arg(long, env = "PROM_MIGRATOR_START")]
    pub start: Option<String>,

    /// End of the migration range, exclusive [default: now]
    #[arg(long, env = "PROM_MIGRATOR_END")]
    pub end: Option<String>,

    /// Name identifying this migration across restarts
    #[arg(long, env = "PROM_MIGRATOR_MIGRATION_NAME")]
    pub migration_name: Option<String>,

    /// Metric holding the checkpoint samples
    #[arg(long, env = "PROM_MIGRATOR_PROGRESS_METRIC_NAME")]
    pub progress_metric_name: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Remote-write endpoint of the destination
    #[arg(long, env = "PROM_MIGRATOR_WRITER_URL")]
    pub writer_url: Option<String>,

    /// Remote-read endpoint used to find checkpoints [default: writer url with /write replaced by /read]
    #[arg(long, env = "PROM_MIGRATOR_PROGRESS_URL")]
    pub progress_url: Option<String>,

    /// Basic-auth username for the destination
    #[arg(long, env = "PROM_MIGRATOR_WRITER_USERNAME")]
    pub writer_username: Option<String>,

    /// Basic-auth password for the destination
    #[arg(long, env = "PROM_MIGRATOR_WRITER_PASSWORD", hide_env_values = true)]
    pub writer_password: Option<String>,

    /// Bearer token for the destination
    #[arg(long, env = "PROM_MIGRATOR_WRITER_BEARER_TOKEN", hide_env_values = true)]
    pub writer_bearer_token: Option<String>,

    /// Per-request timeout, e.g. `90s` or `5m` [default: 5m]
    #[arg(long, env = "PROM_MIGRATOR_TIMEOUT")]
    pub timeout: Option<String>,

    /// Retries for transient request failures [default: 3]
    #[arg(long, env = "PROM_MIGRATOR_MAX_RETRIES")]
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Remote-read endpoint of the source
    #[arg(long, env = "PROM_MIGRATOR_READER_URL")]
    pub reader_url: Option<String>,

    /// Basic-auth username for the source
    #[arg(long, env = "PROM_MIGRATOR_READER_USERNAME")]
    pub reader_username: Option<String>,

    /// Basic-auth password for the source
    #[arg(long, env = "PROM_MIGRATOR_READER_PASSWORD", hide_env_values = true)]
    pub reader_password: Option<String>,

    /// Bearer token for the source
    #[arg(long, env = "PROM_MIGRATOR_READER_BEARER_TOKEN", hide_env_values = true)]
    pub reader_bearer_token: Option<String>,

    /// Series selector to migrate [default: every series]
    #[arg(long = "match", env = "PROM_MIGRATOR_MATCH")]
    pub selector: Option<String>,

    /// Time span of each block [default: 1h]
    #[arg(long, env = "PROM_MIGRATOR_BLOCK_DURATION")]
    pub block_duration: Option<String>,

    /// Resize blocks towards --target-block-bytes as data is read
    #[arg(long, env = "PROM_MIGRATOR_ADAPTIVE")]
    pub adaptive: bool,

    /// Smallest adaptive block span [default: 1m]
    #[arg(long, env = "PROM_MIGRATOR_MIN_BLOCK_DURATION", requires = "adaptive")]
    pub min_block_duration: Option<String>,

    /// Largest adaptive block span [default: 1d]
    #[arg(long, env = "PROM_MIGRATOR_MAX_BLOCK_DURATION", requires = "adaptive")]
    pub max_block_duration: Option<String>,

    /// Encoded payload size adaptive blocks aim for [default: 16 MiB]
    #[arg(long, env = "PROM_MIGRATOR_TARGET_BLOCK_BYTES", requires = "adaptive")]
    pub target_block_bytes: Option<u64>,

    /// Do not read or write checkpoint samples
    #[arg(long, env = "PROM_MIGRATOR_NO_PROGRESS")]
    pub no_progress: bool,

    /// Print the block plan without moving data
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Fully resolved inputs of a `migrate` run.
#[derive(Debug, Clone)]
struct MigrateSettings {
    plan: PlanConfig,
    reader_url: String,
    reader: ClientOptions,
    writer_url: String,
    writer: ClientOptions,
    progress_url: Option<String>,
    selector: Vec<LabelMatcher>,
}

#[derive(Debug, Clone)]
struct StatusSettings {
    progress: ProgressSeries,
    mint: i64,
    maxt: i64,
    progress_url: String,
    client: ClientOptions,
}

pub async fn run(base: BaseArgs, args: MigrateArgs) -> Result<()> {
    let file = config::load_optional(base.config.as_deref())?;
    let settings = resolve_migrate(&args, &file, Utc::now())?;
    let json_output = base.json;

    let mut plan = Plan::new(settings.plan.clone());
    let proceed = match &settings.progress_url {
        Some(url) => {
            let checkpoints = RemoteClient::new(url, &settings.writer)?;
            init_plan(&mut plan, &checkpoints).await?
        }
        None => init_plan(&mut plan, &NoCheckpoints).await?,
    };

    if !proceed {
        return print_up_to_date(&plan, json_output);
    }
    if settings.plan.dry_run {
        return print_dry_run(&plan, json_output);
    }

    let source = Arc::new(RemoteClient::new(&settings.reader_url, &settings.reader)?);
    let sink = Arc::new(RemoteClient::new(&settings.writer_url, &settings.writer)?);
    info!(
        job = %plan.job_name(),
        reader = %source.url(),
        writer = %sink.url(),
        "starting migration"
    );

    let pb = if json_output {
        ProgressBar::hidden()
    } else {
        match plan.pending_blocks() {
            Some(total) => bounded_bar(total as u64, "Migrating", "blocks"),
            None => spinner_bar("Migrating", "blocks"),
        }
    };

    let ctx = CancellationToken::new();
    let stop = StopHandle::new();
    let signal_task = tokio::spawn(watch_interrupts(stop.clone(), ctx.clone()));

    let started = Instant::now();
    let mint = plan.effective_mint().unwrap_or(settings.plan.mint);
    let resumed = plan.resumed_from().is_some();
    let result = Pipeline {
        plan,
        source,
        sink,
        selector: settings.selector,
        ctx,
        stop: Some(stop),
    }
    .run(&pb)
    .await;
    signal_task.abort();
    pb.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if settings.progress_url.is_some() {
                print_command_status(
                    CommandStatus::Warning,
                    "Committed blocks are checkpointed; rerun the same command to resume",
                );
            }
            return Err(anyhow!(err).context("migration failed"));
        }
    };
    debug!(stages = ?report.completion_order, "pipeline stages finished");

    print_report(&Summary {
        job: &settings.plan.job_name,
        mint,
        maxt: settings.plan.maxt,
        resumed,
        report: &report,
        elapsed: started.elapsed(),
        json: json_output,
    })
}

pub async fn run_status(base: BaseArgs, args: StatusArgs) -> Result<()> {
    let file = config::load_optional(base.config.as_deref())?;
    let settings = resolve_status(&args, &file, Utc::now())?;
    let client = RemoteClient::new(&settings.progress_url, &settings.client)?;

    let checkpoint = client
        .last_checkpoint(&settings.progress, settings.mint, settings.maxt)
        .await
        .with_context(|| {
            format!(
                "failed to read progress of '{}' from {}",
                settings.progress.job, settings.progress_url
            )
        })?;
    let committed_until = checkpoint
        .filter(|checkpoint| checkpoint.timestamp > settings.mint)
        .map(|checkpoint| checkpoint.timestamp.min(settings.maxt));
    let remaining_from = committed_until.unwrap_or(settings.mint);
    let complete = remaining_from >= settings.maxt;

    if base.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "job": settings.progress.job,
                "progress_metric": settings.progress.metric_name,
                "mint": settings.mint,
                "maxt": settings.maxt,
                "committed_until": committed_until,
                "last_block_mint": checkpoint.map(|checkpoint| checkpoint.block_mint()),
                "complete": complete,
            }))?
        );
        return Ok(());
    }

    println!("Migration '{}'", settings.progress.job);
    println!(
        "  Range: {} .. {}",
        format_timestamp_ms(settings.mint),
        format_timestamp_ms(settings.maxt)
    );
    match (committed_until, checkpoint) {
        (Some(until), Some(checkpoint)) => {
            println!("  Committed until: {}", format_timestamp_ms(until));
            println!(
                "  Last block: {} .. {}",
                format_timestamp_ms(checkpoint.block_mint()),
                format_timestamp_ms(checkpoint.timestamp)
            );
        }
        _ => println!("  Committed until: nothing committed yet"),
    }
    if complete {
        print_command_status(CommandStatus::Success, "Migration complete");
    } else {
        println!(
            "  Remaining: {} .. {}",
            format_timestamp_ms(remaining_from),
            format_timestamp_ms(settings.maxt)
        );
    }
    Ok(())
}

async fn init_plan<C: CheckpointReader>(plan: &mut Plan, checkpoints: &C) -> Result<bool> {
    plan.init(checkpoints)
        .await
        .with_context(|| format!("failed to plan migration '{}'", plan.job_name()))
}

/// First interrupt requests a clean stop after the current block; the second
/// abandons in-flight work.
async fn watch_interrupts(stop: StopHandle, ctx: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("interrupt received, stopping after the current block (press Ctrl-C again to abort)");
    stop.stop();
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("second interrupt received, cancelling");
        ctx.cancel();
    }
}

fn resolve_migrate(args: &MigrateArgs, file: &FileConfig, now: DateTime<Utc>) -> Result<MigrateSettings> {
    let (job_name, mint, maxt) = resolve_range(&args.range, file, now)?;
    let progress_enabled = !args.no_progress;
    let progress = ProgressConfig {
        enabled: progress_enabled,
        metric_name: progress_metric_name(&args.range, file),
    };

    let block_span = optional_duration("--block-duration", pick(&args.block_duration, &file.block_duration))?
        .unwrap_or(DEFAULT_BLOCK_SPAN);
    let sizing = if args.adaptive {
        BlockSizing::Adaptive {
            initial: block_span,
            min: optional_duration(
                "--min-block-duration",
                pick(&args.min_block_duration, &file.min_block_duration),
            )?
            .unwrap_or(DEFAULT_MIN_BLOCK_SPAN),
            max: optional_duration(
                "--max-block-duration",
                pick(&args.max_block_duration, &file.max_block_duration),
            )?
            .unwrap_or(DEFAULT_MAX_BLOCK_SPAN),
            target_bytes: args
                .target_block_bytes
                .or(file.target_block_bytes)
                .unwrap_or(DEFAULT_TARGET_BLOCK_BYTES),
        }
    } else {
        BlockSizing::Fixed { span: block_span }
    };

    let selector_text = pick(&args.selector, &file.selector).unwrap_or(DEFAULT_SELECTOR);
    let selector = parse_selector(selector_text).context("invalid --match selector")?;

    let reader_url = pick(&args.reader_url, &file.reader_url)
        .context("--reader-url is required")?
        .to_string();
    let writer_url = writer_url(&args.connection, file)?;
    let progress_url = if progress_enabled {
        Some(progress_url(&args.connection, file, &writer_url)?)
    } else {
        None
    };

    let (timeout, max_retries) = transport(&args.connection, file)?;
    let reader = ClientOptions {
        timeout,
        max_retries,
        auth: endpoint_auth(
            "reader",
            &args.reader_username,
            &args.reader_password,
            &args.reader_bearer_token,
        )?,
    };
    let writer = ClientOptions {
        timeout,
        max_retries,
        auth: endpoint_auth(
            "writer",
            &args.connection.writer_username,
            &args.connection.writer_password,
            &args.connection.writer_bearer_token,
        )?,
    };

    Ok(MigrateSettings {
        plan: PlanConfig {
            job_name,
            mint,
            maxt,
            progress,
            sizing,
            dry_run: args.dry_run,
        },
        reader_url,
        reader,
        writer_url,
        writer,
        progress_url,
        selector,
    })
}

fn resolve_status(args: &StatusArgs, file: &FileConfig, now: DateTime<Utc>) -> Result<StatusSettings> {
    let (job_name, mint, maxt) = resolve_range(&args.range, file, now)?;
    let progress_url = match pick(&args.connection.progress_url, &file.progress_url) {
        Some(url) => url.to_string(),
        None => {
            let writer_url = writer_url(&args.connection, file)
                .context("--progress-url or --writer-url is required")?;
            progress_url(&args.connection, file, &writer_url)?
        }
    };
    let (timeout, max_retries) = transport(&args.connection, file)?;
    Ok(StatusSettings {
        progress: ProgressSeries::new(progress_metric_name(&args.range, file), job_name),
        mint,
        maxt,
        progress_url,
        client: ClientOptions {
            timeout,
            max_retries,
            auth: endpoint_auth(
                "writer",
                &args.connection.writer_username,
                &args.connection.writer_password,
                &args.connection.writer_bearer_token,
            )?,
        },
    })
}

fn resolve_range(args: &RangeArgs, file: &FileConfig, now: DateTime<Utc>) -> Result<(String, i64, i64)> {
    let job_name = pick(&args.migration_name, &file.migration_name)
        .context("--migration-name is required")?
        .to_string();
    let start = pick(&args.start, &file.start).context("--start is required")?;
    let mint = config::parse_timestamp(start, now).context("invalid --start")?;
    let maxt = match pick(&args.end, &file.end) {
        Some(end) => config::parse_timestamp(end, now).context("invalid --end")?,
        None => now.timestamp_millis(),
    };
    if mint >= maxt {
        bail!(
            "--start ({}) must be before --end ({})",
            format_timestamp_ms(mint),
            format_timestamp_ms(maxt)
        );
    }
    Ok((job_name, mint, maxt))
}

fn progress_metric_name(args: &RangeArgs, file: &FileConfig) -> String {
    pick(&args.progress_metric_name, &file.progress_metric_name)
        .unwrap_or(DEFAULT_PROGRESS_METRIC)
        .to_string()
}

fn writer_url(args: &ConnectionArgs, file: &FileConfig) -> Result<String> {
    pick(&args.writer_url, &file.writer_url)
        .map(str::to_string)
        .context("--writer-url is required")
}

fn progress_url(args: &ConnectionArgs, file: &FileConfig, writer_url: &str) -> Result<String> {
    match pick(&args.progress_url, &file.progress_url) {
        Some(url) => Ok(url.to_string()),
        None => derive_read_url(writer_url),
    }
}

/// Read endpoint next to a remote-write endpoint: `.../write` becomes
/// `.../read`.
fn derive_read_url(writer_url: &str) -> Result<String> {
    let mut url = Url::parse(writer_url).with_context(|| format!("invalid --writer-url '{writer_url}'"))?;
    let Some(prefix) = url.path().strip_suffix("/write") else {
        bail!("cannot derive a read endpoint from '{writer_url}'; set --progress-url");
    };
    let path = format!("{prefix}/read");
    url.set_path(&path);
    Ok(url.to_string())
}

fn transport(args: &ConnectionArgs, file: &FileConfig) -> Result<(Duration, usize)> {
    let defaults = ClientOptions::default();
    let timeout = optional_duration("--timeout", pick(&args.timeout, &file.timeout))?
        .unwrap_or(defaults.timeout);
    if timeout.is_zero() {
        bail!("--timeout must be greater than zero");
    }
    let max_retries = args
        .max_retries
        .or(file.max_retries)
        .unwrap_or(defaults.max_retries);
    Ok((timeout, max_retries))
}

fn endpoint_auth(
    endpoint: &str,
    username: &Option<String>,
    password: &Option<String>,
    bearer: &Option<String>,
) -> Result<Option<Auth>> {
    match (username, password, bearer) {
        (None, None, None) => Ok(None),
        (None, None, Some(token)) => Ok(Some(Auth::Bearer(token.clone()))),
        (Some(username), password, None) => Ok(Some(Auth::Basic {
            username: username.clone(),
            password: password.clone().unwrap_or_default(),
        })),
        (None, Some(_), None) => bail!("--{endpoint}-password requires --{endpoint}-username"),
        (_, _, Some(_)) => {
            bail!("--{endpoint}-bearer-token cannot be combined with basic auth")
        }
    }
}

fn pick<'a>(flag: &'a Option<String>, file: &'a Option<String>) -> Option<&'a str> {
    flag.as_deref().or(file.as_deref())
}

fn optional_duration(flag: &str, raw: Option<&str>) -> Result<Option<Duration>> {
    raw.map(|raw| config::parse_duration(raw).with_context(|| format!("invalid {flag}")))
        .transpose()
}

fn print_up_to_date(plan: &Plan, json_output: bool) -> Result<()> {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "up_to_date",
                "job": plan.job_name(),
                "maxt": plan.config().maxt,
            }))?
        );
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Migration '{}' already covers everything up to {}",
                plan.job_name(),
                format_timestamp_ms(plan.config().maxt)
            ),
        );
    }
    Ok(())
}

fn print_dry_run(plan: &Plan, json_output: bool) -> Result<()> {
    let mint = plan.effective_mint().unwrap_or(plan.config().mint);
    let maxt = plan.config().maxt;
    let blocks = plan.preview(DRY_RUN_PREVIEW);

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "planned",
                "job": plan.job_name(),
                "mint": mint,
                "maxt": maxt,
                "resumed": plan.resumed_from().is_some(),
                "pending_blocks": plan.pending_blocks(),
                "blocks": blocks
                    .iter()
                    .map(|(mint, maxt)| json!({ "mint": mint, "maxt": maxt }))
                    .collect::<Vec<_>>(),
            }))?
        );
        return Ok(());
    }

    println!("Dry run for migration '{}'", plan.job_name());
    if plan.resumed_from().is_some() {
        println!("  Resuming from checkpoint at {}", format_timestamp_ms(mint));
    }
    println!(
        "  Range: {} .. {}",
        format_timestamp_ms(mint),
        format_timestamp_ms(maxt)
    );
    match plan.pending_blocks() {
        Some(total) => println!(
            "  Blocks: {} {}",
            format_u64_commas(total as u64),
            pluralize(total as u64, "block", None)
        ),
        None => println!("  Blocks: sized adaptively while reading"),
    }
    for (mint, maxt) in &blocks {
        println!("    {} .. {}", format_timestamp_ms(*mint), format_timestamp_ms(*maxt));
    }
    if plan.pending_blocks().is_some_and(|total| total > blocks.len()) {
        println!("    ...");
    }
    Ok(())
}

struct Summary<'a> {
    job: &'a str,
    mint: i64,
    maxt: i64,
    resumed: bool,
    report: &'a PipelineReport,
    elapsed: Duration,
    json: bool,
}

fn print_report(summary: &Summary<'_>) -> Result<()> {
    let report = summary.report;
    let interrupted = report.read.stopped_early;
    if summary.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": if interrupted { "interrupted" } else { "completed" },
                "job": summary.job,
                "mint": summary.mint,
                "maxt": summary.maxt,
                "resumed": summary.resumed,
                "committed_until": report.write.committed_until,
                "blocks": report.write.blocks,
                "samples": report.write.samples,
                "checkpoints": report.write.checkpoints,
                "samples_read": report.read.samples,
                "bytes_read": report.read.bytes,
                "elapsed_ms": summary.elapsed.as_millis() as u64,
            }))?
        );
        return Ok(());
    }

    let blocks = report.write.blocks;
    if interrupted {
        println!("Migration interrupted");
    } else {
        println!("Migration complete");
    }
    println!("  Job: {}", summary.job);
    println!(
        "  Range: {} .. {}{}",
        format_timestamp_ms(summary.mint),
        format_timestamp_ms(summary.maxt),
        if summary.resumed { " (resumed)" } else { "" }
    );
    println!("  Time: {}", format_duration(summary.elapsed.as_secs()));
    println!(
        "  Blocks: {} {}",
        format_u64_commas(blocks),
        pluralize(blocks, "block", None)
    );
    println!("  Samples: {}", format_u64_commas(report.write.samples as u64));
    println!(
        "  Data: {} ({} bytes)",
        format_bytes(report.read.bytes as f64),
        format_u64_commas(report.read.bytes)
    );
    if let Some(until) = report.write.committed_until {
        println!("  Committed until: {}", format_timestamp_ms(until));
    }
    if interrupted {
        println!("  Resume: rerun the same command");
    }
    Ok(())
}

//! CLI binary for paperdrop.
//!
//! `paperdrop serve` runs the HTTP surface and the folder-cache scheduler;
//! `paperdrop send` runs a single delivery in-process and renders its
//! progress. Both are thin shims that map flags onto `DeliveryConfig`.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use paperdrop::folders::DEFAULT_IDENTITY;
use paperdrop::pipeline::input::UserAgentPool;
use paperdrop::remote::CliRemoteStore;
use paperdrop::server::{self, AppState};
use paperdrop::{
    ConflictResolution, CoverPage, DeliveryConfig, DeliveryRequest, FolderCache, Job, JobStatus,
    Pipeline, SourceSpec,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the HTTP service
  paperdrop serve --listen 0.0.0.0:8080

  # Send a paper, compressed, into /Papers
  paperdrop send https://arxiv.org/pdf/1706.03762 --remote-dir /Papers --compress

  # Daily managed delivery with a 14-day retention window
  paperdrop send news.pdf --prefix "Daily News" --manage --retention-days 14

  # Photo as a full-screen page, archived locally
  paperdrop send whiteboard.jpg --archive --prefix Meetings

EXTERNAL TOOLS:
  gs      Ghostscript, used by --compress     (PAPERDROP_GHOSTSCRIPT)
  rmapi   tablet sync CLI, used for delivery  (PAPERDROP_REMOTE_CLI)
"#;

/// Deliver documents to an e-ink tablet.
#[derive(Parser, Debug)]
#[command(
    name = "paperdrop",
    version,
    about = "Deliver URLs, images and PDFs to an e-ink tablet",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: ConfigArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAPERDROP_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PAPERDROP_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the folder refresh scheduler.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "PAPERDROP_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,

        /// Extra identity for folder listings, with its sync-tool config.
        #[arg(long = "identity", value_name = "NAME=CONFIG_PATH")]
        identities: Vec<String>,
    },
    /// Deliver one URL or file and wait for the result.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    /// URL, text containing a URL, or a local file path.
    source: String,

    /// Folder/filename stem for archive and managed names.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Remote folder to upload into.
    #[arg(long, default_value = "/")]
    remote_dir: String,

    /// Recompress PDFs with Ghostscript.
    #[arg(long)]
    compress: bool,

    /// Date-rename the upload and clean up old ones.
    #[arg(long)]
    manage: bool,

    /// Keep a permanent local copy.
    #[arg(long)]
    archive: bool,

    /// Days managed uploads are kept on the device.
    #[arg(long, default_value_t = 7)]
    retention_days: u32,

    /// What to do when the remote name already exists.
    #[arg(long, value_enum, default_value = "abort")]
    conflict: ConflictArg,

    /// Use the first page as the document thumbnail.
    #[arg(long)]
    first_page_cover: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ConflictArg {
    Abort,
    Overwrite,
    ContentOnly,
}

impl From<ConflictArg> for ConflictResolution {
    fn from(v: ConflictArg) -> Self {
        match v {
            ConflictArg::Abort => ConflictResolution::Abort,
            ConflictArg::Overwrite => ConflictResolution::Overwrite,
            ConflictArg::ContentOnly => ConflictResolution::ContentOnly,
        }
    }
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Target page width in pixels.
    #[arg(long, global = true, env = "PAPERDROP_PAGE_WIDTH", default_value_t = 1404)]
    page_width: u32,

    /// Target page height in pixels.
    #[arg(long, global = true, env = "PAPERDROP_PAGE_HEIGHT", default_value_t = 1872)]
    page_height: u32,

    /// Screen density (72–600).
    #[arg(long, global = true, env = "PAPERDROP_DPI", default_value_t = 226,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Ghostscript -dCompatibilityLevel.
    #[arg(long, global = true, env = "PAPERDROP_PDF_LEVEL", default_value = "1.4")]
    pdf_level: String,

    /// Ghostscript -dPDFSETTINGS preset.
    #[arg(long, global = true, env = "PAPERDROP_PDF_PRESET", default_value = "/ebook")]
    pdf_preset: String,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "PAPERDROP_DOWNLOAD_TIMEOUT", default_value_t = 60)]
    download_timeout: u64,

    /// URL of a JSON array of browser user agents.
    #[arg(long, global = true, env = "PAPERDROP_USER_AGENTS_URL")]
    user_agents_url: Option<String>,

    /// Ephemeral storage directory.
    #[arg(long, global = true, env = "PAPERDROP_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,

    /// Permanent archive directory.
    #[arg(long, global = true, env = "PAPERDROP_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Ghostscript binary.
    #[arg(long, global = true, env = "PAPERDROP_GHOSTSCRIPT", default_value = "gs")]
    ghostscript: String,

    /// Tablet sync CLI binary.
    #[arg(long, global = true, env = "PAPERDROP_REMOTE_CLI", default_value = "rmapi")]
    remote_cli: String,

    /// Folder cache refresh interval in seconds.
    #[arg(long, global = true, env = "PAPERDROP_FOLDER_REFRESH", default_value_t = 3600)]
    folder_refresh: u64,

    /// Minimum gap between background folder refreshes in seconds.
    #[arg(long, global = true, env = "PAPERDROP_REFRESH_GAP", default_value_t = 30)]
    refresh_gap: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // `send` draws a progress bar; keep library INFO logs out of its way.
    let show_progress = !cli.quiet && matches!(cli.command, Command::Send(_));
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli.config)?;

    match cli.command {
        Command::Serve { listen, identities } => serve(config, &listen, &identities).await,
        Command::Send(args) => send(config, args, show_progress, cli.quiet).await,
    }
}

/// Map CLI args to `DeliveryConfig`.
fn build_config(args: &ConfigArgs) -> Result<DeliveryConfig> {
    let mut builder = DeliveryConfig::builder()
        .page_size(args.page_width, args.page_height)
        .dpi(args.dpi)
        .pdf_compatibility_level(&args.pdf_level)
        .pdf_quality_preset(&args.pdf_preset)
        .download_timeout_secs(args.download_timeout)
        .ghostscript_bin(&args.ghostscript)
        .remote_cli_bin(&args.remote_cli)
        .folder_refresh_interval_secs(args.folder_refresh)
        .background_refresh_gap_secs(args.refresh_gap);
    if let Some(url) = &args.user_agents_url {
        builder = builder.user_agents_url(url);
    }
    if let Some(dir) = &args.upload_dir {
        builder = builder.upload_dir(dir);
    }
    if let Some(dir) = &args.archive_dir {
        builder = builder.archive_dir(dir);
    }
    builder.build().context("Invalid configuration")
}

async fn build_pipeline(config: &DeliveryConfig) -> Result<Arc<Pipeline>> {
    let agents = UserAgentPool::load(config.user_agents_url.as_deref(), config.download_timeout()).await;
    Pipeline::builder(config.clone())
        .user_agents(Arc::new(agents))
        .build()
        .context("Failed to build pipeline")
}

async fn serve(config: DeliveryConfig, listen: &str, identities: &[String]) -> Result<()> {
    let pipeline = build_pipeline(&config).await?;

    let folders = FolderCache::new(&config);
    folders.register(DEFAULT_IDENTITY, Arc::clone(pipeline.remote()));
    for spec in identities {
        let (name, config_path) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("--identity expects NAME=CONFIG_PATH, got '{spec}'"))?;
        let remote = CliRemoteStore::new(&config.remote_cli_bin).with_config_path(config_path);
        folders.register(name.trim(), Arc::new(remote));
    }
    let scheduler = folders.spawn_scheduler();

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    let result = server::serve(listener, AppState::new(pipeline, folders)).await;
    scheduler.abort();
    result.context("HTTP server failed")
}

/// Build the request source: URLs go through as text, files are read and
/// sent as bytes so the caller's file is left alone.
async fn source_for(input: &str) -> Result<SourceSpec> {
    let path = Path::new(input);
    if !input.contains("://") && path.is_file() {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(SourceSpec::Bytes {
            filename,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        });
    }
    Ok(SourceSpec::Url {
        body: input.to_string(),
    })
}

async fn send(config: DeliveryConfig, args: SendArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let pipeline = build_pipeline(&config).await?;
    let request = DeliveryRequest::new(source_for(&args.source).await?)
        .prefix(args.prefix)
        .remote_dir(args.remote_dir)
        .compress(args.compress)
        .manage(args.manage)
        .archive(args.archive)
        .retention_days(args.retention_days)
        .conflict_resolution(args.conflict.into())
        .cover_page(if args.first_page_cover {
            CoverPage::First
        } else {
            CoverPage::Current
        });

    let id = pipeline
        .enqueue(request)
        .await
        .map_err(|code| anyhow!("Request rejected: {code}"))?;

    let bar = if show_progress {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold:>12}  [{bar:42.green/238}] {pos:>3}%  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("pending");
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    } else {
        None
    };

    // The push stream may drop updates; re-read the store once a second.
    let store = pipeline.store();
    let mut updates = store.subscribe(&id);
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let job: Job = loop {
        let next = tokio::select! {
            pushed = updates.recv() => pushed,
            _ = poll.tick() => store.get(&id),
        };
        let job = next.ok_or_else(|| anyhow!("Job {id} disappeared"))?;

        if let Some(bar) = &bar {
            let stage = job
                .operation
                .map(|op| format!("{op:?}").to_lowercase())
                .unwrap_or_else(|| "pending".to_string());
            bar.set_prefix(stage);
            bar.set_position(u64::from(job.progress));
        }
        if job.status.is_terminal() {
            break job;
        }
    };
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    match job.status {
        JobStatus::Success => {
            let path = job
                .data
                .as_ref()
                .and_then(|d| d.get("path"))
                .cloned()
                .unwrap_or_default();
            if !quiet {
                eprintln!("{} delivered → {}", green("✔"), bold(&path));
            }
            Ok(())
        }
        _ => {
            let detail = job
                .data
                .as_ref()
                .and_then(|d| d.get("detail"))
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            eprintln!("{} {}{}", red("✘"), bold(&job.message), detail);
            bail!("Delivery failed: {}", job.message)
        }
    }
}

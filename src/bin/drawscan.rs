//! CLI binary for edgequake-drawscan.
//!
//! `drawscan serve` runs the HTTP service; `drawscan run <file>` drives the
//! same pipeline in-process and prints the aggregated JSON report. Both
//! rasterise PDF pages by re-running this binary as `drawscan render-page`,
//! one process per page.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_drawscan::pipeline::render::{self, RenderSettings};
use edgequake_drawscan::{
    AggregateScope, DrawingService, PipelineConfig, ProgressCallback, Stage, StageProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
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
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One progress bar, re-armed at the start of every stage.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening drawing…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl StageProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.errors.store(0, Ordering::SeqCst);
        self.bar.set_style(style);
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(stage.to_string());
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total} pages"))
        ));
    }

    fn on_unit_complete(&self, _stage: Stage, page: usize, total: usize) {
        self.bar
            .println(format!("  {} Page {:>3}/{:<3}", green("✓"), page, total));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, _stage: Stage, page: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['\u{2026}']).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page,
            total,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: Stage, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        if failed == 0 {
            self.bar.println(format!(
                "{} {}: {} pages done",
                green("✔"),
                stage,
                bold(&success_count.to_string())
            ));
        } else {
            self.bar.println(format!(
                "{} {}: {}/{} pages  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                stage,
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            ));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve the HTTP API on port 8000
  drawscan serve --addr 0.0.0.0:8000

  # One-shot analysis of a PDF set
  drawscan run plans.pdf -o report.json

  # CAD sheet (needs the conversion service credential)
  CONVERT_API_SECRET=... drawscan run level2.dwg

  # Skip title-block extraction
  drawscan run plans.pdf --no-metadata

ENVIRONMENT VARIABLES:
  MODEL_PATH            ONNX detection model (default model/best.onnx)
  CONVERT_API_SECRET    Credential for .dwf/.dwfx/.dwg/.dxf conversion
  GEMINI_API_KEY        Credential for title-block extraction (gemini provider)
  PDFIUM_LIB_PATH       Path to an existing libpdfium
  RUST_LOG              Overrides -v / -q log filtering
"#;

/// Detect fixture symbols and title-block metadata in engineering drawings.
#[derive(Parser, Debug)]
#[command(
    name = "drawscan",
    version,
    about = "Detect fixture symbols and title-block metadata in engineering drawings",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DRAWSCAN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DRAWSCAN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "DRAWSCAN_ADDR", default_value = "127.0.0.1:8000")]
        addr: String,
    },
    /// Analyse one drawing file and print the report.
    Run {
        /// PDF, CAD (.dwf/.dwfx/.dwg/.dxf) or image (.png/.jpg) file.
        input: PathBuf,

        /// Write the JSON report to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disable progress bar.
        #[arg(long, env = "DRAWSCAN_NO_PROGRESS")]
        no_progress: bool,
    },
    /// Render one PDF page to a JPEG (used by the pipeline's worker processes).
    #[command(hide = true)]
    RenderPage {
        source: PathBuf,
        /// 0-based page index.
        index: usize,
        dest: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Directory uploads are stored in.
    #[arg(long, global = true, env = "DRAWSCAN_UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    /// Directory page images and inference runs are written to.
    #[arg(long, global = true, env = "DRAWSCAN_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// ONNX detection model.
    #[arg(long, global = true, env = "MODEL_PATH", default_value = "model/best.onnx")]
    model: PathBuf,

    /// Concurrent rasterisation / inference workers.
    #[arg(short = 'w', long, global = true, env = "DRAWSCAN_MAX_WORKERS", default_value_t = 4)]
    max_workers: usize,

    /// Rendering scale factor (0.5–12).
    #[arg(long, global = true, env = "DRAWSCAN_SCALE", default_value_t = 6.0)]
    scale: f32,

    /// Longest edge of a rendered page, in pixels.
    #[arg(long, global = true, env = "DRAWSCAN_MAX_PIXELS", default_value_t = 10_000)]
    max_pixels: u32,

    /// Per-page timeout in seconds.
    #[arg(long, global = true, env = "DRAWSCAN_UNIT_TIMEOUT", default_value_t = 300)]
    unit_timeout: u64,

    /// Aggregate every inference run instead of the newest one.
    #[arg(long, global = true, env = "DRAWSCAN_ALL_RUNS")]
    all_runs: bool,

    /// Credential for the CAD conversion service.
    #[arg(long, global = true, env = "CONVERT_API_SECRET", hide_env_values = true)]
    convert_api_secret: Option<String>,

    /// LLM provider for title-block extraction.
    #[arg(long, global = true, env = "DRAWSCAN_PROVIDER", default_value = "gemini")]
    provider: String,

    /// LLM model for title-block extraction.
    #[arg(long, global = true, env = "DRAWSCAN_LLM_MODEL", default_value = "gemini-2.5-flash")]
    llm_model: String,

    /// Skip title-block extraction.
    #[arg(long, global = true, env = "DRAWSCAN_NO_METADATA")]
    no_metadata: bool,

    /// Path to an existing libpdfium.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // With the progress bar active, INFO logs would tear through it.
    let show_progress = match &cli.command {
        Command::Run { no_progress, .. } => !cli.quiet && !no_progress,
        Command::Serve { .. } | Command::RenderPage { .. } => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    // A render worker's stderr is its error report; keep it clean.
    let env_filter = if matches!(cli.command, Command::RenderPage { .. }) {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn StageProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli.pipeline, progress)?;

    match cli.command {
        Command::Serve { addr } => {
            edgequake_drawscan::server::serve(&addr, DrawingService::new(config))
                .await
                .context("Server failed")?;
        }
        Command::Run { input, output, .. } => {
            run_once(DrawingService::new(config), &input, output.as_deref(), cli.quiet).await?;
        }
        Command::RenderPage {
            source,
            index,
            dest,
        } => render_page(&cli.pipeline, &source, index, &dest),
    }
    Ok(())
}

/// Worker process body: render one page and exit.
///
/// The first stderr line is the failure reason the parent reports for the
/// page; logging is off in this mode.
fn render_page(args: &PipelineArgs, source: &Path, index: usize, dest: &Path) -> ! {
    let settings = RenderSettings {
        scale: args.scale,
        max_pixels: args.max_pixels,
        pdfium_lib_path: args.pdfium_lib.clone(),
    };
    match render::render_page_file(source, index, dest, &settings) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1)
        }
    }
}

/// preprocess → load_model → inference → results, in-process.
async fn run_once(
    service: DrawingService,
    input: &Path,
    output: Option<&Path>,
    quiet: bool,
) -> Result<()> {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Input has no file name")?;
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    service.ensure_dirs().await?;
    service.upload(&name, &bytes).await?;

    let pages = service.preprocess().await.context("Preprocessing failed")?;
    service.load_model().await.context("Failed to load model")?;
    let inference = service.inference(None).await.context("Inference failed")?;
    let report = service.results().await.context("Aggregation failed")?;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
    match output {
        Some(path) => tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{json}"),
    }

    if !quiet {
        eprintln!(
            "{}  {} pages  {} detections  {} classes  {}",
            if pages.failed.is_empty() && inference.failed == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            report.summary.total_pages,
            report.summary.total_detections,
            report.summary.items_found,
            dim(&inference.run_dir.display().to_string()),
        );
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(args: &PipelineArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .upload_dir(&args.upload_dir)
        .output_dir(&args.output_dir)
        .model_path(&args.model)
        .max_workers(args.max_workers)
        .render_scale(args.scale)
        .max_rendered_pixels(args.max_pixels)
        .unit_timeout_secs(args.unit_timeout)
        .aggregate_scope(if args.all_runs {
            AggregateScope::All
        } else {
            AggregateScope::Latest
        });

    if let Some(ref secret) = args.convert_api_secret {
        builder = builder.convert_api_secret(secret);
    }
    if args.no_metadata {
        builder = builder.disable_extraction();
    } else {
        builder = builder
            .extractor_provider(&args.provider)
            .extractor_model(&args.llm_model);
    }
    if let Some(ref lib) = args.pdfium_lib {
        builder = builder.pdfium_lib_path(lib);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    match std::env::current_exe() {
        Ok(exe) => builder = builder.render_worker(exe, vec!["render-page".to_string()]),
        Err(e) => tracing::warn!("Rendering in-process, one page at a time: {}", e),
    }

    builder.build().context("Invalid configuration")
}

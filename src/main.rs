use anyhow::{anyhow, Context, Result};
use asciivid::artifacts::stale_job_dirs;
use asciivid::source::find_video_files;
use asciivid::{
    AppConfig, JobId, JobManager, JobParameters, JobRequest, JobSnapshot, JobStatus, OutputToggles, ProgressKind, Rgb,
    Style,
};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, FuzzySelect};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about = "Convert videos into ASCII-art text, image and video artifacts.")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one or more videos
    Convert(ConvertArgs),
    /// Remove job directories older than the retention period
    Cleanup {
        /// Age threshold; defaults to the configured retention
        #[arg(long)]
        older_than_hours: Option<u64>,

        /// Do not ask for confirmation
        #[arg(long, short, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input videos; prompts for one from the current directory when omitted
    inputs: Vec<PathBuf>,

    /// Output width in characters (10-240)
    #[arg(long)]
    width: Option<u32>,

    /// Glyph style: normal, inverted, dots, gradient
    #[arg(long)]
    style: Option<Style>,

    #[arg(long)]
    brightness: Option<f32>,

    #[arg(long)]
    contrast: Option<f32>,

    #[arg(long)]
    gamma: Option<f32>,

    /// New colors for every frame
    #[arg(long, default_value_t = false)]
    random_colors: bool,

    /// Transparent background in image frames
    #[arg(long, default_value_t = false)]
    transparent_bg: bool,

    /// Background color as #RRGGBB
    #[arg(long)]
    bg_color: Option<Rgb>,

    /// Text color as #RRGGBB
    #[arg(long)]
    text_color: Option<Rgb>,

    /// Frame rate of the assembled video (1-60)
    #[arg(long)]
    fps: Option<u32>,

    /// Encoder CRF (0-51, lower is better)
    #[arg(long)]
    quality: Option<u8>,

    /// Also save text frames
    #[arg(long, default_value_t = false)]
    txt: bool,

    /// Do not keep PNG frames
    #[arg(long, default_value_t = false)]
    no_png: bool,

    /// Do not assemble a video
    #[arg(long, default_value_t = false)]
    no_mp4: bool,
}

impl ConvertArgs {
    fn parameters(&self) -> JobParameters {
        let defaults = JobParameters::default();
        JobParameters {
            width: self.width.unwrap_or(defaults.width),
            style: self.style.unwrap_or(defaults.style),
            brightness: self.brightness.unwrap_or(defaults.brightness),
            contrast: self.contrast.unwrap_or(defaults.contrast),
            gamma: self.gamma.unwrap_or(defaults.gamma),
            random_colors: self.random_colors,
            transparent_bg: self.transparent_bg,
            bg_color: self.bg_color.unwrap_or(defaults.bg_color),
            text_color: self.text_color.unwrap_or(defaults.text_color),
            fps: self.fps.unwrap_or(defaults.fps),
            quality: self.quality.unwrap_or(defaults.quality),
            outputs: OutputToggles {
                save_txt: self.txt,
                save_png: !self.no_png,
                save_mp4: !self.no_mp4,
            },
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asciivid=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref())?;

    match cli.cmd {
        Command::Convert(args) => run_convert(cfg, args).await,
        Command::Cleanup { older_than_hours, yes } => {
            let older_than = older_than_hours.unwrap_or(cfg.retention_hours);
            run_cleanup(&cfg.results_dir, Duration::from_secs(older_than * 3600), yes)
        }
    }
}

fn pick_input() -> Result<PathBuf> {
    let files = find_video_files(Path::new("."));
    if files.is_empty() {
        return Err(anyhow!("No video files found in current directory."));
    }
    let names: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
    let selection = FuzzySelect::with_theme(&dialoguer::theme::ColorfulTheme::default())
        .with_prompt("Choose an input video")
        .default(0)
        .items(&names)
        .interact()?;
    Ok(files[selection].clone())
}

fn job_bar(multi: &MultiProgress, input: &Path) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:20!} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let name = input
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("input")
        .to_string();
    pb.set_prefix(name);
    pb.set_message("Queued");
    pb
}

async fn run_convert(cfg: AppConfig, args: ConvertArgs) -> Result<()> {
    let inputs = if args.inputs.is_empty() {
        vec![pick_input()?]
    } else {
        args.inputs.clone()
    };
    for input in &inputs {
        if !input.is_file() {
            return Err(anyhow!("Input {} does not exist", input.display()));
        }
    }

    let params = args.parameters();
    let manager = JobManager::with_ffmpeg(cfg).context("starting job manager")?;
    let _cleanup = manager.spawn_cleanup_task(Duration::from_secs(3600));
    let mut events = manager.subscribe();

    let multi = MultiProgress::new();
    let mut bars: HashMap<JobId, ProgressBar> = HashMap::new();
    let mut ids = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let id = manager
            .submit(JobRequest::new(input.clone(), params.clone()))
            .with_context(|| format!("submitting {}", input.display()))?;
        bars.insert(id, job_bar(&multi, input));
        ids.push(id);
    }

    let progress = tokio::spawn(async move {
        let mut remaining = bars.len();
        while remaining > 0 {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let Some(pb) = bars.get(&event.job_id) else {
                continue;
            };
            match event.kind {
                ProgressKind::Frame(frame) => {
                    if let Some(total) = frame.frames_total {
                        pb.set_length(total);
                    }
                    pb.set_position(frame.frames_done);
                    if let Some(eta) = frame.eta_seconds {
                        pb.set_message(format!("eta {:.0}s", eta));
                    }
                }
                ProgressKind::Status { status, message } => {
                    if status.is_terminal() {
                        pb.finish_with_message(message);
                        remaining -= 1;
                    } else {
                        pb.set_message(message);
                    }
                }
            }
        }
    });

    let mut results: Vec<JobSnapshot> = Vec::with_capacity(ids.len());
    for id in ids {
        results.push(manager.wait(id).await?);
    }
    // Terminal events may be lost to lag; the summary below does not depend on them.
    let _ = tokio::time::timeout(Duration::from_secs(1), progress).await;

    println!("{}", serde_json::to_string_pretty(&results).context("serializing job summary")?);

    let failed = results.iter().filter(|s| s.status != JobStatus::Completed).count();
    if failed > 0 {
        return Err(anyhow!("{} of {} jobs did not complete", failed, results.len()));
    }
    Ok(())
}

fn run_cleanup(results_dir: &Path, older_than: Duration, yes: bool) -> Result<()> {
    let stale = stale_job_dirs(results_dir, older_than);
    if stale.is_empty() {
        println!("Nothing to clean up in {}.", results_dir.display());
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Remove {} job directories from {}?",
                stale.len(),
                results_dir.display()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cleanup cancelled.");
            return Ok(());
        }
    }

    let mut removed = 0;
    for dir in &stale {
        match fs::remove_dir_all(dir) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Warning: failed to remove {}: {}", dir.display(), e),
        }
    }
    println!("Removed {} job directories.", removed);
    Ok(())
}

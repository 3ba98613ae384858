use anyhow::{bail, Context, Result};
use api::{HttpJobApi, JobApi};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use delivery::FileDelivery;
use queue::{Engine, Job, JobState, LoraPair, QueueEvent, Submission};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::{ApiConfig, Store};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "wanstudio-cli")]
#[command(about = "WanStudio - image-to-video generation queue client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new image-to-video generation job
    Submit {
        /// Source image file (png, jpeg, webp, gif)
        image: PathBuf,

        /// Prompt describing the motion/content
        #[arg(short, long)]
        prompt: String,

        /// Negative prompt
        #[arg(long)]
        negative_prompt: Option<String>,

        /// Target resolution as WIDTHxHEIGHT
        #[arg(long, default_value = "480x832")]
        resolution: String,

        /// Frame length
        #[arg(long, default_value_t = 81)]
        length: u32,

        /// Sampling steps
        #[arg(long, default_value_t = 10)]
        steps: u32,

        /// Seed
        #[arg(long, default_value_t = 42)]
        seed: i64,

        /// CFG scale
        #[arg(long, default_value_t = 2.0)]
        cfg: f32,

        /// LoRA pair as HIGH:LOW[:HIGH_WEIGHT[:LOW_WEIGHT]], up to 4
        #[arg(long = "lora")]
        lora: Vec<String>,

        /// Print the job id and exit instead of waiting
        #[arg(long)]
        detach: bool,

        /// Directory for downloaded videos
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the queue
    Queue,

    /// Resume interrupted jobs and render until the queue drains
    Watch {
        /// Directory for downloaded videos
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Cancel a processing job (or all of them)
    Cancel {
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Re-submit a failed job with its stored parameters
    Retry {
        id: String,

        /// Print the new job id and exit instead of waiting
        #[arg(long)]
        detach: bool,

        /// Directory for downloaded videos
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove finished jobs from the queue
    Clear,

    /// Print the stored parameters of a job
    Show { id: String },

    /// Check endpoint health
    Health,

    /// Configure the endpoint, credential, and theme
    Settings {
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        api_key: Option<String>,

        /// UI theme preference (light or dark)
        #[arg(long)]
        theme: Option<String>,

        /// Print the current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let store = Store::open();

    match cli.command {
        Commands::Submit {
            image,
            prompt,
            negative_prompt,
            resolution,
            length,
            steps,
            seed,
            cfg,
            lora,
            detach,
            output,
        } => {
            let (width, height) = parse_resolution(&resolution)?;
            let submission = Submission {
                prompt,
                negative_prompt,
                image: image_data_uri(&image)?,
                width,
                height,
                length,
                steps,
                seed,
                cfg,
                lora_pairs: lora
                    .iter()
                    .map(|spec| parse_lora_pair(spec))
                    .collect::<Result<_>>()?,
            };
            submit_command(store, submission, detach, output).await
        }
        Commands::Queue => queue_command(store),
        Commands::Watch { output } => watch_command(store, output).await,
        Commands::Cancel { id, all } => cancel_command(store, id, all).await,
        Commands::Retry { id, detach, output } => {
            retry_command(store, &id, detach, output).await
        }
        Commands::Clear => clear_command(store),
        Commands::Show { id } => show_command(store, &id),
        Commands::Health => health_command(store).await,
        Commands::Settings {
            endpoint,
            api_key,
            theme,
            show,
        } => settings_command(store, endpoint, api_key, theme, show),
    }
}

fn configured(store: &Store) -> Result<ApiConfig> {
    let config = store.load_api_config();
    if !config.is_configured() {
        bail!(
            "API not configured; run: wanstudio-cli settings --endpoint <url> --api-key <key>"
        );
    }
    Ok(config)
}

fn build_engine(store: Store, config: &ApiConfig, output: Option<PathBuf>) -> Engine {
    let output_dir = output
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    Engine::new(
        Arc::new(HttpJobApi::new(&config.endpoint, &config.api_key)),
        Arc::new(FileDelivery::new(output_dir)),
        store,
    )
}

async fn submit_command(
    store: Store,
    submission: Submission,
    detach: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = configured(&store)?;
    let engine = build_engine(store, &config, output);
    engine.resume();

    let job = engine.submit(submission).await?;
    println!("Generation started, job id {}", job.short_id());

    if detach {
        println!("Job continues on the server; run `wanstudio-cli watch` to pick it up.");
        return Ok(());
    }
    follow_job(&engine, &job.id).await
}

async fn retry_command(
    store: Store,
    job_id: &str,
    detach: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = configured(&store)?;
    let engine = build_engine(store, &config, output);
    engine.resume();

    let job = engine.retry(job_id).await?;
    println!("Retrying as job {}", job.short_id());

    if detach {
        return Ok(());
    }
    follow_job(&engine, &job.id).await
}

/// Render a single job's progress until it reaches a terminal state.
async fn follow_job(engine: &Engine, job_id: &str) -> Result<()> {
    let events = engine.events();
    loop {
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::JobUpdated(job) = event {
                if job.id == job_id {
                    render_job_line(&job);
                }
            }
        }

        match engine.job(job_id) {
            Some(job) if job.state.is_terminal() => {
                return match job.state {
                    JobState::Failed { ref error } => bail!("generation failed: {error}"),
                    _ => Ok(()),
                };
            }
            Some(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            None => bail!("job {job_id} disappeared from the queue"),
        }
    }
}

async fn watch_command(store: Store, output: Option<PathBuf>) -> Result<()> {
    let config = configured(&store)?;
    let api = HttpJobApi::new(&config.endpoint, &config.api_key);
    let engine = build_engine(store, &config, output);
    engine.resume();

    let stats = engine.stats();
    if stats.processing == 0 {
        println!("No active jobs to watch.");
        return Ok(());
    }
    println!("Watching {} active job(s)...", stats.processing);

    let events = engine.events();
    let mut ticks: u32 = 0;
    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                QueueEvent::JobUpdated(job) => render_job_line(&job),
                QueueEvent::QueueCleared { removed } => {
                    info!("{removed} jobs removed from the queue");
                }
            }
        }

        if engine.stats().processing == 0 {
            break;
        }

        // Periodic endpoint health line.
        if ticks % 30 == 0 {
            match api.health().await {
                Ok(report) if report.is_healthy() => info!(
                    "endpoint healthy: {} ready / {} busy",
                    report.workers.ready, report.workers.running
                ),
                Ok(_) => warn!("endpoint reports no ready workers"),
                Err(e) => warn!("health check failed: {e}"),
            }
        }
        ticks += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let stats = engine.stats();
    println!(
        "Queue drained: {} completed, {} failed.",
        stats.completed, stats.failed
    );
    Ok(())
}

fn queue_command(store: Store) -> Result<()> {
    let jobs = store.load_queue();
    if jobs.is_empty() {
        println!("No generations yet.");
        return Ok(());
    }

    let (mut processing, mut completed, mut failed) = (0, 0, 0);
    for job in &jobs {
        match job.state {
            JobState::Processing { .. } => processing += 1,
            JobState::Completed => completed += 1,
            JobState::Failed { .. } => failed += 1,
        }
    }
    println!("Queue: {processing} processing | {completed} completed | {failed} failed");

    // Newest first.
    for job in jobs.iter().rev() {
        render_queue_row(job);
    }
    Ok(())
}

async fn cancel_command(store: Store, id: Option<String>, all: bool) -> Result<()> {
    let config = configured(&store)?;
    let engine = build_engine(store, &config, None);

    if all {
        let cancelled = engine.cancel_all().await;
        println!("Cancelled {cancelled} job(s).");
        return Ok(());
    }

    let id = id.context("pass a job id or --all")?;
    engine.cancel(&id, false).await?;
    println!("Job {id} cancelled.");
    Ok(())
}

fn clear_command(store: Store) -> Result<()> {
    let config = store.load_api_config();
    let engine = build_engine(store, &config, None);
    let removed = engine.clear_finished();
    if removed == 0 {
        println!("No finished jobs to clear.");
    } else {
        println!("Cleared {removed} finished job(s).");
    }
    Ok(())
}

fn show_command(store: Store, job_id: &str) -> Result<()> {
    let jobs = store.load_queue();
    let job = jobs
        .iter()
        .find(|j| j.id == job_id || j.short_id() == job_id)
        .with_context(|| format!("job {job_id} not found"))?;
    let submission = job
        .submission
        .as_ref()
        .context("job has no stored parameters")?;
    println!("{}", serde_json::to_string_pretty(submission)?);
    Ok(())
}

async fn health_command(store: Store) -> Result<()> {
    let config = configured(&store)?;
    let api = HttpJobApi::new(&config.endpoint, &config.api_key);
    match api.health().await {
        Ok(report) if report.is_healthy() => {
            println!(
                "{} ready | {} busy",
                report.workers.ready, report.workers.running
            );
        }
        Ok(report) => {
            println!(
                "Endpoint reachable but not ready (status: {})",
                report.status.as_deref().unwrap_or("unknown")
            );
        }
        Err(e) => bail!("endpoint offline: {e}"),
    }
    Ok(())
}

fn settings_command(
    store: Store,
    endpoint: Option<String>,
    api_key: Option<String>,
    theme: Option<String>,
    show: bool,
) -> Result<()> {
    let mut config = store.load_api_config();
    let mut changed = false;

    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
        changed = true;
    }
    if let Some(api_key) = api_key {
        config.api_key = api_key;
        changed = true;
    }
    if changed {
        store.save_api_config(&config)?;
        println!("Settings saved.");
    }

    if let Some(theme) = theme {
        if theme != "light" && theme != "dark" {
            bail!("theme must be light or dark");
        }
        store.save_theme(&theme)?;
        println!("Theme set to {theme}.");
    }

    if show || !changed {
        println!("endpoint: {}", display_or(&config.endpoint, "<unset>"));
        println!("api key:  {}", mask(&config.api_key));
        println!(
            "theme:    {}",
            store.load_theme().unwrap_or_else(|| "light".into())
        );
    }
    Ok(())
}

fn render_job_line(job: &Job) {
    let now = now_ms();
    match &job.state {
        JobState::Processing { progress } => {
            println!("  [{}] processing {progress:>5.1}%", job.short_id())
        }
        JobState::Completed => println!(
            "  [{}] completed in {}",
            job.short_id(),
            format_duration(job.duration_ms(now))
        ),
        JobState::Failed { error } => {
            println!("  [{}] failed: {error}", job.short_id())
        }
    }
}

fn render_queue_row(job: &Job) {
    let now = now_ms();
    let prompt = job
        .submission
        .as_ref()
        .map(|s| truncate(&s.prompt, 40))
        .unwrap_or_default();
    match &job.state {
        JobState::Processing { progress } => println!(
            "  [{}] processing {progress:>5.1}%  {}  {prompt}",
            job.short_id(),
            format_duration(job.duration_ms(now)),
        ),
        JobState::Completed => println!(
            "  [{}] completed  {}  {prompt}",
            job.short_id(),
            format_duration(job.duration_ms(now)),
        ),
        JobState::Failed { error } => println!(
            "  [{}] failed     {}  {prompt}  ({error})",
            job.short_id(),
            format_duration(job.duration_ms(now)),
        ),
    }
}

fn image_data_uri(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("cannot read image {}", path.display()))?;
    let subtype = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "png",
        Some("jpg") | Some("jpeg") => "jpeg",
        Some("webp") => "webp",
        Some("gif") => "gif",
        other => bail!("unsupported image format: {}", other.unwrap_or("none")),
    };
    Ok(format!(
        "data:image/{subtype};base64,{}",
        STANDARD.encode(bytes)
    ))
}

fn parse_resolution(spec: &str) -> Result<(u32, u32)> {
    let (w, h) = spec
        .split_once(['x', 'X'])
        .with_context(|| format!("resolution must be WIDTHxHEIGHT, got {spec:?}"))?;
    Ok((
        w.trim().parse().context("bad width")?,
        h.trim().parse().context("bad height")?,
    ))
}

fn parse_lora_pair(spec: &str) -> Result<LoraPair> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 || parts.len() > 4 {
        bail!("LoRA pair must be HIGH:LOW[:HIGH_WEIGHT[:LOW_WEIGHT]], got {spec:?}");
    }
    let weight = |i: usize| -> Result<f32> {
        match parts.get(i) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("bad LoRA weight {raw:?}")),
            None => Ok(1.0),
        }
    };
    Ok(LoraPair {
        high: parts[0].to_string(),
        low: parts[1].to_string(),
        high_weight: weight(2)?,
        low_weight: weight(3)?,
    })
}

fn format_duration(ms: i64) -> String {
    if ms <= 0 {
        return "0s".into();
    }
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{hours}h {}m {}s", minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn mask(key: &str) -> String {
    if key.is_empty() {
        return "<unset>".into();
    }
    let visible: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{visible}")
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

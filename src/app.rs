use crate::cli::{Cli, Commands, RunArgs};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use vidproc::config::{self, Config};
use vidproc::engine::{self, BatchSnapshot, Controller, FfmpegEncoder, JobId, JobStatus, Phase};

pub fn run(cli: Cli) {
    let command = cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default()));
    let result = match command {
        Commands::Run(args) => handle_run(args),
        Commands::Scan {
            directory,
            extensions,
            follow_links,
        } => handle_scan(&directory, extensions, follow_links),
        Commands::Probe { file } => handle_probe(&file),
        Commands::CheckFfmpeg => handle_check_ffmpeg(),
        Commands::InitConfig => handle_init_config(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Layer command line flags over the loaded configuration
fn apply_overrides(config: &mut Config, args: &RunArgs) {
    let batch = &mut config.batch;
    if let Some(input) = &args.input {
        batch.input_dir = input.clone();
    }
    if let Some(output) = &args.output {
        batch.output_dir = output.clone();
    }
    if let Some(workers) = args.workers {
        batch.workers = workers;
    }
    if !args.extensions.is_empty() {
        batch.extensions = config::normalize_extensions(&args.extensions);
    }
    if let Some(policy) = args.collision {
        batch.collision_policy = policy.into();
    }
    batch.dry_run |= args.dry_run;
    batch.follow_links |= args.follow_links;
    if args.cancel_grace.is_some() {
        batch.cancel_grace_secs = args.cancel_grace;
    }

    let encode = &mut config.encode;
    if let Some(codec) = &args.codec {
        encode.video_codec = codec.clone();
    }
    if let Some(crf) = args.crf {
        encode.crf = crf;
    }
    if let Some(preset) = &args.preset {
        encode.preset = preset.clone();
    }
    if let Some(codec) = &args.audio_codec {
        encode.audio_codec = codec.clone();
    }
    if let Some(kbps) = args.audio_bitrate {
        encode.audio_bitrate_kbps = kbps;
    }
    if args.keep_fps {
        encode.target_fps = None;
    } else if args.fps.is_some() {
        encode.target_fps = args.fps;
    }
    encode.copy_audio |= args.copy_audio;
    encode.skip_reencode |= args.skip_reencode;
    if let Some(extra) = &args.extra_args {
        encode.extra_args = extra.clone();
    }

    if let Some(gpu) = args.gpu {
        config.hardware.gpu_type = gpu.into();
    }
    if args.no_gpu {
        config.hardware.use_gpu = false;
    }

    config.log.enable_json |= args.json_log;
    if args.no_csv {
        config.log.enable_csv = false;
    }
    config.normalize();
}

/// Console progress: one line per finished job plus batch percent in 5% steps
#[derive(Default)]
struct ProgressPrinter {
    reported: HashSet<JobId>,
    last_step: Option<u32>,
    phase: Phase,
}

impl ProgressPrinter {
    fn update(&mut self, snapshot: &BatchSnapshot) {
        if snapshot.phase != self.phase {
            self.phase = snapshot.phase;
            println!("[{}]", snapshot.phase);
        }

        for job in snapshot.jobs.iter().filter(|j| j.is_terminal()) {
            if !self.reported.insert(job.id) {
                continue;
            }
            let name = job.relative_path.display();
            match job.status() {
                JobStatus::Completed => {
                    let saved = job.metrics().map(|m| m.compression_ratio_pct()).unwrap_or(0.0);
                    println!("  done     {} ({:.1}% smaller)", name, saved);
                }
                JobStatus::Failed => {
                    let message = job.error().map(|e| e.message.as_str()).unwrap_or("");
                    println!("  failed   {}: {}", name, message);
                }
                JobStatus::Skipped => match &job.state {
                    engine::JobState::Skipped { reason } => {
                        println!("  skipped  {} ({}) -> {}", name, reason, job.output_path.display())
                    }
                    _ => println!("  skipped  {}", name),
                },
                JobStatus::Cancelled => println!("  cancelled {}", name),
                JobStatus::Queued | JobStatus::Running => {}
            }
        }

        let step = (snapshot.percent / 5.0).floor() as u32;
        if snapshot.total_jobs() > 0 && self.last_step.is_none_or(|last| step > last) {
            self.last_step = Some(step);
            let eta = snapshot
                .eta_secs
                .map(|s| format!(", eta {}", format_duration(s)))
                .unwrap_or_default();
            println!(
                "{:>3}% ({}/{} jobs done, elapsed {}{})",
                step * 5,
                snapshot.counts.total() - snapshot.counts.outstanding(),
                snapshot.total_jobs(),
                format_duration(snapshot.elapsed_secs),
                eta
            );
        }
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

fn format_size(bytes: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else {
        format!("{:.2} MB", b / MB)
    }
}

/// Follow subscription updates until the batch completes, cancelling on Ctrl-C
fn follow(
    controller: &Controller,
    printer: &mut ProgressPrinter,
    interrupts: &AtomicUsize,
) -> Result<Arc<BatchSnapshot>> {
    let updates = controller.subscribe();
    let mut cancel_sent = false;

    loop {
        match updates.recv_timeout(Duration::from_millis(200)) {
            Ok(snapshot) => {
                printer.update(&snapshot);
                if snapshot.phase == Phase::Completed {
                    return Ok(snapshot);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(controller.snapshot()),
        }

        if !cancel_sent && interrupts.load(Ordering::SeqCst) > 0 {
            cancel_sent = true;
            eprintln!("Cancelling... press Ctrl-C again to quit immediately");
            if let Err(e) = controller.cancel() {
                tracing::warn!(error = %e, "cancel not applied");
            }
        }
    }
}

fn print_summary(snapshot: &BatchSnapshot) {
    let counts = &snapshot.counts;
    let (input, output, saved) = snapshot
        .jobs
        .iter()
        .filter_map(|j| j.metrics())
        .fold((0, 0, 0), |(i, o, s), m| {
            (
                i + m.original_bytes.unwrap_or(0),
                o + m.output_bytes.unwrap_or(0),
                s + m.saved_bytes(),
            )
        });

    println!();
    println!("Jobs:      {}", snapshot.total_jobs());
    println!("Completed: {}", counts.completed);
    println!("Failed:    {}", counts.failed);
    println!("Skipped:   {}", counts.skipped);
    println!("Cancelled: {}", counts.cancelled);
    if input > 0 {
        println!(
            "Size:      {} -> {} (saved {}, {:.1}%)",
            format_size(input),
            format_size(output),
            format_size(saved),
            saved as f64 / input as f64 * 100.0
        );
    }
    println!("Elapsed:   {}", format_duration(snapshot.elapsed_secs));
    for warning in &snapshot.warnings {
        println!("Warning:   {}", warning);
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if args.save_config {
        match &args.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
    }

    let interrupts = Arc::new(AtomicUsize::new(0));
    let handler_count = interrupts.clone();
    ctrlc::set_handler(move || {
        if handler_count.fetch_add(1, Ordering::SeqCst) > 0 {
            eprintln!("Interrupted");
            process::exit(130);
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    println!(
        "Transcoding {} -> {}{}",
        config.batch.input_dir.display(),
        config.batch.output_dir.display(),
        if config.batch.dry_run { " (dry run)" } else { "" }
    );

    let mut controller = Controller::new(config, Arc::new(FfmpegEncoder::new()));
    let mut printer = ProgressPrinter::default();
    controller.start()?;
    let mut snapshot = follow(&controller, &mut printer, &interrupts)?;

    if args.retry_failed && snapshot.counts.failed > 0 && interrupts.load(Ordering::SeqCst) == 0 {
        let count = controller.retry_failed()?;
        println!("Retrying {} failed job(s)", count);
        printer.last_step = None;
        snapshot = follow(&controller, &mut printer, &interrupts)?;
    }

    print_summary(&snapshot);
    Ok(())
}

fn handle_scan(directory: &Path, extensions: Vec<String>, follow_links: bool) -> Result<()> {
    let extensions = if extensions.is_empty() {
        Config::load().unwrap_or_default().batch.extensions
    } else {
        extensions
    };
    println!("Scanning directory: {}", directory.display());

    let scanner = engine::Scanner::new(directory, &extensions).follow_links(follow_links);
    let (entries, warnings) = scanner.collect();
    let total: u64 = entries.iter().filter_map(|e| e.size_bytes).sum();
    for entry in &entries {
        println!(
            "  {} ({})",
            entry.relative_path.display(),
            entry.size_bytes.map(format_size).unwrap_or_else(|| "?".into())
        );
    }
    for warning in &warnings {
        println!("  warning: {}", warning);
    }
    println!("\n{} file(s), {}", entries.len(), format_size(total));
    Ok(())
}

fn handle_probe(file: &Path) -> Result<()> {
    let info = engine::probe_media(file)
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    let show = |v: Option<String>| v.unwrap_or_else(|| "-".into());

    match info.duration_s {
        Some(d) => println!("Duration:      {:.2} seconds", d),
        None => println!("Duration:      unknown"),
    }
    println!("Resolution:    {}", show(info.resolution()));
    println!("Video codec:   {}", show(info.video_codec.clone()));
    println!("Audio codec:   {}", show(info.audio_codec.clone()));
    println!(
        "Video bitrate: {}",
        show(info.video_bitrate_kbps.map(|b| format!("{} kbps", b)))
    );
    println!(
        "Audio bitrate: {}",
        show(info.audio_bitrate_kbps.map(|b| format!("{} kbps", b)))
    );
    println!("Frame rate:    {}", show(info.fps.map(|f| format!("{:.2} fps", f))));
    Ok(())
}

fn handle_check_ffmpeg() -> Result<()> {
    let (ffmpeg, ffprobe) = engine::check_ffmpeg()?;
    println!("ffmpeg found: {}", ffmpeg);
    println!("ffprobe found: {}", ffprobe);
    Ok(())
}

fn handle_init_config() -> Result<()> {
    let path: PathBuf = Config::config_path()?;
    if Config::exists() {
        println!("Config file exists at: {}", path.display());
    } else {
        Config::ensure_default()?;
        println!("Created default config at: {}", path.display());
    }
    Ok(())
}

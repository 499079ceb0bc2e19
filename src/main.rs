use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use badge_processor::acquisition::{
    AcquisitionCoordinator, HttpFetcher, ImageFetcher, LocalInventory, OfflineFetcher,
};
use badge_processor::badge::cascade::CascadeDetector;
use badge_processor::badge::face_detection::{FaceLocator, NoFaceLocator};
use badge_processor::badge::{BadgeStatus, Compositor};
use badge_processor::batch::{roster_from_inventory, BatchOrchestrator, BatchReport, ProgressEvent};
use badge_processor::cli::Args;
use badge_processor::config_file::Settings;
use badge_processor::json_output::JsonMessage;
use badge_processor::report;
use badge_processor::roster::{self, RosterEntry};
use badge_processor::utils::{
    create_progress_bar, error_println, format_duration, validate_settings, verbose_println,
    warn_println,
};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("badge_processor={}", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Handle --decode-filename: print the decoded fields and exit
fn handle_decode_filename(filename: &str, args: &Args) -> Result<()> {
    println!(
        "{}",
        style(format!("Decoding filename: {}", filename)).bold().cyan()
    );
    println!();

    let entry = roster::decode(filename).with_context(|| format!("Cannot decode '{}'", filename))?;
    let key = entry.fetch_key()?;

    println!("  Name:        {}", style(&entry.display_name).bold().green());
    println!("  Employee ID: {}", style(&entry.employee_id).bold().green());
    if let Some(prefix) = entry.id_prefix {
        println!("  ID prefix:   {}", style(prefix).yellow());
    }
    println!("  Role code:   {}", style(&entry.role_code).bold().green());
    println!("  Sequence:    {}", entry.sequence);
    println!("  Fetch key:   {}", style(key).bold());

    // The remote URL needs the configured base URL, if there is one
    if let Ok(settings) = args.resolve_settings() {
        println!(
            "  Role title:  {}",
            settings.badge.role_title(&entry.role_code)
        );
        if let Some(base_url) = &settings.base_url {
            let fetcher = HttpFetcher::new(base_url, settings.source_format)?;
            println!("  Remote URL:  {}", style(fetcher.url(key)).dim());
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(filename) = &args.decode_filename {
        return handle_decode_filename(filename, &args);
    }

    let settings = args.resolve_settings()?;
    validate_settings(&settings)?;

    if !args.json_progress {
        println!("{}", style("Badge Processor").bold().blue());
        println!("{}", style("Portrait acquisition and badge composition").dim());
        println!();
        print_configuration(&args, &settings);
    }

    let roster = load_roster(&args, &settings)?;
    if roster.is_empty() {
        if args.json_progress {
            JsonMessage::badge_failed("", "roster is empty");
        } else {
            error_println("Roster is empty, nothing to do");
        }
        return Ok(());
    }

    let start = Instant::now();
    let report = match &settings.base_url {
        Some(base_url) => {
            let fetcher = HttpFetcher::new(base_url, settings.source_format)?;
            run_batch(&args, &settings, &roster, fetcher)?
        }
        None => {
            if !args.json_progress {
                warn_println("No remote image server configured; missing portraits will fail");
            }
            run_batch(&args, &settings, &roster, OfflineFetcher)?
        }
    };
    let elapsed = start.elapsed();

    if let Some(path) = &args.report_json {
        report::write_json_report(&report, path)?;
        verbose_println(
            args.verbose && !args.json_progress,
            &format!("Report written to {}", path.display()),
        );
    }

    if args.json_progress {
        JsonMessage::Summary {
            total: report.results.len(),
            succeeded: report.count(BadgeStatus::Success),
            no_face: report.count(BadgeStatus::NoFaceFallback),
            failed: report.count(BadgeStatus::Failed),
            downloaded: report.acquisition.downloaded,
            duration_secs: elapsed.as_secs_f64(),
        }
        .emit();
        return Ok(());
    }

    if args.report {
        report::print_report(&report);
    }
    print_summary(&report, elapsed);

    Ok(())
}

fn print_configuration(args: &Args, settings: &Settings) {
    println!("{}", style("Configuration:").bold());
    println!("  Source:     {}", settings.source_dir.display());
    println!("  Output:     {}", settings.output_dir.display());
    println!("  Template:   {}", settings.badge.template_path.display());
    match &settings.base_url {
        Some(url) => println!(
            "  Remote:     {} ({} workers, {}s timeout)",
            url,
            settings.workers,
            settings.timeout.as_secs()
        ),
        None => println!("  Remote:     {}", style("disabled").dim()),
    }
    match &settings.cascade {
        Some(cascade) => println!("  Detector:   {}", cascade.display()),
        None => println!("  Detector:   {}", style("none (whole photo)").dim()),
    }
    verbose_println(
        args.verbose,
        &format!(
            "Formats: source .{}, badges .{}, prefix '{}'",
            settings.source_format.extension(),
            settings.output_format.extension(),
            settings.output_prefix
        ),
    );
    println!();
}

fn load_roster(args: &Args, settings: &Settings) -> Result<Vec<RosterEntry>> {
    match &args.roster {
        Some(path) => roster::load_roster(path),
        None => Ok(roster_from_inventory(&LocalInventory::new(&settings.source_dir))),
    }
}

fn build_locator(settings: &Settings) -> Result<Arc<dyn FaceLocator>> {
    Ok(match &settings.cascade {
        Some(path) => Arc::new(CascadeDetector::from_file(path, settings.detector)?),
        None => Arc::new(NoFaceLocator),
    })
}

fn run_batch<F: ImageFetcher>(
    args: &Args,
    settings: &Settings,
    roster: &[RosterEntry],
    fetcher: F,
) -> Result<BatchReport> {
    let inventory = LocalInventory::new(&settings.source_dir);
    if settings.base_url.is_some() {
        inventory.ensure_root()?;
    }

    let coordinator = AcquisitionCoordinator::new(inventory, fetcher)
        .with_workers(settings.workers)
        .with_timeout(settings.timeout);
    let compositor = Compositor::new(build_locator(settings)?, &settings.output_dir)
        .with_output_format(settings.output_format)
        .with_prefix(settings.output_prefix.clone());

    let orchestrator = BatchOrchestrator::new(coordinator, compositor, settings.source_format);

    if args.json_progress {
        let orchestrator = orchestrator.with_progress(Box::new(|event: ProgressEvent<'_>| {
            emit_json_progress(event)
        }));
        return Ok(orchestrator.run(roster, &settings.badge));
    }

    let pb = create_progress_bar(roster.len() as u64);
    pb.enable_steady_tick(Duration::from_millis(120));
    let bar = pb.clone();
    let verbose = args.verbose;
    let orchestrator = orchestrator.with_progress(Box::new(move |event: ProgressEvent<'_>| {
        match event {
            ProgressEvent::Download { completed, total, filename, error } => {
                bar.set_length(total as u64);
                bar.set_position(completed as u64);
                bar.set_message(format!("downloading {}", filename));
                if let (true, Some(error)) = (verbose, error) {
                    bar.println(format!("  {} {}: {}", style("✗").red(), filename, error));
                }
            }
            ProgressEvent::Compose { completed, total, result } => {
                bar.set_length(total as u64);
                bar.set_position(completed as u64);
                bar.set_message(format!("composing {}", result.roster_entry.display_name));
            }
        }
    }));

    let report = orchestrator.run(roster, &settings.badge);
    pb.finish_with_message("done");
    Ok(report)
}

fn emit_json_progress(event: ProgressEvent<'_>) {
    match event {
        ProgressEvent::Download { completed, total, filename, error } => {
            if let Some(error) = error {
                JsonMessage::download_failed(filename, error.reason_code());
            }
            JsonMessage::progress("download", completed, total, filename);
        }
        ProgressEvent::Compose { completed, total, result } => {
            let name = result.roster_entry.display_name.as_str();
            match &result.output_path {
                Some(path) => JsonMessage::badge_completed(name, path, result.status.as_str()),
                None => JsonMessage::badge_failed(
                    name,
                    result.error_reason.clone().unwrap_or_default(),
                ),
            }
            JsonMessage::progress("compose", completed, total, name);
        }
    }
}

fn print_summary(report: &BatchReport, elapsed: Duration) {
    let stats = &report.acquisition;
    let succeeded = report.count(BadgeStatus::Success);
    let fallback = report.count(BadgeStatus::NoFaceFallback);
    let failed = report.count(BadgeStatus::Failed);

    println!();
    println!("{}", style("Results Summary:").bold().green());
    println!(
        "  Portraits: {} local, {} downloaded, {} unavailable",
        stats.already_available,
        style(stats.downloaded).bold().cyan(),
        style(stats.failed).bold().red()
    );
    println!("  Badges:    {}", style(succeeded).bold().green());
    if fallback > 0 {
        println!(
            "  No face:   {} (whole photo used)",
            style(fallback).bold().yellow()
        );
    }
    if failed > 0 {
        println!("  Failed:    {}", style(failed).bold().red());
        for result in report.failed() {
            println!(
                "    {} {}: {}",
                style("✗").red(),
                result.roster_entry.display_name,
                result.error_reason.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("  Time:      {}", format_duration(elapsed));
}

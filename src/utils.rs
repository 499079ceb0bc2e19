use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::badge::{annotate, BadgeSpec};
use crate::config_file::Settings;

/// Create a styled progress bar
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.blue} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg} ({eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Format duration in a human-readable way
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs >= 60 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{}m {}s", mins, secs)
    } else if total_secs > 0 {
        format!("{}.{:03}s", total_secs, millis)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Checks that must pass before any badge is attempted
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.workers == 0 || settings.workers > 64 {
        anyhow::bail!("Worker count must be between 1 and 64, got {}", settings.workers);
    }
    if settings.timeout.is_zero() {
        anyhow::bail!("Download timeout must be greater than 0");
    }
    if let Some(url) = &settings.base_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("Base URL must start with http:// or https://, got '{}'", url);
        }
    }
    if settings.source_dir.exists() && !settings.source_dir.is_dir() {
        anyhow::bail!(
            "Source path is not a directory: {}",
            settings.source_dir.display()
        );
    }
    if let Some(cascade) = &settings.cascade {
        if !cascade.is_file() {
            anyhow::bail!("Cascade file does not exist: {}", cascade.display());
        }
    }
    if !(settings.detector.scale_factor > 1.0) {
        anyhow::bail!(
            "Detector scale factor must be greater than 1.0, got {}",
            settings.detector.scale_factor
        );
    }

    validate_badge_spec(&settings.badge)
}

/// Template must decode, font must load when text is drawn
pub fn validate_badge_spec(spec: &BadgeSpec) -> Result<()> {
    spec.validate()?;

    if !spec.template_path.is_file() {
        anyhow::bail!("Template does not exist: {}", spec.template_path.display());
    }
    let (width, height) = image::image_dimensions(&spec.template_path)
        .with_context(|| format!("Failed to read template: {}", spec.template_path.display()))?;

    let slot = spec.portrait_slot()?;
    if slot.x >= width as i64 || slot.y >= height as i64 || slot.x < 0 || slot.y < 0 {
        anyhow::bail!(
            "Portrait slot at ({}, {}) lies outside the {}x{} template",
            slot.x,
            slot.y,
            width,
            height
        );
    }

    if spec.text_fields().next().is_some() {
        if let Some(font) = &spec.font_path {
            annotate::load_font(font)?;
        }
    }

    Ok(())
}

/// Generate a safe filename by replacing characters that are invalid on
/// common filesystems
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Print verbose information if verbose mode is enabled
pub fn verbose_println(verbose: bool, message: &str) {
    if verbose {
        println!("{} {}", style("[VERBOSE]").dim(), message);
    }
}

/// Print warning message
pub fn warn_println(message: &str) {
    println!("{} {}", style("[WARNING]").yellow().bold(), message);
}

/// Print error message
pub fn error_println(message: &str) {
    eprintln!("{} {}", style("[ERROR]").red().bold(), message);
}

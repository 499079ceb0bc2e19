use anyhow::{Context, Result};
use prettytable::{format, Cell, Row, Table};
use std::path::Path;

use crate::badge::{BadgeResult, BadgeStatus};
use crate::batch::BatchReport;

/// Table with one row per badge result
pub fn build_results_table(report: &BatchReport) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);

    table.add_row(Row::new(vec![
        Cell::new("Name"),
        Cell::new("ID"),
        Cell::new("Role"),
        Cell::new("Seq"),
        Cell::new("Status"),
        Cell::new("Output / Reason"),
    ]));

    for result in &report.results {
        add_result_row(&mut table, result);
    }

    table
}

fn add_result_row(table: &mut Table, result: &BadgeResult) {
    let entry = &result.roster_entry;
    let (status, detail) = match result.status {
        BadgeStatus::Success => ("✓ success", output_name(result)),
        BadgeStatus::NoFaceFallback => ("~ no face", output_name(result)),
        BadgeStatus::Failed => (
            "✗ failed",
            result.error_reason.clone().unwrap_or_default(),
        ),
    };

    table.add_row(Row::new(vec![
        Cell::new(&truncate(&entry.display_name, 25)),
        Cell::new(&entry.display_id()),
        Cell::new(&entry.role_code),
        Cell::new(&entry.sequence.to_string()),
        Cell::new(status),
        Cell::new(&truncate(&detail, 60)),
    ]));
}

fn output_name(result: &BadgeResult) -> String {
    result
        .output_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Print the results table and acquisition counters
pub fn print_report(report: &BatchReport) {
    let stats = &report.acquisition;
    println!(
        "\n📥 ACQUISITION: {} required, {} local, {} missing, {} downloaded, {} failed\n",
        stats.total, stats.already_available, stats.missing, stats.downloaded, stats.failed
    );

    if !stats.failures.is_empty() {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(Row::new(vec![Cell::new("Source file"), Cell::new("Reason")]));
        for (filename, failure) in &stats.failures {
            table.add_row(Row::new(vec![
                Cell::new(filename),
                Cell::new(&format!("{} ({})", failure.reason_code(), truncate(&failure.to_string(), 50))),
            ]));
        }
        table.printstd();
        println!();
    }

    println!("🪪 BADGES ({} total)\n", report.results.len());
    build_results_table(report).printstd();
    println!();
}

/// Write the batch report as pretty JSON
pub fn write_json_report(report: &BatchReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

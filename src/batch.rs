use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::acquisition::{AcquisitionCoordinator, AcquisitionStats, FetchError, ImageFetcher, LocalInventory};
use crate::badge::{BadgeResult, BadgeSpec, BadgeStatus, Compositor};
use crate::roster::{self, ImageFormat, RosterEntry};

/// Progress notifications emitted while a batch runs
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// One download task finished
    Download {
        completed: usize,
        total: usize,
        filename: &'a str,
        error: Option<&'a FetchError>,
    },
    /// One roster entry was composed (or failed)
    Compose {
        completed: usize,
        total: usize,
        result: &'a BadgeResult,
    },
}

pub type ProgressCallback = Box<dyn Fn(ProgressEvent<'_>) + Send + Sync>;

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub acquisition: AcquisitionStats,
    /// One per roster entry, in roster order
    pub results: Vec<BadgeResult>,
    pub elapsed_secs: f64,
}

impl BatchReport {
    pub fn count(&self, status: BadgeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &BadgeResult> {
        self.results.iter().filter(|r| r.is_failed())
    }
}

/// Runs acquisition and then composition for a whole roster
pub struct BatchOrchestrator<F: ImageFetcher> {
    coordinator: AcquisitionCoordinator<F>,
    compositor: Compositor,
    source_format: ImageFormat,
    progress: Option<ProgressCallback>,
}

impl<F: ImageFetcher> BatchOrchestrator<F> {
    pub fn new(coordinator: AcquisitionCoordinator<F>, compositor: Compositor, source_format: ImageFormat) -> Self {
        Self {
            coordinator,
            compositor,
            source_format,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn coordinator(&self) -> &AcquisitionCoordinator<F> {
        &self.coordinator
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    fn emit(&self, event: ProgressEvent<'_>) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }

    pub fn run(&self, roster: &[RosterEntry], spec: &BadgeSpec) -> BatchReport {
        let started = Instant::now();
        let inventory = self.coordinator.inventory();

        let required: BTreeSet<String> = roster
            .iter()
            .map(|entry| entry.source_filename(self.source_format))
            .collect();

        info!(entries = roster.len(), unique_sources = required.len(), "starting batch");

        let acquisition = self.coordinator.reconcile_with_progress(&required, &|p| {
            self.emit(ProgressEvent::Download {
                completed: p.completed,
                total: p.total,
                filename: p.filename,
                error: p.error,
            })
        });

        let composed = AtomicUsize::new(0);
        let results: Vec<BadgeResult> = roster
            .iter()
            .map(|entry| {
                let filename = entry.source_filename(self.source_format);
                let result = if inventory.exists(&filename) {
                    self.compositor.compose(&inventory.path_for(&filename), entry, spec)
                } else {
                    let reason = match acquisition.failures.get(&filename) {
                        Some(failure) => format!("image unavailable: {}", failure),
                        None => "image unavailable".to_string(),
                    };
                    warn!(filename = filename.as_str(), "{}", reason);
                    BadgeResult::failed(entry, reason)
                };

                self.emit(ProgressEvent::Compose {
                    completed: composed.fetch_add(1, Ordering::Relaxed) + 1,
                    total: roster.len(),
                    result: &result,
                });
                result
            })
            .collect();

        let report = BatchReport {
            acquisition,
            results,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            success = report.count(BadgeStatus::Success),
            no_face = report.count(BadgeStatus::NoFaceFallback),
            failed = report.count(BadgeStatus::Failed),
            "batch finished"
        );

        report
    }
}

/// Roster built from the canonical filenames already in the inventory
///
/// Each entry remembers the file it was decoded from, whatever its
/// extension or padding. Names that do not decode are logged and skipped.
pub fn roster_from_inventory(inventory: &LocalInventory) -> Vec<RosterEntry> {
    inventory
        .list()
        .into_iter()
        .filter_map(|asset| {
            let filename = asset.filename();
            match roster::decode(&filename) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(filename = filename.as_str(), "skipping source image: {}", e);
                    None
                }
            }
        })
        .collect()
}

//! JSON output for GUI integration
//!
//! When --json-progress is enabled, progress and results are emitted as JSON
//! lines on stdout and the console output is suppressed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last progress emission timestamp (milliseconds since epoch)
static LAST_PROGRESS_MS: AtomicU64 = AtomicU64::new(0);

/// Minimum gap between two progress lines
const PROGRESS_INTERVAL_MS: u64 = 40;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonMessage {
    Progress {
        phase: String,
        current: usize,
        total: usize,
        message: String,
    },
    DownloadFailed {
        filename: String,
        reason: String,
    },
    BadgeCompleted {
        name: String,
        output_path: String,
        status: String,
    },
    BadgeFailed {
        name: String,
        error: String,
    },
    Summary {
        total: usize,
        succeeded: usize,
        no_face: usize,
        failed: usize,
        downloaded: usize,
        duration_secs: f64,
    },
}

impl JsonMessage {
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Emit a progress line, at most one per 40ms except the final one
    pub fn progress(phase: &str, current: usize, total: usize, message: impl Into<String>) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let last_ms = LAST_PROGRESS_MS.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last_ms) >= PROGRESS_INTERVAL_MS || current == total {
            LAST_PROGRESS_MS.store(now_ms, Ordering::Relaxed);
            Self::Progress {
                phase: phase.to_string(),
                current,
                total,
                message: message.into(),
            }
            .emit();
        }
    }

    pub fn download_failed(filename: &str, reason: impl Into<String>) {
        Self::DownloadFailed {
            filename: filename.to_string(),
            reason: reason.into(),
        }
        .emit();
    }

    pub fn badge_completed(name: &str, output_path: &Path, status: &str) {
        Self::BadgeCompleted {
            name: name.to_string(),
            output_path: output_path.display().to_string(),
            status: status.to_string(),
        }
        .emit();
    }

    pub fn badge_failed(name: &str, error: impl Into<String>) {
        Self::BadgeFailed {
            name: name.to_string(),
            error: error.into(),
        }
        .emit();
    }
}

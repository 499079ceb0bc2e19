// Library exports for the binary and for GUI front ends
pub mod acquisition;
pub mod badge;
pub mod batch;
pub mod cli;
pub mod config_file;
pub mod json_output;
pub mod report;
pub mod roster;
pub mod utils;

// Re-export commonly used types
pub use acquisition::{
    AcquisitionCoordinator, AcquisitionStats, DownloadTask, FetchError, HttpFetcher, ImageFetcher,
    LocalInventory, OfflineFetcher,
};
pub use badge::{BadgeResult, BadgeSpec, BadgeStatus, Compositor, FieldPosition};
pub use batch::{BatchOrchestrator, BatchReport, ProgressEvent};
pub use json_output::JsonMessage;
pub use roster::{FetchKey, FormatError, ImageFormat, RosterEntry};

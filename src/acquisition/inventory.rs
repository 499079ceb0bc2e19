use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::roster::{self, FormatError, ImageFormat};

/// A source image on local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub path: PathBuf,
    pub format: ImageFormat,
}

impl ImageAsset {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether the file is on disk right now
    pub fn present(&self) -> bool {
        self.path.is_file()
    }
}

/// Flat directory of source portraits
///
/// Nothing is cached: every query looks at the directory again, so files
/// written by the fetcher are visible immediately.
#[derive(Debug, Clone)]
pub struct LocalInventory {
    root: PathBuf,
}

impl LocalInventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if it is missing
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!(
                "Failed to create source directory: {}",
                self.root.display()
            )
        })
    }

    /// Location a filename resolves to inside this inventory
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Whether a regular file with exactly this name exists
    pub fn exists(&self, filename: &str) -> bool {
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return false;
        }
        self.path_for(filename).is_file()
    }

    /// Every file with a supported image extension, sorted by name
    ///
    /// Subdirectories are not descended into. Files whose names do not
    /// follow the roster grammar are still listed.
    pub fn list(&self) -> Vec<ImageAsset> {
        if !self.root.is_dir() {
            return Vec::new();
        }

        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.into_path();
                ImageFormat::from_path(&path).map(|format| ImageAsset { path, format })
            })
            .collect()
    }

    /// Check that a name follows the roster grammar; no filesystem access
    pub fn validate_format(&self, filename: &str) -> Result<(), FormatError> {
        roster::decode(filename).map(|_| ())
    }
}

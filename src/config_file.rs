use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::{DEFAULT_TIMEOUT, DEFAULT_WORKERS};
use crate::badge::cascade::DetectorParams;
use crate::badge::{BadgeSpec, FieldPosition};
use crate::cli::{parse_slot, Args};
use crate::roster::ImageFormat;

/// Badge processor configuration file
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub source_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub source_format: Option<ImageFormat>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    pub badge: Option<BadgeSpec>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub format: Option<ImageFormat>,
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub workers: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    pub cascade: Option<PathBuf>,
    #[serde(flatten)]
    pub params: DetectorParams,
}

impl ConfigFile {
    /// Read a config file; relative paths inside it are resolved against
    /// the file's own directory
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config: ConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let Some(dir) = self.source_dir.as_mut() {
            resolve(dir);
        }
        if let Some(dir) = self.output_dir.as_mut() {
            resolve(dir);
        }
        if let Some(cascade) = self.detector.cascade.as_mut() {
            resolve(cascade);
        }
        if let Some(badge) = self.badge.as_mut() {
            resolve(&mut badge.template_path);
            // Bare font names are looked up in system font directories
            if let Some(font) = badge.font_path.as_mut() {
                if font.components().count() > 1 {
                    resolve(font);
                }
            }
        }
    }
}

/// Fully resolved run configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub source_format: ImageFormat,
    pub output_format: ImageFormat,
    pub output_prefix: String,
    /// `None` means no remote source
    pub base_url: Option<String>,
    pub workers: usize,
    pub timeout: Duration,
    pub cascade: Option<PathBuf>,
    pub detector: DetectorParams,
    pub badge: BadgeSpec,
}

impl Args {
    /// Load the config file (if any) and merge it with command-line arguments
    ///
    /// Command-line arguments take precedence over config file values.
    pub fn resolve_settings(&self) -> Result<Settings> {
        let config = match &self.config_file {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        self.merge_with(config)
    }

    fn merge_with(&self, config: ConfigFile) -> Result<Settings> {
        let source_dir = self
            .source_dir
            .clone()
            .or(config.source_dir)
            .context("No source directory given (use --source or sourceDir in the config file)")?;

        let output_dir = self
            .output_dir
            .clone()
            .or(config.output_dir)
            .unwrap_or_else(|| PathBuf::from("badges"));

        let mut badge = match (config.badge, &self.template) {
            (Some(mut badge), template) => {
                if let Some(template) = template {
                    badge.template_path = template.clone();
                }
                badge
            }
            (None, Some(template)) => {
                let slot = self
                    .portrait_slot
                    .as_deref()
                    .context("--portrait-slot is required when the config file has no badge section")?;
                let (x, y, width, height) = parse_slot(slot)?;
                BadgeSpec::new(
                    template.clone(),
                    FieldPosition { x, y, width, height, ..Default::default() },
                )
            }
            (None, None) => anyhow::bail!(
                "No badge template given (use --template or the badge section of the config file)"
            ),
        };

        if let Some(slot) = &self.portrait_slot {
            let (x, y, width, height) = parse_slot(slot)?;
            let portrait = badge
                .position_map
                .entry(crate::badge::PORTRAIT_FIELD.to_string())
                .or_default();
            portrait.x = x;
            portrait.y = y;
            portrait.width = width;
            portrait.height = height;
        }
        if let Some(font) = &self.font {
            badge.font_path = Some(font.clone());
        }
        if let Some(size) = self.font_size {
            badge.font_size = size;
        }
        if let Some(qr_text) = &self.qr_text {
            badge.qr_payload_template = qr_text.clone();
        }

        let base_url = if self.no_download {
            None
        } else {
            self.base_url
                .clone()
                .or(config.remote.base_url)
                .filter(|url| !url.trim().is_empty())
        };

        Ok(Settings {
            source_dir,
            output_dir,
            source_format: self
                .source_format
                .or(config.source_format)
                .unwrap_or(ImageFormat::Jpg),
            output_format: self
                .output_format
                .or(config.output.format)
                .unwrap_or(ImageFormat::Png),
            output_prefix: self
                .output_prefix
                .clone()
                .or(config.output.prefix)
                .unwrap_or_else(|| "badge".to_string()),
            base_url,
            workers: self
                .workers
                .or(config.remote.workers)
                .unwrap_or(DEFAULT_WORKERS),
            timeout: self
                .timeout_secs
                .or(config.remote.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            cascade: self.cascade.clone().or(config.detector.cascade),
            detector: config.detector.params,
            badge,
        })
    }
}

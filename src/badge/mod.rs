pub mod annotate;
pub mod cascade;
pub mod face_detection;
pub mod orientation;
pub mod qr;
pub mod resize;

use ab_glyph::FontVec;
use image::{imageops, DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::roster::{ImageFormat, RosterEntry};
use crate::utils::sanitize_filename;
use annotate::{TextAlign, MIN_TEXT_MARGIN};
use face_detection::{select_primary_face, FaceBox, FaceLocator};
use qr::QrSettings;

/// Position map key of the portrait slot
pub const PORTRAIT_FIELD: &str = "portrait";
/// Position map key of the QR code
pub const QR_FIELD: &str = "qr";

/// Long side of the grayscale copy searched for faces
const DETECTION_MAX_SIDE: u32 = 800;

#[derive(Debug, Error)]
pub enum BadgeError {
    #[error("unreadable source: {0}")]
    Decode(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("font error: {0}")]
    Font(String),

    #[error("QR error: {0}")]
    Qr(String),

    #[error("invalid badge spec: {0}")]
    Spec(String),

    #[error("portrait error: {0}")]
    Transform(String),

    #[error("write error: {0}")]
    Write(String),
}

/// Anchor and styling of one entry in the position map
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldPosition {
    pub x: i64,
    pub y: i64,
    /// Slot width for the portrait, side length for the QR code
    pub width: u32,
    pub height: u32,
    pub max_width: Option<u32>,
    pub font_size: Option<f32>,
    pub color: Option<String>,
    pub align: TextAlign,
    /// Text template; defaults depend on the field key
    pub text: Option<String>,
    pub uppercase: bool,
}

/// Everything needed to compose one run's badges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeSpec {
    pub template_path: PathBuf,
    pub position_map: BTreeMap<String, FieldPosition>,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_qr_payload")]
    pub qr_payload_template: String,
    #[serde(default = "default_role_titles")]
    pub role_titles: BTreeMap<String, String>,
    #[serde(default)]
    pub qr: QrSettings,
    #[serde(default = "default_portrait_padding")]
    pub portrait_padding: f64,
    #[serde(default = "default_text_color")]
    pub text_color: String,
    /// Draw the template over the portrait, for templates with a transparent window
    #[serde(default)]
    pub portrait_behind_template: bool,
}

fn default_font_size() -> f32 {
    48.0
}

fn default_qr_payload() -> String {
    "Fullname: {name}, Position: {role}, Badge_Id: {display_id}".to_string()
}

fn default_portrait_padding() -> f64 {
    0.6
}

fn default_text_color() -> String {
    "black".to_string()
}

pub fn default_role_titles() -> BTreeMap<String, String> {
    [
        ("A", "Assistant"),
        ("SA", "Senior Assistant"),
        ("SME", "Subject Matter Expert"),
        ("E", "Engineer"),
        ("SE", "Senior Engineer"),
        ("TL", "Team Lead"),
        ("PM", "Project Manager"),
        ("SM", "Senior Manager"),
        ("D", "Director"),
        ("SD", "Senior Director"),
        ("VP", "Vice President"),
        ("CEO", "CEO"),
    ]
    .into_iter()
    .map(|(code, title)| (code.to_string(), title.to_string()))
    .collect()
}

/// Text template used when a field does not set one
fn default_text_template(key: &str) -> Option<&'static str> {
    match key {
        "name" => Some("{name}"),
        "id" => Some("{display_id}"),
        "role" => Some("{role}"),
        "sequence" => Some("{sequence}"),
        _ => None,
    }
}

/// Text is rasterised with 32-bit coordinates
fn text_anchor(key: &str, field: &FieldPosition) -> Result<(i32, i32), BadgeError> {
    match (i32::try_from(field.x), i32::try_from(field.y)) {
        (Ok(x), Ok(y)) => Ok((x, y)),
        _ => Err(BadgeError::Spec(format!(
            "text field '{}' position ({}, {}) is out of range",
            key, field.x, field.y
        ))),
    }
}

impl BadgeSpec {
    /// Minimal spec: template plus portrait slot, no text, no QR
    pub fn new(template_path: impl Into<PathBuf>, portrait: FieldPosition) -> Self {
        let mut position_map = BTreeMap::new();
        position_map.insert(PORTRAIT_FIELD.to_string(), portrait);
        Self {
            template_path: template_path.into(),
            position_map,
            font_path: None,
            font_size: default_font_size(),
            qr_payload_template: default_qr_payload(),
            role_titles: default_role_titles(),
            qr: QrSettings::default(),
            portrait_padding: default_portrait_padding(),
            text_color: default_text_color(),
            portrait_behind_template: false,
        }
    }

    pub fn portrait_slot(&self) -> Result<&FieldPosition, BadgeError> {
        self.position_map
            .get(PORTRAIT_FIELD)
            .filter(|slot| slot.width > 0 && slot.height > 0)
            .ok_or_else(|| {
                BadgeError::Spec("position map needs a portrait slot with a non-zero size".into())
            })
    }

    /// Position map entries rendered as text
    pub fn text_fields(&self) -> impl Iterator<Item = (&String, &FieldPosition)> {
        self.position_map
            .iter()
            .filter(|(key, _)| key.as_str() != PORTRAIT_FIELD && key.as_str() != QR_FIELD)
    }

    /// Display title for a role code, the code itself when unknown
    pub fn role_title<'a>(&'a self, code: &'a str) -> &'a str {
        self.role_titles
            .get(code)
            .or_else(|| self.role_titles.get(&code.to_ascii_uppercase()))
            .map(String::as_str)
            .unwrap_or(code)
    }

    fn text_template<'a>(&self, key: &str, field: &'a FieldPosition) -> Option<&'a str> {
        field.text.as_deref().or_else(|| default_text_template(key))
    }

    /// Structural checks that need no file access
    pub fn validate(&self) -> Result<(), BadgeError> {
        self.portrait_slot()?;

        if !(self.font_size > 0.0) {
            return Err(BadgeError::Spec(format!("font size {} must be positive", self.font_size)));
        }
        if self.portrait_padding < 0.0 {
            return Err(BadgeError::Spec("portrait padding must not be negative".into()));
        }
        annotate::parse_color(&self.text_color).map_err(|e| BadgeError::Spec(e.to_string()))?;

        for (key, field) in self.text_fields() {
            if self.text_template(key, field).is_none() {
                return Err(BadgeError::Spec(format!(
                    "text field '{}' has no text template",
                    key
                )));
            }
            if let Some(color) = &field.color {
                annotate::parse_color(color).map_err(|e| BadgeError::Spec(e.to_string()))?;
            }
            text_anchor(key, field)?;
        }

        if self.text_fields().next().is_some() && self.font_path.is_none() {
            return Err(BadgeError::Spec("text fields are configured but no font is set".into()));
        }

        if self.position_map.contains_key(QR_FIELD) {
            annotate::parse_color(&self.qr.fill_color).map_err(|e| BadgeError::Qr(e.to_string()))?;
            annotate::parse_color(&self.qr.back_color).map_err(|e| BadgeError::Qr(e.to_string()))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadgeStatus {
    Success,
    NoFaceFallback,
    Failed,
}

impl BadgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeStatus::Success => "SUCCESS",
            BadgeStatus::NoFaceFallback => "NO_FACE_FALLBACK",
            BadgeStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of composing one roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeResult {
    pub roster_entry: RosterEntry,
    pub output_path: Option<PathBuf>,
    pub status: BadgeStatus,
    pub error_reason: Option<String>,
}

impl BadgeResult {
    pub fn failed(entry: &RosterEntry, reason: impl Into<String>) -> Self {
        Self {
            roster_entry: entry.clone(),
            output_path: None,
            status: BadgeStatus::Failed,
            error_reason: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == BadgeStatus::Failed
    }
}

/// Turns a source photo into a finished badge
pub struct Compositor {
    locator: Arc<dyn FaceLocator>,
    output_dir: PathBuf,
    output_format: ImageFormat,
    output_prefix: String,
}

impl Compositor {
    pub fn new(locator: Arc<dyn FaceLocator>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            locator,
            output_dir: output_dir.into(),
            output_format: ImageFormat::Png,
            output_prefix: "badge".to_string(),
        }
    }

    pub fn with_output_format(mut self, format: ImageFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<prefix>-<NAME>_<ROLE>_<ID>_<seq>.<ext>`, upper-cased
    pub fn output_path_for(&self, entry: &RosterEntry) -> PathBuf {
        let stem = format!(
            "{}_{}_{}_{}",
            entry.display_name, entry.role_code, entry.display_id(), entry.sequence
        )
        .to_uppercase();
        let name = format!(
            "{}-{}.{}",
            sanitize_filename(&self.output_prefix),
            sanitize_filename(&stem).replace(' ', "-"),
            self.output_format.extension()
        );
        self.output_dir.join(name)
    }

    /// Compose one badge; never fails past this boundary
    pub fn compose(&self, source: &Path, entry: &RosterEntry, spec: &BadgeSpec) -> BadgeResult {
        match self.try_compose(source, entry, spec) {
            Ok((output_path, face_found)) => {
                let status = if face_found {
                    BadgeStatus::Success
                } else {
                    BadgeStatus::NoFaceFallback
                };
                debug!(output = %output_path.display(), ?status, "badge written");
                BadgeResult {
                    roster_entry: entry.clone(),
                    output_path: Some(output_path),
                    status,
                    error_reason: None,
                }
            }
            Err(e) => {
                warn!(source = %source.display(), "badge failed: {}", e);
                BadgeResult::failed(entry, e.to_string())
            }
        }
    }

    fn try_compose(
        &self,
        source: &Path,
        entry: &RosterEntry,
        spec: &BadgeSpec,
    ) -> Result<(PathBuf, bool), BadgeError> {
        let photo = load_source(source)?;
        let slot = spec.portrait_slot()?;

        let face = self.primary_face(&photo);
        let portrait = match face {
            Some(face) => {
                let region = resize::portrait_region(
                    face,
                    spec.portrait_padding,
                    slot.width,
                    slot.height,
                    photo.width(),
                    photo.height(),
                );
                let cropped = resize::crop(&photo, region).map_err(transform_error)?;
                resize::scale_to_fit(&cropped, slot.width, slot.height)
            }
            None => resize::scale_to_fit(&photo, slot.width, slot.height),
        }
        .map_err(transform_error)?;

        let template = image::open(&spec.template_path)
            .map_err(|e| {
                BadgeError::Template(format!("{}: {}", spec.template_path.display(), e))
            })?
            .to_rgba8();

        // Centre the portrait inside its slot
        let px = slot.x + (slot.width.saturating_sub(portrait.width()) / 2) as i64;
        let py = slot.y + (slot.height.saturating_sub(portrait.height()) / 2) as i64;

        let mut canvas = if spec.portrait_behind_template {
            let mut base = RgbaImage::from_pixel(template.width(), template.height(), Rgba([255, 255, 255, 255]));
            imageops::overlay(&mut base, &portrait, px, py);
            imageops::overlay(&mut base, &template, 0, 0);
            base
        } else {
            let mut base = template;
            imageops::overlay(&mut base, &portrait, px, py);
            base
        };

        self.draw_text_fields(&mut canvas, entry, spec)?;
        self.draw_qr(&mut canvas, entry, spec)?;

        let output_path = self.output_path_for(entry);
        self.save(&canvas, &output_path)?;
        Ok((output_path, face.is_some()))
    }

    fn primary_face(&self, photo: &RgbaImage) -> Option<FaceBox> {
        let (width, height) = photo.dimensions();
        let long_side = width.max(height);
        let factor = if long_side > DETECTION_MAX_SIDE {
            DETECTION_MAX_SIDE as f64 / long_side as f64
        } else {
            1.0
        };

        let gray = DynamicImage::ImageRgba8(photo.clone()).to_luma8();
        let gray = if factor < 1.0 {
            imageops::resize(
                &gray,
                ((width as f64 * factor).round() as u32).max(1),
                ((height as f64 * factor).round() as u32).max(1),
                imageops::FilterType::Triangle,
            )
        } else {
            gray
        };

        let faces = self.locator.locate(&gray);
        debug!(faces = faces.len(), "face location finished");

        select_primary_face(&faces, gray.width()).map(|f| {
            let up = |v: u32| (v as f64 / factor).round() as u32;
            let x = up(f.x).min(width.saturating_sub(1));
            let y = up(f.y).min(height.saturating_sub(1));
            FaceBox::new(
                x,
                y,
                up(f.width).clamp(1, width - x),
                up(f.height).clamp(1, height - y),
            )
        })
    }

    fn draw_text_fields(
        &self,
        canvas: &mut RgbaImage,
        entry: &RosterEntry,
        spec: &BadgeSpec,
    ) -> Result<(), BadgeError> {
        let fields = spec
            .text_fields()
            .map(|(key, field)| text_anchor(key, field).map(|anchor| (key, field, anchor)))
            .collect::<Result<Vec<_>, _>>()?;
        if fields.is_empty() {
            return Ok(());
        }

        let font = load_spec_font(spec)?;
        let role_title = spec.role_title(&entry.role_code);
        let default_color = annotate::parse_color(&spec.text_color).map_err(|e| BadgeError::Spec(e.to_string()))?;
        let default_max_width = canvas.width().saturating_sub(MIN_TEXT_MARGIN).max(1);

        for (key, field, (x, y)) in fields {
            let template = spec
                .text_template(key, field)
                .ok_or_else(|| BadgeError::Spec(format!("text field '{}' has no text template", key)))?;
            let mut text = qr::substitute_fields(template, entry, role_title).trim().to_string();
            if field.uppercase {
                text = text.to_uppercase();
            }
            if text.is_empty() {
                continue;
            }

            let color = match &field.color {
                Some(c) => annotate::parse_color(c).map_err(|e| BadgeError::Spec(e.to_string()))?,
                None => default_color,
            };

            let used = annotate::draw_text_field(
                canvas,
                &font,
                &text,
                x,
                y,
                field.font_size.unwrap_or(spec.font_size),
                field.max_width.unwrap_or(default_max_width),
                field.align,
                color,
            );
            debug!(field = key.as_str(), size = used, "text drawn");
        }

        Ok(())
    }

    fn draw_qr(&self, canvas: &mut RgbaImage, entry: &RosterEntry, spec: &BadgeSpec) -> Result<(), BadgeError> {
        let Some(anchor) = spec.position_map.get(QR_FIELD) else {
            return Ok(());
        };

        let payload = qr::substitute_fields(&spec.qr_payload_template, entry, spec.role_title(&entry.role_code));
        let fill = annotate::parse_color(&spec.qr.fill_color).map_err(|e| BadgeError::Qr(e.to_string()))?;
        let back = annotate::parse_color(&spec.qr.back_color).map_err(|e| BadgeError::Qr(e.to_string()))?;

        let mut code = qr::render_qr(&payload, spec.qr.box_size, spec.qr.border, fill, back)
            .map_err(|e| BadgeError::Qr(e.to_string()))?;
        if anchor.width > 0 && anchor.width != code.width() {
            code = imageops::resize(&code, anchor.width, anchor.width, imageops::FilterType::Nearest);
        }

        imageops::overlay(canvas, &code, anchor.x, anchor.y);
        Ok(())
    }

    fn save(&self, canvas: &RgbaImage, output_path: &Path) -> Result<(), BadgeError> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| BadgeError::Write(format!("{}: {}", self.output_dir.display(), e)))?;

        let image = match self.output_format {
            ImageFormat::Jpg | ImageFormat::Jpeg | ImageFormat::Bmp => {
                DynamicImage::ImageRgb8(flatten_onto_white(canvas))
            }
            _ => DynamicImage::ImageRgba8(canvas.clone()),
        };

        image
            .save_with_format(output_path, self.output_format.encoder_format())
            .map_err(|e| {
                let _ = std::fs::remove_file(output_path);
                BadgeError::Write(format!("{}: {}", output_path.display(), e))
            })
    }
}

fn transform_error(e: anyhow::Error) -> BadgeError {
    BadgeError::Transform(format!("{:#}", e))
}

/// Decode a source photo and turn it upright
fn load_source(source: &Path) -> Result<RgbaImage, BadgeError> {
    let bytes = std::fs::read(source)
        .map_err(|e| BadgeError::Decode(format!("{}: {}", source.display(), e)))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|e| BadgeError::Decode(format!("{}: {}", source.display(), e)))?;

    let upright = orientation::apply_orientation(decoded, orientation::read_exif_orientation(&bytes));
    Ok(upright.to_rgba8())
}

fn load_spec_font(spec: &BadgeSpec) -> Result<FontVec, BadgeError> {
    let path = spec
        .font_path
        .as_deref()
        .ok_or_else(|| BadgeError::Font("text fields are configured but no font is set".into()))?;
    annotate::load_font(path).map_err(|e| BadgeError::Font(format!("{:#}", e)))
}

fn flatten_onto_white(canvas: &RgbaImage) -> image::RgbImage {
    image::RgbImage::from_fn(canvas.width(), canvas.height(), |x, y| {
        let Rgba([r, g, b, a]) = *canvas.get_pixel(x, y);
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

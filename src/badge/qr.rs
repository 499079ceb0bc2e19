use image::{imageops, Rgba, RgbaImage};
use qrcode::types::QrError;
use qrcode::{EcLevel, QrCode};
use serde::{Deserialize, Serialize};

use crate::roster::RosterEntry;

/// Raster settings for the badge QR code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QrSettings {
    /// Pixels per module
    pub box_size: u32,
    /// Quiet zone width in modules
    pub border: u32,
    pub fill_color: String,
    pub back_color: String,
}

impl Default for QrSettings {
    fn default() -> Self {
        Self {
            box_size: 10,
            border: 4,
            fill_color: "black".to_string(),
            back_color: "white".to_string(),
        }
    }
}

/// Replace `{placeholder}`s in a text or QR template with entry fields
///
/// `{role}` is the role title, `{role_code}` the raw code. Unknown
/// placeholders are left as they are.
pub fn substitute_fields(template: &str, entry: &RosterEntry, role_title: &str) -> String {
    let fetch_key = entry
        .fetch_key()
        .map(|key| key.to_string())
        .unwrap_or_else(|_| entry.employee_id.clone());

    template
        .replace("{name}", &entry.display_name)
        .replace("{employee_id}", &entry.employee_id)
        .replace("{display_id}", &entry.display_id())
        .replace("{fetch_key}", &fetch_key)
        .replace("{role_code}", &entry.role_code)
        .replace("{role}", role_title)
        .replace("{sequence}", &entry.sequence.to_string())
}

/// Encode `payload` at error-correction level L and rasterise it
///
/// The renderer's own quiet zone is fixed at four modules, so the code is
/// drawn bare and then centred on a background square `border` modules wider
/// on each side.
pub fn render_qr(
    payload: &str,
    box_size: u32,
    border: u32,
    fill: Rgba<u8>,
    background: Rgba<u8>,
) -> Result<RgbaImage, QrError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)?;
    let box_size = box_size.max(1);
    let modules = code
        .render::<Rgba<u8>>()
        .quiet_zone(false)
        .module_dimensions(box_size, box_size)
        .dark_color(fill)
        .light_color(background)
        .build();

    if border == 0 {
        return Ok(modules);
    }
    let margin = border * box_size;
    let mut canvas = RgbaImage::from_pixel(
        modules.width() + 2 * margin,
        modules.height() + 2 * margin,
        background,
    );
    imageops::replace(&mut canvas, &modules, margin as i64, margin as i64);
    Ok(canvas)
}

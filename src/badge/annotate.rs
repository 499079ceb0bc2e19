use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Font size removed per auto-size-down step
pub const FONT_SIZE_STEP: f32 = 5.0;

/// Horizontal margin kept free when a field has no explicit maximum width
pub const MIN_TEXT_MARGIN: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    /// The anchor x is the horizontal centre of the text
    Center,
}

/// Load a TrueType/OpenType font
///
/// `font` is either a path to a font file or a bare filename that is looked
/// up in the usual system font directories.
pub fn load_font(font: &Path) -> Result<FontVec> {
    let path = if font.is_file() {
        font.to_path_buf()
    } else {
        find_in_font_directories(font)
            .with_context(|| format!("Font not found: {}", font.display()))?
    };

    let data = std::fs::read(&path)
        .with_context(|| format!("Failed to read font file: {}", path.display()))?;
    FontVec::try_from_vec(data)
        .with_context(|| format!("Failed to parse font file: {}", path.display()))
}

fn find_in_font_directories(font: &Path) -> Option<PathBuf> {
    let filename = font.file_name()?;
    font_directories()
        .into_iter()
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .max_depth(3)
                .into_iter()
                .filter_map(|entry| entry.ok())
        })
        .find(|entry| entry.file_type().is_file() && entry.file_name() == filename)
        .map(|entry| entry.into_path())
}

fn font_directories() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = [
        "/usr/share/fonts",
        "/usr/local/share/fonts",
        "/System/Library/Fonts",
        "/Library/Fonts",
        "/mnt/c/Windows/Fonts",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    if let Ok(home) = std::env::var("HOME") {
        dirs.push(Path::new(&home).join(".fonts"));
        dirs.push(Path::new(&home).join(".local/share/fonts"));
        dirs.push(Path::new(&home).join("Library/Fonts"));
    }

    dirs.into_iter().filter(|d| d.is_dir()).collect()
}

/// First common sans-serif font found on this machine
pub fn find_system_font() -> Option<PathBuf> {
    const CANDIDATES: [&str; 5] = [
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "/mnt/c/Windows/Fonts/arial.ttf",
    ];
    CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .or_else(|| find_in_font_directories(Path::new("DejaVuSans.ttf")))
}

/// Parse `#RGB`, `#RRGGBB`, `#RRGGBBAA`, `black` or `white`
pub fn parse_color(color: &str) -> Result<Rgba<u8>> {
    match color.trim().to_ascii_lowercase().as_str() {
        "black" => return Ok(Rgba([0, 0, 0, 255])),
        "white" => return Ok(Rgba([255, 255, 255, 255])),
        _ => {}
    }

    let hex = color
        .trim()
        .strip_prefix('#')
        .ok_or_else(|| anyhow::anyhow!("Color '{}' must be a name or start with #", color))?;
    if !hex.is_ascii() {
        anyhow::bail!("Invalid hex color format: '{}'", color);
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).with_context(|| format!("Invalid color '{}'", color));

    match hex.len() {
        3 => Ok(Rgba([
            channel(&hex[0..1].repeat(2))?,
            channel(&hex[1..2].repeat(2))?,
            channel(&hex[2..3].repeat(2))?,
            255,
        ])),
        6 => Ok(Rgba([channel(&hex[0..2])?, channel(&hex[2..4])?, channel(&hex[4..6])?, 255])),
        8 => Ok(Rgba([
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            channel(&hex[6..8])?,
        ])),
        _ => anyhow::bail!("Invalid hex color format: '{}'", color),
    }
}

/// Largest size, stepping down from `base_size`, at which `text` fits in
/// `max_width`; never larger than `base_size`
pub fn fit_font_size(font: &FontVec, text: &str, base_size: f32, max_width: u32) -> f32 {
    let mut size = base_size;
    while size - FONT_SIZE_STEP >= FONT_SIZE_STEP && text_size(PxScale::from(size), font, text).0 > max_width {
        size -= FONT_SIZE_STEP;
    }
    size
}

/// Draw one line of text anchored at `(x, y)`, the top of the line
///
/// Returns the font size actually used.
#[allow(clippy::too_many_arguments)]
pub fn draw_text_field(
    canvas: &mut RgbaImage,
    font: &FontVec,
    text: &str,
    x: i32,
    y: i32,
    base_size: f32,
    max_width: u32,
    align: TextAlign,
    color: Rgba<u8>,
) -> f32 {
    let size = fit_font_size(font, text, base_size, max_width);
    let scale = PxScale::from(size);
    let (text_width, _) = text_size(scale, font, text);

    let left = match align {
        TextAlign::Left => x,
        TextAlign::Center => x - (text_width as i32) / 2,
    };

    draw_text_mut(canvas, color, left, y, scale, font, text);
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("#FFF").unwrap(), Rgba([255, 255, 255, 255]));
        assert_eq!(parse_color("#102030").unwrap(), Rgba([16, 32, 48, 255]));
        assert_eq!(parse_color("#10203080").unwrap(), Rgba([16, 32, 48, 128]));
        assert_eq!(parse_color("Black").unwrap(), Rgba([0, 0, 0, 255]));
        assert!(parse_color("102030").is_err());
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("#GGGGGG").is_err());
    }

    #[test]
    fn test_missing_font_is_an_error() {
        assert!(load_font(Path::new("/nonexistent/NoSuchFont-Regular.ttf")).is_err());
    }

    #[test]
    fn test_font_only_sizes_down() {
        let Some(path) = find_system_font() else {
            eprintln!("Skipping test: no system font available");
            return;
        };
        let font = load_font(&path).unwrap();

        let text = "A rather long employee name";
        let natural = text_size(PxScale::from(40.0), &font, text).0;

        assert_eq!(fit_font_size(&font, text, 40.0, natural + 100), 40.0);

        let shrunk = fit_font_size(&font, text, 40.0, natural / 2);
        assert!(shrunk < 40.0);
        assert!(shrunk >= FONT_SIZE_STEP);
        assert_eq!((40.0 - shrunk) % FONT_SIZE_STEP, 0.0);
    }

    #[test]
    fn test_draw_text_field_marks_canvas() {
        let Some(path) = find_system_font() else {
            eprintln!("Skipping test: no system font available");
            return;
        };
        let font = load_font(&path).unwrap();
        let mut canvas = RgbaImage::from_pixel(300, 80, Rgba([255, 255, 255, 255]));

        let used = draw_text_field(
            &mut canvas,
            &font,
            "JOHN",
            150,
            10,
            32.0,
            250,
            TextAlign::Center,
            Rgba([0, 0, 0, 255]),
        );

        assert_eq!(used, 32.0);
        assert!(canvas.pixels().any(|p| p[0] < 128));
    }
}

use exif::{In, Reader, Tag, Value};
use image::DynamicImage;
use std::io::Cursor;

/// EXIF orientation tag values (1-8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifOrientation {
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    /// Rotated 90 degrees CW and mirrored
    Transpose,
    Rotate90,
    /// Rotated 270 degrees CW and mirrored
    Transverse,
    Rotate270,
}

impl ExifOrientation {
    pub fn from_tag(value: u32) -> Self {
        match value {
            2 => ExifOrientation::FlipHorizontal,
            3 => ExifOrientation::Rotate180,
            4 => ExifOrientation::FlipVertical,
            5 => ExifOrientation::Transpose,
            6 => ExifOrientation::Rotate90,
            7 => ExifOrientation::Transverse,
            8 => ExifOrientation::Rotate270,
            _ => ExifOrientation::Normal,
        }
    }
}

/// Orientation stored in an encoded image, `Normal` when absent or unreadable
pub fn read_exif_orientation(encoded: &[u8]) -> ExifOrientation {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(encoded)) {
        Ok(exif) => exif,
        Err(_) => return ExifOrientation::Normal,
    };

    exif.get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| match &field.value {
            Value::Short(values) => values.first().map(|&v| ExifOrientation::from_tag(v as u32)),
            _ => None,
        })
        .unwrap_or(ExifOrientation::Normal)
}

/// Turn the pixels upright for the given orientation
pub fn apply_orientation(img: DynamicImage, orientation: ExifOrientation) -> DynamicImage {
    match orientation {
        ExifOrientation::Normal => img,
        ExifOrientation::FlipHorizontal => img.fliph(),
        ExifOrientation::Rotate180 => img.rotate180(),
        ExifOrientation::FlipVertical => img.flipv(),
        ExifOrientation::Transpose => img.rotate90().fliph(),
        ExifOrientation::Rotate90 => img.rotate90(),
        ExifOrientation::Transverse => img.rotate270().fliph(),
        ExifOrientation::Rotate270 => img.rotate270(),
    }
}

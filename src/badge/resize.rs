use anyhow::Result;
use fast_image_resize::{images::Image, PixelType, ResizeOptions, Resizer};
use image::{imageops, RgbaImage};
use std::num::NonZeroU32;

use super::face_detection::FaceBox;

/// Region of the source to crop around a face
///
/// The face box is padded by `padding` times its size on every side, widened
/// or heightened to the slot's aspect ratio, shrunk if it outgrows the image
/// and finally shifted to lie inside the image.
pub fn portrait_region(
    face: FaceBox,
    padding: f64,
    slot_width: u32,
    slot_height: u32,
    image_width: u32,
    image_height: u32,
) -> FaceBox {
    let padding = padding.max(0.0);
    let (cx, cy) = face.center();
    let mut width = face.width as f64 * (1.0 + 2.0 * padding);
    let mut height = face.height as f64 * (1.0 + 2.0 * padding);

    let aspect = slot_width.max(1) as f64 / slot_height.max(1) as f64;
    if width / height < aspect {
        width = height * aspect;
    } else {
        height = width / aspect;
    }

    let shrink = (image_width as f64 / width)
        .min(image_height as f64 / height)
        .min(1.0);
    width = (width * shrink).max(1.0);
    height = (height * shrink).max(1.0);

    let x = (cx - width / 2.0).clamp(0.0, (image_width as f64 - width).max(0.0));
    let y = (cy - height / 2.0).clamp(0.0, (image_height as f64 - height).max(0.0));

    let x = x.round() as u32;
    let y = y.round() as u32;
    FaceBox::new(
        x,
        y,
        (width.round() as u32).clamp(1, image_width.saturating_sub(x).max(1)),
        (height.round() as u32).clamp(1, image_height.saturating_sub(y).max(1)),
    )
}

/// Copy a rectangle out of an image
pub fn crop(img: &RgbaImage, region: FaceBox) -> Result<RgbaImage> {
    let (img_width, img_height) = img.dimensions();
    if region.width == 0
        || region.height == 0
        || region.x + region.width > img_width
        || region.y + region.height > img_height
    {
        anyhow::bail!(
            "Crop region ({},{} {}x{}) does not fit a {}x{} image",
            region.x,
            region.y,
            region.width,
            region.height,
            img_width,
            img_height
        );
    }

    Ok(imageops::crop_imm(img, region.x, region.y, region.width, region.height).to_image())
}

/// Largest size with the image's aspect ratio that fits the slot
pub fn fit_dimensions(width: u32, height: u32, slot_width: u32, slot_height: u32) -> (u32, u32) {
    let factor = (slot_width as f64 / width.max(1) as f64).min(slot_height as f64 / height.max(1) as f64);
    (
        ((width as f64 * factor).round() as u32).clamp(1, slot_width.max(1)),
        ((height as f64 * factor).round() as u32).clamp(1, slot_height.max(1)),
    )
}

/// Uniformly scale an image to fit inside the slot
pub fn scale_to_fit(img: &RgbaImage, slot_width: u32, slot_height: u32) -> Result<RgbaImage> {
    let (width, height) = fit_dimensions(img.width(), img.height(), slot_width, slot_height);
    resize_image(img, width, height)
}

/// Resize to exact dimensions with fast_image_resize's default filter
pub fn resize_image(img: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    let (src_width, src_height) = img.dimensions();
    if src_width == width && src_height == height {
        return Ok(img.clone());
    }

    let nonzero = |v: u32, what: &str| {
        NonZeroU32::new(v).ok_or_else(|| anyhow::anyhow!("{} is zero", what))
    };
    let src_width = nonzero(src_width, "Source width")?;
    let src_height = nonzero(src_height, "Source height")?;
    let dst_width = nonzero(width, "Target width")?;
    let dst_height = nonzero(height, "Target height")?;

    let src_image = Image::from_vec_u8(
        src_width.get(),
        src_height.get(),
        img.as_raw().clone(),
        PixelType::U8x4,
    )?;
    let mut dst_image = Image::new(dst_width.get(), dst_height.get(), PixelType::U8x4);

    Resizer::new().resize(&src_image, &mut dst_image, Some(&ResizeOptions::default()))?;

    RgbaImage::from_raw(width, height, dst_image.into_vec())
        .ok_or_else(|| anyhow::anyhow!("Resized buffer does not match {}x{}", width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn create_test_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        })
    }

    #[test]
    fn test_crop_copies_region() {
        let img = create_test_image(100, 100);
        let cropped = crop(&img, FaceBox::new(10, 10, 50, 50)).unwrap();
        assert_eq!(cropped.dimensions(), (50, 50));
        assert_eq!(img.get_pixel(15, 15), cropped.get_pixel(5, 5));
    }

    #[test]
    fn test_crop_bounds_validation() {
        let img = create_test_image(50, 50);
        assert!(crop(&img, FaceBox::new(10, 10, 50, 50)).is_err());
        assert!(crop(&img, FaceBox::new(10, 10, 40, 40)).is_ok());
    }

    #[test]
    fn test_portrait_region_matches_slot_aspect() {
        let region = portrait_region(FaceBox::new(400, 300, 100, 100), 0.6, 300, 400, 1000, 1000);
        let aspect = region.width as f64 / region.height as f64;
        assert!((aspect - 0.75).abs() < 0.01);
        assert!(region.contains_point(450, 350));
        // padding 0.6 on each side: 220 wide, then taller for the slot
        assert_eq!(region.width, 220);
    }

    #[test]
    fn test_portrait_region_stays_inside_image() {
        let region = portrait_region(FaceBox::new(0, 0, 80, 80), 0.6, 100, 100, 200, 150);
        assert!(region.x + region.width <= 200);
        assert!(region.y + region.height <= 150);
        assert_eq!(region.width, region.height);

        let region = portrait_region(FaceBox::new(50, 50, 100, 100), 0.6, 100, 100, 120, 400);
        assert!(region.width <= 120);
        assert!(region.x + region.width <= 120);
    }

    #[test]
    fn test_scale_to_fit_preserves_aspect() {
        let img = create_test_image(200, 100);
        let scaled = scale_to_fit(&img, 100, 100).unwrap();
        assert_eq!(scaled.dimensions(), (100, 50));

        let img = create_test_image(30, 40);
        let scaled = scale_to_fit(&img, 300, 400).unwrap();
        assert_eq!(scaled.dimensions(), (300, 400));
    }

    #[test]
    fn test_resize_rejects_zero_target() {
        let img = create_test_image(10, 10);
        assert!(resize_image(&img, 0, 5).is_err());
    }
}

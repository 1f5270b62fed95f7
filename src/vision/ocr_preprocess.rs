//! Image preprocessing filters for OCR
//!
//! Optional enhancements that help Tesseract with small, glossy or low-contrast
//! price tags. Upscaling changes the coordinate space, so the factor is returned
//! with the image and recognized boxes are divided by it afterwards.

use image::{imageops, imageops::FilterType, RgbaImage};
use tracing::debug;

use crate::config::OcrPreprocessing;

/// Preprocessed image plus the factor it was upscaled by
pub struct PreprocessResult {
    pub image: RgbaImage,
    /// Integer upscale factor (1 = original size)
    pub scale: u32,
}

/// Apply preprocessing filters based on settings
pub fn apply_preprocessing_with_scale(image: &RgbaImage, settings: &OcrPreprocessing) -> PreprocessResult {
    if !settings.enabled {
        return PreprocessResult {
            image: image.clone(),
            scale: 1,
        };
    }

    debug!(
        "OCR preprocessing: grayscale={}, invert={}, contrast={}, sharpen={}, scale={}",
        settings.grayscale, settings.invert, settings.contrast, settings.sharpen, settings.scale
    );

    // Upscale first so later filters work on the final resolution
    let scale = settings.scale.max(1);
    let mut result = if scale > 1 {
        let (w, h) = image.dimensions();
        imageops::resize(image, w * scale, h * scale, FilterType::Triangle)
    } else {
        image.clone()
    };

    if (settings.contrast - 1.0).abs() > 0.01 {
        apply_contrast(&mut result, settings.contrast);
    }

    if settings.sharpen > 0.01 {
        result = apply_sharpen(&result, settings.sharpen);
    }

    if settings.grayscale {
        apply_grayscale(&mut result);
    }

    // Invert last
    if settings.invert {
        imageops::invert(&mut result);
    }

    PreprocessResult { image: result, scale }
}

/// Stretch contrast around mid-gray; factor > 1.0 increases contrast
fn apply_contrast(image: &mut RgbaImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut().take(3) {
            *channel = ((*channel as f32 - 128.0) * factor + 128.0).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Luminance grayscale, keeping the RGBA layout
fn apply_grayscale(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        let gray = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) as u8;
        pixel.0[0] = gray;
        pixel.0[1] = gray;
        pixel.0[2] = gray;
    }
}

/// 3x3 cross sharpening kernel; border pixels are left untouched
fn apply_sharpen(image: &RgbaImage, strength: f32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let mut result = image.clone();
    if w < 3 || h < 3 {
        return result;
    }

    let center_weight = 1.0 + 4.0 * strength;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = image.get_pixel(x, y);
            let neighbours = [
                image.get_pixel(x, y - 1),
                image.get_pixel(x, y + 1),
                image.get_pixel(x - 1, y),
                image.get_pixel(x + 1, y),
            ];
            let out = result.get_pixel_mut(x, y);
            for c in 0..3 {
                let sum: f32 = neighbours.iter().map(|p| p[c] as f32).sum();
                out[c] = (center[c] as f32 * center_weight - strength * sum).clamp(0.0, 255.0) as u8;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn single(pixel: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(1, 1, Rgba(pixel))
    }

    #[test]
    fn test_preprocessing_disabled() {
        let image = single([100, 150, 200, 255]);
        let result = apply_preprocessing_with_scale(&image, &OcrPreprocessing::default());
        assert_eq!(result.scale, 1);
        assert_eq!(result.image, image);
    }

    #[test]
    fn test_contrast_increase() {
        let mut image = single([100, 128, 200, 255]);
        apply_contrast(&mut image, 2.0);
        // (100-128)*2+128 = 72, 128 stays, 200 clamps to 255
        assert_eq!(image.get_pixel(0, 0).0, [72, 128, 255, 255]);
    }

    #[test]
    fn test_grayscale() {
        let mut image = single([255, 0, 0, 255]);
        apply_grayscale(&mut image);
        // 0.299 * 255 = 76.245
        assert_eq!(image.get_pixel(0, 0).0, [76, 76, 76, 255]);
    }

    #[test]
    fn test_invert_keeps_alpha() {
        let settings = OcrPreprocessing {
            enabled: true,
            grayscale: false,
            invert: true,
            ..Default::default()
        };
        let result = apply_preprocessing_with_scale(&single([0, 100, 255, 200]), &settings);
        assert_eq!(result.image.get_pixel(0, 0).0, [255, 155, 0, 200]);
    }

    #[test]
    fn test_sharpen_flat_image_unchanged() {
        let image = RgbaImage::from_pixel(5, 5, Rgba([90, 90, 90, 255]));
        assert_eq!(apply_sharpen(&image, 1.0), image);
    }

    #[test]
    fn test_sharpen_boosts_center() {
        let mut image = RgbaImage::from_pixel(3, 3, Rgba([100, 100, 100, 255]));
        image.put_pixel(1, 1, Rgba([120, 120, 120, 255]));
        let sharpened = apply_sharpen(&image, 0.5);
        // 120 * 3 - 0.5 * 400 = 160
        assert_eq!(sharpened.get_pixel(1, 1)[0], 160);
        assert_eq!(sharpened.get_pixel(0, 0)[0], 100);
    }

    #[test]
    fn test_preprocessing_with_scale() {
        let image = RgbaImage::from_pixel(2, 3, Rgba([100, 100, 100, 255]));
        let settings = OcrPreprocessing {
            enabled: true,
            scale: 2,
            ..Default::default()
        };

        let result = apply_preprocessing_with_scale(&image, &settings);
        assert_eq!(result.scale, 2);
        assert_eq!(result.image.dimensions(), (4, 6));
    }
}

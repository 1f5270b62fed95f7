//! Image preprocessing for detection models
//!
//! Handles rotation correction, resizing and tensor layout conversion.

use image::{imageops, imageops::FilterType, RgbImage, RgbaImage};
use ndarray::Array4;

use crate::capture::Rotation;
use crate::vision::BoundingBox;

/// Rotate a sensor frame clockwise so it is upright
pub fn rotate_upright(image: &RgbaImage, rotation: Rotation) -> RgbaImage {
    match rotation {
        Rotation::Deg0 => image.clone(),
        Rotation::Deg90 => imageops::rotate90(image),
        Rotation::Deg180 => imageops::rotate180(image),
        Rotation::Deg270 => imageops::rotate270(image),
    }
}

/// Map a box from a `width`x`height` image into the same image rotated clockwise
pub fn rotate_box(b: &BoundingBox, rotation: Rotation, width: u32, height: u32) -> BoundingBox {
    let (w, h) = (width as f32, height as f32);
    match rotation {
        Rotation::Deg0 => *b,
        // (x, y) -> (h - y, x)
        Rotation::Deg90 => BoundingBox::new(h - b.y1, b.x0, h - b.y0, b.x1),
        // (x, y) -> (w - x, h - y)
        Rotation::Deg180 => BoundingBox::new(w - b.x1, h - b.y1, w - b.x0, h - b.y0),
        // (x, y) -> (y, w - x)
        Rotation::Deg270 => BoundingBox::new(b.y0, w - b.x1, b.y1, w - b.x0),
    }
}

/// Map a box found in the upright image back to sensor coordinates.
/// `upright_width`/`upright_height` are the dimensions of the rotated image.
pub fn map_box_to_source(
    b: &BoundingBox,
    rotation: Rotation,
    upright_width: u32,
    upright_height: u32,
) -> BoundingBox {
    rotate_box(b, rotation.inverse(), upright_width, upright_height)
}

/// Resize to the model input size, returning the image and the (x, y) factors
/// that map model coordinates back to the source image
pub fn resize_for_model(image: &RgbaImage, target_width: u32, target_height: u32) -> (RgbImage, f32, f32) {
    let (w, h) = image.dimensions();
    let resized = imageops::resize(image, target_width, target_height, FilterType::Triangle);
    let rgb = image::DynamicImage::ImageRgba8(resized).to_rgb8();

    let scale_x = w as f32 / target_width as f32;
    let scale_y = h as f32 / target_height as f32;

    (rgb, scale_x, scale_y)
}

/// Convert an RGB image to an NCHW f32 tensor in [0, 1] (batch size 1)
pub fn to_nchw_f32(image: &RgbImage) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}

/// Convert an RGB image to an NHWC u8 tensor (batch size 1)
pub fn to_nhwc_u8(image: &RgbImage) -> Array4<u8> {
    let (w, h) = image.dimensions();
    let mut tensor = Array4::<u8>::zeros((1, h as usize, w as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, y, x, c]] = pixel[c];
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn assert_box_close(a: &BoundingBox, b: &BoundingBox) {
        for (p, q) in [(a.x0, b.x0), (a.y0, b.y0), (a.x1, b.x1), (a.y1, b.y1)] {
            assert!((p - q).abs() < 1e-4, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_four_quarter_turns_restore_box() {
        let original = BoundingBox::new(12.5, 40.0, 80.25, 61.0);
        let (mut w, mut h) = (200u32, 100u32);
        let mut b = original;

        for _ in 0..4 {
            b = rotate_box(&b, Rotation::Deg90, w, h);
            (w, h) = (h, w);
        }

        assert_eq!((w, h), (200, 100));
        assert_box_close(&b, &original);
    }

    #[test]
    fn test_map_back_to_source_inverts_rotation() {
        let original = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        for rotation in [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
            let upright = rotate_box(&original, rotation, 120, 80);
            let (uw, uh) = rotation.rotated_dimensions(120, 80);
            let back = map_box_to_source(&upright, rotation, uw, uh);
            assert_box_close(&back, &original);
        }
    }

    #[test]
    fn test_box_rotation_matches_pixel_rotation() {
        // A single marked pixel at (x=2, y=1) in a 5x3 image
        let mut img = RgbaImage::new(5, 3);
        img.put_pixel(2, 1, Rgba([255, 0, 0, 255]));
        let pixel_box = BoundingBox::new(2.0, 1.0, 3.0, 2.0);

        for rotation in [Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
            let rotated = rotate_upright(&img, rotation);
            let b = rotate_box(&pixel_box, rotation, 5, 3);
            let marked = rotated.get_pixel(b.x0 as u32, b.y0 as u32);
            assert_eq!(marked[0], 255, "rotation {:?} moved pixel to {:?}", rotation, b);
            assert!((b.width() - 1.0).abs() < 1e-6 && (b.height() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rotate_upright_dimensions() {
        let img = RgbaImage::new(64, 32);
        assert_eq!(rotate_upright(&img, Rotation::Deg90).dimensions(), (32, 64));
        assert_eq!(rotate_upright(&img, Rotation::Deg180).dimensions(), (64, 32));
    }

    #[test]
    fn test_resize_for_model_scale_factors() {
        let img = RgbaImage::new(600, 300);
        let (resized, sx, sy) = resize_for_model(&img, 300, 300);
        assert_eq!(resized.dimensions(), (300, 300));
        assert!((sx - 2.0).abs() < 1e-6);
        assert!((sy - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_layouts() {
        let mut rgb = RgbImage::new(4, 2);
        rgb.put_pixel(3, 1, image::Rgb([255, 128, 0]));

        let nchw = to_nchw_f32(&rgb);
        assert_eq!(nchw.dim(), (1, 3, 2, 4));
        assert!((nchw[[0, 0, 1, 3]] - 1.0).abs() < 1e-6);
        assert!((nchw[[0, 1, 1, 3]] - 128.0 / 255.0).abs() < 1e-6);

        let nhwc = to_nhwc_u8(&rgb);
        assert_eq!(nhwc.dim(), (1, 2, 4, 3));
        assert_eq!(nhwc[[0, 1, 3, 1]], 128);
    }
}

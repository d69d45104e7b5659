//! Face cropping for expression inference.
//!
//! Cuts a detected face out of the frame, clamped to the frame bounds, and
//! resizes it to the classifier's square input.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// Faces smaller than this on either side are not worth classifying.
const MIN_CROP_SIDE: u32 = 8;

#[derive(Error, Debug, PartialEq)]
pub enum CropError {
    #[error("face box lies outside the frame")]
    OutOfBounds,
    #[error("face box too small after clamping: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("invalid face box: non-finite coordinates")]
    NonFinite,
}

/// Integer pixel rectangle clamped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

fn clamp_to_frame(bbox: &BoundingBox, frame_w: u32, frame_h: u32) -> Result<PixelRect, CropError> {
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(CropError::NonFinite);
    }

    let x0 = bbox.x.floor().max(0.0);
    let y0 = bbox.y.floor().max(0.0);
    let x1 = (bbox.x + bbox.width).ceil().min(frame_w as f32);
    let y1 = (bbox.y + bbox.height).ceil().min(frame_h as f32);

    if x1 <= x0 || y1 <= y0 {
        return Err(CropError::OutOfBounds);
    }

    let rect = PixelRect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    };
    if rect.width < MIN_CROP_SIDE || rect.height < MIN_CROP_SIDE {
        return Err(CropError::TooSmall {
            width: rect.width,
            height: rect.height,
        });
    }
    Ok(rect)
}

/// Crop `bbox` out of `frame` and resize it to `size`×`size`.
pub fn crop_face(frame: &RgbImage, bbox: &BoundingBox, size: u32) -> Result<RgbImage, CropError> {
    let rect = clamp_to_frame(bbox, frame.width(), frame.height())?;
    let region = imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image();
    Ok(imageops::resize(&region, size, size, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let face = crop_face(&frame, &bbox(100.0, 100.0, 80.0, 120.0), 224).unwrap();
        assert_eq!(face.dimensions(), (224, 224));
    }

    #[test]
    fn test_crop_clamps_partial_overlap() {
        let frame = RgbImage::new(100, 100);
        let rect = clamp_to_frame(&bbox(-20.0, 90.0, 50.0, 50.0), 100, 100);
        // Bottom strip is only 10px tall after clamping → still usable.
        assert_eq!(rect, Ok(PixelRect { x: 0, y: 90, width: 30, height: 10 }));
        assert!(crop_face(&frame, &bbox(-20.0, 90.0, 50.0, 50.0), 64).is_ok());
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = RgbImage::new(100, 100);
        let err = crop_face(&frame, &bbox(150.0, 150.0, 20.0, 20.0), 64).unwrap_err();
        assert_eq!(err, CropError::OutOfBounds);
    }

    #[test]
    fn test_crop_too_small() {
        let frame = RgbImage::new(100, 100);
        let err = crop_face(&frame, &bbox(10.0, 10.0, 3.0, 40.0), 64).unwrap_err();
        assert!(matches!(err, CropError::TooSmall { width: 3, .. }));
    }

    #[test]
    fn test_crop_non_finite() {
        let frame = RgbImage::new(100, 100);
        let err = crop_face(&frame, &bbox(f32::NAN, 0.0, 10.0, 10.0), 64).unwrap_err();
        assert_eq!(err, CropError::NonFinite);
    }

    #[test]
    fn test_crop_preserves_region_content() {
        // Left half red, right half blue; cropping the right half stays blue.
        let frame = RgbImage::from_fn(100, 50, |x, _| {
            if x < 50 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        });
        let face = crop_face(&frame, &bbox(60.0, 10.0, 30.0, 30.0), 16).unwrap();
        assert!(face.pixels().all(|p| p.0[0] < 5 && p.0[2] > 250));
    }
}

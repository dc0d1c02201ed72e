//! Frame pipeline: optional transform, then JPEG encode.
//!
//! Both steps are pure and accept any 8-bit image the devices produce.
//! Operations run in a fixed order: grayscale, threshold, rotation, flips,
//! brightness/contrast.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, ImageBuffer, Pixel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-stream transform options. Everything off by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Convert to single-channel luminance.
    pub grayscale: bool,
    /// Binarize each channel against `threshold_value`.
    pub threshold: bool,
    /// Values strictly above this become 255, the rest 0.
    pub threshold_value: u8,
    /// Rotation about the image center in degrees, counter-clockwise.
    /// The output keeps the input size; uncovered pixels are black.
    pub rotation: f32,
    /// Mirror left-right.
    pub flip_horizontal: bool,
    /// Mirror top-bottom.
    pub flip_vertical: bool,
    /// Offset added after contrast scaling.
    pub brightness: f32,
    /// Gain applied to each channel.
    pub contrast: f32,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            grayscale: false,
            threshold: false,
            threshold_value: 128,
            rotation: 0.0,
            flip_horizontal: false,
            flip_vertical: false,
            brightness: 0.0,
            contrast: 1.0,
        }
    }
}

impl ProcessingOptions {
    /// True when applying these options leaves the frame unchanged.
    pub fn is_identity(&self) -> bool {
        !self.grayscale
            && !self.threshold
            && !self.rotates()
            && !self.flip_horizontal
            && !self.flip_vertical
            && !self.adjusts_levels()
    }

    fn rotates(&self) -> bool {
        self.rotation.rem_euclid(360.0) != 0.0
    }

    fn adjusts_levels(&self) -> bool {
        self.brightness != 0.0 || self.contrast != 1.0
    }
}

/// Encoding failures. The streaming loop drops the frame on any of these.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// Zero-sized frame.
    #[error("Cannot encode an empty {0}x{1} frame")]
    Empty(u32, u32),
    /// Encoder failure.
    #[error("JPEG encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Applies `options` to `image`.
pub fn apply(image: DynamicImage, options: &ProcessingOptions) -> DynamicImage {
    if options.is_identity() {
        return image;
    }
    match image {
        DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(transform(gray, options)),
        other if options.grayscale => {
            DynamicImage::ImageLuma8(transform(other.to_luma8(), options))
        }
        other => DynamicImage::ImageRgb8(transform(other.to_rgb8(), options)),
    }
}

fn transform<P>(
    mut img: ImageBuffer<P, Vec<u8>>,
    options: &ProcessingOptions,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    if options.threshold {
        let t = options.threshold_value;
        for v in img.iter_mut() {
            *v = if *v > t { 255 } else { 0 };
        }
    }

    if options.rotates() {
        img = rotate_about_center(&img, options.rotation);
    }

    if options.flip_horizontal {
        imageops::flip_horizontal_in_place(&mut img);
    }
    if options.flip_vertical {
        imageops::flip_vertical_in_place(&mut img);
    }

    if options.adjusts_levels() {
        let (alpha, beta) = (options.contrast, options.brightness);
        for v in img.iter_mut() {
            *v = (alpha * f32::from(*v) + beta).abs().round().min(255.0) as u8;
        }
    }

    img
}

/// Nearest-neighbour rotation that keeps the canvas size.
fn rotate_about_center<P>(img: &ImageBuffer<P, Vec<u8>>, degrees: f32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = img.dimensions();
    let (cx, cy) = ((w / 2) as f32, (h / 2) as f32);
    let (sin, cos) = degrees.to_radians().sin_cos();

    let mut out = ImageBuffer::<P, Vec<u8>>::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cos * dx - sin * dy + cx).round();
        let sy = (sin * dx + cos * dy + cy).round();
        if sx >= 0.0 && sy >= 0.0 && (sx as u32) < w && (sy as u32) < h {
            *px = *img.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}

/// Encodes `image` as baseline JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return Err(EncodeError::Empty(w, h));
    }

    let mut out = Vec::with_capacity((w * h / 4) as usize);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    match image {
        DynamicImage::ImageLuma8(gray) => encoder.encode_image(gray)?,
        DynamicImage::ImageRgb8(rgb) => encoder.encode_image(rgb)?,
        DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_) => encoder.encode_image(&image.to_luma8())?,
        other => encoder.encode_image(&other.to_rgb8())?,
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn marked(w: u32, h: u32, at: (u32, u32)) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        img.put_pixel(at.0, at.1, Luma([200]));
        img
    }

    #[test]
    fn identity_returns_input() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])));
        let out = apply(img.clone(), &ProcessingOptions::default());
        assert_eq!(out, img);
    }

    #[test]
    fn grayscale_drops_color() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([255, 0, 0])));
        let opts = ProcessingOptions {
            grayscale: true,
            ..Default::default()
        };
        let out = apply(img, &opts);
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
        assert_eq!((out.width(), out.height()), (4, 2));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let mut img = GrayImage::new(3, 1);
        img.put_pixel(0, 0, Luma([128]));
        img.put_pixel(1, 0, Luma([129]));
        img.put_pixel(2, 0, Luma([10]));
        let opts = ProcessingOptions {
            threshold: true,
            ..Default::default()
        };
        let out = apply(DynamicImage::ImageLuma8(img), &opts).to_luma8();
        assert_eq!(out.into_raw(), vec![0, 255, 0]);
    }

    #[test]
    fn rotation_is_counter_clockwise_and_keeps_size() {
        let img = DynamicImage::ImageLuma8(marked(3, 3, (2, 1)));
        let opts = ProcessingOptions {
            rotation: 90.0,
            ..Default::default()
        };
        let out = apply(img, &opts).to_luma8();
        assert_eq!(out.dimensions(), (3, 3));
        assert_eq!(out.get_pixel(1, 0).0, [200]);
        assert_eq!(out.get_pixel(2, 1).0, [0]);
    }

    #[test]
    fn full_turn_is_identity() {
        let opts = ProcessingOptions {
            rotation: 360.0,
            ..Default::default()
        };
        assert!(opts.is_identity());
    }

    #[test]
    fn flips() {
        let img = DynamicImage::ImageLuma8(marked(2, 2, (0, 0)));
        let opts = ProcessingOptions {
            flip_horizontal: true,
            flip_vertical: true,
            ..Default::default()
        };
        let out = apply(img, &opts).to_luma8();
        assert_eq!(out.get_pixel(1, 1).0, [200]);
        assert_eq!(out.get_pixel(0, 0).0, [0]);
    }

    #[test]
    fn levels_saturate() {
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, Luma([100]));
        img.put_pixel(1, 0, Luma([200]));
        let opts = ProcessingOptions {
            contrast: 2.0,
            brightness: -50.0,
            ..Default::default()
        };
        let out = apply(DynamicImage::ImageLuma8(img), &opts).to_luma8();
        assert_eq!(out.into_raw(), vec![150, 255]);
    }

    #[test]
    fn options_deserialize_partially() {
        let opts: ProcessingOptions =
            serde_json::from_str(r#"{"rotation": 45, "grayscale": true}"#).unwrap();
        assert_eq!(opts.rotation, 45.0);
        assert!(opts.grayscale);
        assert_eq!(opts.threshold_value, 128);
        assert_eq!(opts.contrast, 1.0);
    }

    #[test]
    fn encodes_decodable_jpeg() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([10, 200, 30])));
        let bytes = encode_jpeg(&img, 90).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));

        let gray = DynamicImage::ImageLuma8(GrayImage::new(8, 8));
        assert!(encode_jpeg(&gray, 50).is_ok());
    }

    #[test]
    fn empty_frame_is_an_error() {
        let img = DynamicImage::new_rgb8(0, 0);
        assert!(matches!(encode_jpeg(&img, 90), Err(EncodeError::Empty(0, 0))));
    }
}

//! Raw buffer → image conversion shared by all variants.

use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage};
use tracing::debug;

use super::backend::{RawFrame, RawPixelFormat};

/// Decodes a grabbed buffer into an image. `None` if the buffer does not match
/// its declared geometry.
pub(crate) fn decode_raw(frame: RawFrame) -> Option<DynamicImage> {
    let RawFrame {
        width,
        height,
        pixel_format,
        mut data,
    } = frame;
    let pixels = (width as usize).checked_mul(height as usize)?;
    if pixels == 0 {
        return None;
    }

    match pixel_format {
        RawPixelFormat::Mono8 => mono(width, height, data),
        RawPixelFormat::Rgb8 => rgb(width, height, data),
        RawPixelFormat::Bgr8 => {
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            rgb(width, height, data)
        }
        RawPixelFormat::Other(code) => match data.len() / pixels {
            1 => mono(width, height, data),
            3 => rgb(width, height, data),
            channels => {
                debug!(code, channels, "Undecodable pixel format");
                None
            }
        },
    }
}

fn mono(width: u32, height: u32, mut data: Vec<u8>) -> Option<DynamicImage> {
    data.truncate(width as usize * height as usize);
    GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8)
}

fn rgb(width: u32, height: u32, mut data: Vec<u8>) -> Option<DynamicImage> {
    data.truncate(width as usize * height as usize * 3);
    RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8)
}

/// Scales `image` to fit inside `display` while keeping its aspect ratio.
pub(crate) fn fit_to_display(image: DynamicImage, display: (u32, u32)) -> DynamicImage {
    let (display_w, display_h) = display;
    let (w, h) = (image.width(), image.height());
    if display_w == 0 || display_h == 0 || (w == display_w && h == display_h) {
        return image;
    }

    let aspect = w as f64 / h as f64;
    let target_aspect = display_w as f64 / display_h as f64;
    let (new_w, new_h) = if aspect > target_aspect {
        (display_w, (display_w as f64 / aspect) as u32)
    } else {
        ((display_h as f64 * aspect) as u32, display_h)
    };

    image.resize_exact(new_w.max(1), new_h.max(1), FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(width: u32, height: u32, pixel_format: RawPixelFormat, data: Vec<u8>) -> RawFrame {
        RawFrame {
            width,
            height,
            pixel_format,
            data,
        }
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let img = decode_raw(raw(1, 1, RawPixelFormat::Bgr8, vec![10, 20, 30])).unwrap();
        assert_eq!(img.to_rgb8().get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn unknown_format_falls_back_to_channel_count() {
        let img = decode_raw(raw(2, 2, RawPixelFormat::Other(0x0210_0032), vec![0; 12])).unwrap();
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));

        let img = decode_raw(raw(2, 2, RawPixelFormat::Other(7), vec![0; 4])).unwrap();
        assert!(matches!(img, DynamicImage::ImageLuma8(_)));

        assert!(decode_raw(raw(2, 2, RawPixelFormat::Other(7), vec![0; 8])).is_none());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(decode_raw(raw(4, 4, RawPixelFormat::Mono8, vec![0; 3])).is_none());
        assert!(decode_raw(raw(0, 4, RawPixelFormat::Mono8, vec![])).is_none());
    }

    #[test]
    fn fit_keeps_aspect_ratio() {
        let img = DynamicImage::new_rgb8(1920, 1080);
        let fitted = fit_to_display(img, (640, 640));
        assert_eq!((fitted.width(), fitted.height()), (640, 360));

        let img = DynamicImage::new_rgb8(1000, 1000);
        let fitted = fit_to_display(img, (800, 400));
        assert_eq!((fitted.width(), fitted.height()), (400, 400));
    }
}

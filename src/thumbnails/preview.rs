//! Social preview composition: the photo crop-filled to the standard preview
//! frame, with the place name drawn in the lower-left corner.

use super::ThumbnailError;
use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, Rgba, RgbaImage, imageops::FilterType};
use imageproc::drawing::{draw_text_mut, text_size};
use std::path::Path;
use tracing::{debug, warn};

pub const PREVIEW_WIDTH: u32 = 1200;
pub const PREVIEW_HEIGHT: u32 = 630;

const TITLE_SCALE: f32 = 48.0;
const TITLE_PADDING: u32 = 24;

/// Build the preview image. The text overlay needs a configured font file; if
/// none is available the bare composition is used, which is not an error.
pub fn compose_preview(img: &DynamicImage, title: &str, font_path: Option<&Path>) -> DynamicImage {
    let canvas = img.resize_to_fill(PREVIEW_WIDTH, PREVIEW_HEIGHT, FilterType::Lanczos3);

    let Some(font_path) = font_path.filter(|p| p.exists()) else {
        debug!("no overlay font available, producing preview without title");
        return canvas;
    };

    match overlay_title(&canvas, title, font_path) {
        Ok(composed) => composed,
        Err(e) => {
            warn!("preview title overlay failed, using bare image: {}", e);
            canvas
        }
    }
}

fn overlay_title(
    canvas: &DynamicImage,
    title: &str,
    font_path: &Path,
) -> Result<DynamicImage, ThumbnailError> {
    let font_data = std::fs::read(font_path)?;
    let font =
        FontVec::try_from_vec(font_data).map_err(|e| ThumbnailError::Font(e.to_string()))?;

    let mut rgba = canvas.to_rgba8();
    let scale = PxScale::from(TITLE_SCALE);
    let (text_width, text_height) = text_size(scale, &font, title);

    let x = TITLE_PADDING as i32;
    let y = rgba.height().saturating_sub(TITLE_PADDING + text_height) as i32;

    let color = contrast_color(&rgba, x as u32, y as u32, text_width, text_height);
    draw_text_mut(&mut rgba, color, x, y, scale, &font, title);

    Ok(DynamicImage::ImageRgb8(
        DynamicImage::ImageRgba8(rgba).to_rgb8(),
    ))
}

/// White text over dark regions, black over light ones, judged by the mean
/// brightness of the area the text will cover.
fn contrast_color(image: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> Rgba<u8> {
    let x_end = (x + width).min(image.width());
    let y_end = (y + height).min(image.height());

    let mut sum = 0u64;
    let mut count = 0u64;
    for py in y..y_end {
        for px in x..x_end {
            let p = image.get_pixel(px, py);
            sum += (p[0] as u64 + p[1] as u64 + p[2] as u64) / 3;
            count += 1;
        }
    }

    let mean = if count == 0 { 128 } else { sum / count };
    if mean < 128 {
        Rgba([255, 255, 255, 255])
    } else {
        Rgba([0, 0, 0, 255])
    }
}

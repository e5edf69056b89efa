//! Shared plumbing for drawing with plotters into an in-memory RGB buffer.

use image::{Rgb, RgbImage};
use plotters::prelude::*;
use plotters::style::{register_font, FontStyle};
use std::sync::OnceLock;

use crate::core::errors::{Result, ScFeatError};

/// Font family used for all text
pub const FONT: &str = "sans-serif";

static FONT_BYTES: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");
static FONT_REGISTERED: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Register the bundled font with plotters
///
/// Safe to call repeatedly; the font is only registered once per process.
pub fn register_fonts() -> Result<()> {
    FONT_REGISTERED
        .get_or_init(|| {
            register_font(FONT, FontStyle::Normal, FONT_BYTES).map_err(|_| "invalid font data".to_string())
        })
        .clone()
        .map_err(ScFeatError::Plot)
}

/// Turn any plotters error into a crate error
pub fn plot_err<E: std::fmt::Display>(err: E) -> ScFeatError {
    ScFeatError::Plot(err.to_string())
}

/// Convert an image pixel colour into a plotters colour
#[inline]
pub fn to_rgb(c: Rgb<u8>) -> RGBColor {
    RGBColor(c.0[0], c.0[1], c.0[2])
}

/// Allocate a white RGB buffer for an image of the given size
pub fn new_buffer(width: u32, height: u32) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(ScFeatError::InvalidParameter(format!(
            "Cannot draw a {} x {} image",
            width, height
        )));
    }
    Ok(vec![255; width as usize * height as usize * 3])
}

/// Wrap a drawn RGB buffer into an image
pub fn buffer_to_image(buf: Vec<u8>, width: u32, height: u32) -> Result<RgbImage> {
    RgbImage::from_raw(width, height, buf)
        .ok_or_else(|| ScFeatError::Plot("Drawing buffer does not match the image size".into()))
}

/// Padded range of finite values
///
/// ### Params
///
/// * `values` - The data values.
///
/// ### Returns
///
/// `(lo, hi)` with 5% padding on both sides. Constant data are widened by
/// 0.5 and data without finite values give `(0, 1)`.
pub fn data_range(values: &[f64]) -> (f64, f64) {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo < 1e-12 {
        return (lo - 0.5, hi + 0.5);
    }
    let pad = 0.05 * (hi - lo);
    (lo - pad, hi + pad)
}

///////////
// Tests //
///////////

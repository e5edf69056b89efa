//! Colour helpers for the plots.

use image::Rgb;
use palette::{Hsl, IntoColor, LinSrgb, Mix, Srgb};

/// Background of all plots
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
/// Axis lines
pub const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
/// Default point colour
pub const POINT: Rgb<u8> = Rgb([120, 120, 120]);
/// Highlighted points
pub const HIGHLIGHT: Rgb<u8> = Rgb([214, 39, 40]);
/// Fitted curves
pub const CURVE: Rgb<u8> = Rgb([31, 119, 180]);

/// Convert a palette colour into an image pixel
fn to_pixel(c: Srgb) -> Rgb<u8> {
    let c: Srgb<u8> = c.into_format();
    Rgb([c.red, c.green, c.blue])
}

/// Generates `n` visually distinct colours using evenly spaced hues
///
/// ### Params
///
/// * `n` - Number of colours.
///
/// ### Returns
///
/// Vector of `n` colours.
pub fn generate_palette(n: usize) -> Vec<Rgb<u8>> {
    (0..n)
        .map(|i| {
            let hue = (i as f32 / n as f32) * 360.0;
            let hsl = Hsl::new(hue, 0.75, 0.55);
            let rgb: Srgb = hsl.into_color();
            to_pixel(rgb)
        })
        .collect()
}

/// Diverging blue-white-red colour for a value in `[-limit, limit]`
///
/// Values outside the range are clamped, non-finite values map to white.
///
/// ### Params
///
/// * `value` - The value to colour.
/// * `limit` - Absolute value that maps to full saturation.
///
/// ### Returns
///
/// The colour.
pub fn diverging(value: f64, limit: f64) -> Rgb<u8> {
    if !value.is_finite() || limit <= 0.0 {
        return WHITE;
    }
    let t = (value / limit).clamp(-1.0, 1.0) as f32;
    let white: LinSrgb<f32> = LinSrgb::new(1.0, 1.0, 1.0);
    let end: LinSrgb<f32> = if t < 0.0 {
        Srgb::new(0.13f32, 0.40, 0.67).into_linear()
    } else {
        Srgb::new(0.70f32, 0.09, 0.17).into_linear()
    };
    let mixed = white.mix(end, t.abs());
    to_pixel(Srgb::from_linear(mixed))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_distinct() {
        let pal = generate_palette(4);
        assert_eq!(pal.len(), 4);
        for i in 0..4 {
            for j in (i + 1)..4 {
                assert_ne!(pal[i], pal[j]);
            }
        }
        assert!(generate_palette(0).is_empty());
    }

    #[test]
    fn test_diverging() {
        assert_eq!(diverging(0.0, 3.0), WHITE);
        assert_eq!(diverging(f64::NAN, 3.0), WHITE);
        let low = diverging(-3.0, 3.0);
        let high = diverging(3.0, 3.0);
        assert!(low.0[2] > low.0[0]);
        assert!(high.0[0] > high.0[2]);
        assert_eq!(diverging(10.0, 3.0), high);
    }
}

use image::RgbImage;
use plotters::prelude::*;
use rustc_hash::FxHashSet;
use std::path::Path;

use crate::core::errors::{Result, ScFeatError};
use crate::plotting::backend::{
    buffer_to_image, data_range, new_buffer, plot_err, register_fonts, to_rgb, FONT,
};
use crate::plotting::colour::{AXIS, CURVE, HIGHLIGHT, POINT, WHITE};
use crate::single_cell::feature_selection::brennecke::BrenneckeResult;
use crate::single_cell::feature_selection::m3drop::{mm_dropout, M3DropResult};
use crate::single_cell::feature_selection::nbumi::{DropoutComparison, NbumiFit};
use crate::single_cell::feature_selection::pca::PcaFsResult;
use crate::single_cell::feature_selection::FeatureTable;

/// Number of points used to draw fitted curves
const CURVE_POINTS: usize = 200;
/// Radius of the scatter points in pixels
const POINT_RADIUS: u32 = 2;

////////////////
// Structures //
////////////////

/// Scatter plot with an optional highlight set and fitted curve
///
/// ### Fields
///
/// * `x` - x coordinates.
/// * `y` - y coordinates.
/// * `highlight` - Optional mask; highlighted points are drawn on top in a
///   different colour.
/// * `curve` - Optional curve in data coordinates.
/// * `log_x` - Plot `log10(x)`; non-positive values are dropped.
/// * `log_y` - Plot `log10(y)`; non-positive values are dropped.
/// * `title` - Caption above the plot.
/// * `x_label` - Description of the x axis, without the log prefix.
/// * `y_label` - Description of the y axis, without the log prefix.
/// * `width` - Width of the image in pixels.
/// * `height` - Height of the image in pixels.
#[derive(Clone, Debug)]
pub struct ScatterPlot {
    x: Vec<f64>,
    y: Vec<f64>,
    highlight: Option<Vec<bool>>,
    curve: Option<Vec<(f64, f64)>>,
    log_x: bool,
    log_y: bool,
    title: String,
    x_label: String,
    y_label: String,
    width: u32,
    height: u32,
}

/// Apply the optional log10 transformation
#[inline]
fn axis_value(v: f64, log: bool) -> f64 {
    if !log {
        v
    } else if v > 0.0 {
        v.log10()
    } else {
        f64::NAN
    }
}

/// Axis description, prefixed on log axes
fn axis_desc(label: &str, log: bool) -> String {
    if log {
        format!("log10 {}", label)
    } else {
        label.to_string()
    }
}

impl ScatterPlot {
    /// Generate a new scatter plot
    ///
    /// ### Params
    ///
    /// * `x` - x coordinates.
    /// * `y` - y coordinates.
    ///
    /// ### Returns
    ///
    /// The plot with default size 640 x 480 and axes labelled `x` and `y`.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "Scatter plot with {} x and {} y values",
                x.len(),
                y.len()
            )));
        }
        Ok(Self {
            x,
            y,
            highlight: None,
            curve: None,
            log_x: false,
            log_y: false,
            title: String::new(),
            x_label: "x".to_string(),
            y_label: "y".to_string(),
            width: 640,
            height: 480,
        })
    }

    /// Use a log10 x axis
    pub fn log_x(mut self) -> Self {
        self.log_x = true;
        self
    }

    /// Use a log10 y axis
    pub fn log_y(mut self) -> Self {
        self.log_y = true;
        self
    }

    /// Image size in pixels
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Caption and axis descriptions
    ///
    /// Log axes get a `log10` prefix when rendered.
    pub fn labels(mut self, title: &str, x_label: &str, y_label: &str) -> Self {
        self.title = title.to_string();
        self.x_label = x_label.to_string();
        self.y_label = y_label.to_string();
        self
    }

    /// Highlight a subset of the points
    pub fn highlight(mut self, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != self.x.len() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "Highlight mask of length {} for {} points",
                mask.len(),
                self.x.len()
            )));
        }
        self.highlight = Some(mask);
        Ok(self)
    }

    /// Add a curve (in data coordinates, drawn in order)
    pub fn curve(mut self, points: Vec<(f64, f64)>) -> Self {
        self.curve = Some(points);
        self
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Does the plot have no points
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Description of the x axis as rendered
    pub fn x_desc(&self) -> String {
        axis_desc(&self.x_label, self.log_x)
    }

    /// Description of the y axis as rendered
    pub fn y_desc(&self) -> String {
        axis_desc(&self.y_label, self.log_y)
    }

    /// Render the plot
    ///
    /// ### Returns
    ///
    /// The RGB image with caption, labelled axes, grid, points and curve.
    pub fn render(&self) -> Result<RgbImage> {
        register_fonts()?;

        let points: Vec<(f64, f64, bool)> = (0..self.x.len())
            .map(|i| {
                (
                    axis_value(self.x[i], self.log_x),
                    axis_value(self.y[i], self.log_y),
                    self.highlight.as_ref().map(|m| m[i]).unwrap_or(false),
                )
            })
            .filter(|(a, b, _)| a.is_finite() && b.is_finite())
            .collect();
        let curve: Vec<(f64, f64)> = self
            .curve
            .as_ref()
            .map(|c| {
                c.iter()
                    .map(|&(a, b)| (axis_value(a, self.log_x), axis_value(b, self.log_y)))
                    .filter(|(a, b)| a.is_finite() && b.is_finite())
                    .collect()
            })
            .unwrap_or_default();

        // axis ranges follow the points; the curve only sets them if there
        // are no points
        let (xs, ys): (Vec<f64>, Vec<f64>) = if points.is_empty() {
            curve.iter().copied().unzip()
        } else {
            points.iter().map(|&(a, b, _)| (a, b)).unzip()
        };
        let (x_lo, x_hi) = data_range(&xs);
        let (y_lo, y_hi) = data_range(&ys);

        let mut buf = new_buffer(self.width, self.height)?;
        {
            let root = BitMapBackend::with_buffer(&mut buf, (self.width, self.height))
                .into_drawing_area();
            root.fill(&to_rgb(WHITE)).map_err(plot_err)?;

            let mut chart = ChartBuilder::on(&root)
                .caption(&self.title, (FONT, 18))
                .margin(10)
                .x_label_area_size(42)
                .y_label_area_size(58)
                .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)
                .map_err(plot_err)?;

            chart
                .configure_mesh()
                .x_labels(6)
                .y_labels(6)
                .x_desc(self.x_desc())
                .y_desc(self.y_desc())
                .label_style((FONT, 12))
                .axis_desc_style((FONT, 14))
                .axis_style(to_rgb(AXIS))
                .draw()
                .map_err(plot_err)?;

            let point_style = to_rgb(POINT).filled();
            let hl_style = to_rgb(HIGHLIGHT).filled();
            chart
                .draw_series(
                    points
                        .iter()
                        .filter(|p| !p.2)
                        .map(|&(a, b, _)| Circle::new((a, b), POINT_RADIUS, point_style)),
                )
                .map_err(plot_err)?;
            chart
                .draw_series(
                    points
                        .iter()
                        .filter(|p| p.2)
                        .map(|&(a, b, _)| Circle::new((a, b), POINT_RADIUS, hl_style)),
                )
                .map_err(plot_err)?;
            if curve.len() > 1 {
                chart
                    .draw_series(LineSeries::new(curve, to_rgb(CURVE).stroke_width(2)))
                    .map_err(plot_err)?;
            }

            root.present().map_err(plot_err)?;
        }

        buffer_to_image(buf, self.width, self.height)
    }

    /// Render the plot and write it as PNG
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.render()?.save(path)?;
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// Evenly spaced points on a log scale between two positive values
fn log_grid(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    if !(lo > 0.0 && hi > lo && n > 1) {
        return Vec::new();
    }
    let (a, b) = (lo.ln(), hi.ln());
    (0..n)
        .map(|k| (a + (b - a) * k as f64 / (n - 1) as f64).exp())
        .collect()
}

/// Smallest and largest positive finite value
fn positive_bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .filter(|v| v.is_finite() && **v > 0.0)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Matrix row indices of the selected genes of a table
fn selected_indices(table: &FeatureTable) -> FxHashSet<usize> {
    table
        .rows
        .iter()
        .filter(|r| r.selected)
        .map(|r| r.gene_idx)
        .collect()
}

//////////////////////
// Diagnostic plots //
//////////////////////

/// Mean against CV² with the technical noise fit
///
/// ### Params
///
/// * `res` - The `BrenneckeResult`.
///
/// ### Returns
///
/// Log-log scatter plot with the highly variable genes highlighted.
pub fn brennecke_plot(res: &BrenneckeResult) -> Result<ScatterPlot> {
    let selected = selected_indices(&res.table);
    let mask = (0..res.means.len()).map(|i| selected.contains(&i)).collect();
    let (lo, hi) = positive_bounds(&res.means);
    let curve = log_grid(lo, hi, CURVE_POINTS)
        .into_iter()
        .map(|m| (m, res.expected_cv2(m)))
        .collect();

    Ok(ScatterPlot::new(res.means.clone(), res.cv2.clone())?
        .log_x()
        .log_y()
        .labels("Technical noise fit", "mean expression", "CV²")
        .highlight(mask)?
        .curve(curve))
}

/// Mean expression against dropout rate with the Michaelis-Menten fit
///
/// ### Params
///
/// * `res` - The `M3DropResult`.
///
/// ### Returns
///
/// Scatter plot on a log x axis with the selected genes highlighted.
pub fn m3drop_plot(res: &M3DropResult) -> Result<ScatterPlot> {
    let selected = selected_indices(&res.table);
    let mask = res
        .stats
        .gene_idx
        .iter()
        .map(|i| selected.contains(i))
        .collect();
    let (lo, hi) = positive_bounds(&res.stats.s);
    let curve = log_grid(lo, hi, CURVE_POINTS)
        .into_iter()
        .map(|s| (s, mm_dropout(res.fit.k, s)))
        .collect();

    Ok(ScatterPlot::new(res.stats.s.clone(), res.stats.p.clone())?
        .log_x()
        .labels("Michaelis-Menten dropout fit", "mean expression", "dropout rate")
        .highlight(mask)?
        .curve(curve))
}

/// Mean count against observed dropout rate with the expected rate of the
/// depth adjusted model
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
/// * `cmp` - The `DropoutComparison`.
/// * `table` - Optional selection to highlight.
///
/// ### Returns
///
/// Scatter plot on a log x axis.
pub fn nbumi_plot(
    fit: &NbumiFit,
    cmp: &DropoutComparison,
    table: Option<&FeatureTable>,
) -> Result<ScatterPlot> {
    let means = fit.means();
    let mut order: Vec<usize> = (0..means.len()).collect();
    order.sort_by(|&a, &b| means[a].total_cmp(&means[b]));
    let curve = order.iter().map(|&j| (means[j], cmp.expected[j])).collect();

    let plot = ScatterPlot::new(means, cmp.observed.clone())?
        .log_x()
        .labels("Depth adjusted negative binomial", "mean count", "dropout rate")
        .curve(curve);
    match table {
        Some(t) => {
            let selected = selected_indices(t);
            let mask = fit.gene_idx.iter().map(|i| selected.contains(i)).collect();
            plot.highlight(mask)
        }
        None => Ok(plot),
    }
}

/// Gene projections on the first two principal components
///
/// ### Params
///
/// * `res` - The `PcaFsResult` (needs at least two components).
/// * `highlight_top` - Number of best scoring genes to highlight.
///
/// ### Returns
///
/// The scatter plot.
pub fn pca_plot(res: &PcaFsResult, highlight_top: usize) -> Result<ScatterPlot> {
    if res.projections.ncols() < 2 {
        return Err(ScFeatError::InsufficientData(
            "PCA plot needs at least two components".into(),
        ));
    }
    let n = res.projections.nrows();
    let x: Vec<f64> = (0..n).map(|i| res.projections[(i, 0)]).collect();
    let y: Vec<f64> = (0..n).map(|i| res.projections[(i, 1)]).collect();
    let top: FxHashSet<usize> = res
        .table
        .rows
        .iter()
        .take(highlight_top)
        .map(|r| r.gene_idx)
        .collect();
    let mask = (0..n).map(|i| top.contains(&i)).collect();

    ScatterPlot::new(x, y)?
        .labels("Gene projections", "PC1", "PC2")
        .highlight(mask)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn is_red(p: &Rgb<u8>) -> bool {
        p.0[0] > 150 && p.0[1] < 110 && p.0[2] < 110
    }

    fn is_blue(p: &Rgb<u8>) -> bool {
        p.0[2] > 140 && p.0[0] < 110
    }

    fn is_dark(p: &Rgb<u8>) -> bool {
        p.0.iter().all(|&c| c < 100)
    }

    fn has_dark_rows(img: &RgbImage, rows: std::ops::Range<u32>) -> bool {
        rows.into_iter()
            .any(|y| (0..img.width()).any(|x| is_dark(img.get_pixel(x, y))))
    }

    #[test]
    fn test_scatter_render() {
        let plot = ScatterPlot::new(vec![1.0, 2.0, 3.0], vec![1.0, 4.0, 9.0])
            .unwrap()
            .size(400, 300)
            .labels("Squares", "value", "square")
            .highlight(vec![false, true, false])
            .unwrap()
            .curve(vec![(1.0, 1.0), (3.0, 9.0)]);
        let img = plot.render().unwrap();
        assert_eq!(img.dimensions(), (400, 300));
        assert!(img.pixels().any(is_red));
        assert!(img.pixels().any(is_blue));
        assert!(img.pixels().any(|p| *p == WHITE));
        // caption on top, axis description at the bottom
        assert!(has_dark_rows(&img, 0..28));
        assert!(has_dark_rows(&img, 260..295));
    }

    #[test]
    fn test_scatter_axis_descriptions() {
        let plot = ScatterPlot::new(vec![1.0], vec![1.0])
            .unwrap()
            .log_x()
            .labels("", "mean expression", "CV²");
        assert_eq!(plot.x_desc(), "log10 mean expression");
        assert_eq!(plot.y_desc(), "CV²");
    }

    #[test]
    fn test_scatter_log_axes_drop_non_positive() {
        let plot = ScatterPlot::new(vec![0.0, -1.0], vec![1.0, 1.0])
            .unwrap()
            .log_x()
            .highlight(vec![true, true])
            .unwrap()
            .size(300, 240);
        // nothing finite to plot still renders a frame
        let img = plot.render().unwrap();
        assert!(!img.pixels().any(is_red));
    }

    #[test]
    fn test_scatter_mismatch() {
        assert!(ScatterPlot::new(vec![1.0], vec![]).is_err());
        let plot = ScatterPlot::new(vec![1.0, 2.0], vec![1.0, 2.0]).unwrap();
        assert!(plot.highlight(vec![true]).is_err());
        let tiny = ScatterPlot::new(vec![1.0], vec![1.0]).unwrap().size(0, 10);
        assert!(tiny.render().is_err());
    }

    #[test]
    fn test_log_grid() {
        let g = log_grid(1.0, 100.0, 3);
        assert_eq!(g.len(), 3);
        assert!((g[1] - 10.0).abs() < 1e-9);
        assert!(log_grid(0.0, 1.0, 10).is_empty());
    }
}

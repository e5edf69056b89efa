use faer::Mat;
use image::RgbImage;
use plotters::prelude::*;
use std::path::Path;

use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::errors::{Result, ScFeatError};
use crate::plotting::backend::{
    buffer_to_image, new_buffer, plot_err, register_fonts, to_rgb, FONT,
};
use crate::plotting::colour::{diverging, generate_palette, AXIS, WHITE};

/// z-scores beyond this are clipped
const Z_LIMIT: f64 = 3.0;

/// Height of the label colour bar in pixels
const BAR_HEIGHT: u32 = 12;
/// Space reserved for the caption
const TITLE_HEIGHT: u32 = 30;
/// Space reserved for the group names below the tiles
const LEGEND_HEIGHT: u32 = 22;
/// Outer padding
const PAD: u32 = 10;
/// Gap between the label bar and the tiles
const GAP: u32 = 2;

////////////////
// Structures //
////////////////

/// Expression heatmap of a set of genes across labelled cells
///
/// ### Fields
///
/// * `z` - Clipped per-gene z-scores of `log2(x + 1)`; rows are genes in
///   display order, columns cells in display order.
/// * `gene_names` - Genes in display order.
/// * `cell_labels` - Label of every displayed cell.
/// * `groups` - Unique labels (colour bar order).
/// * `title` - Caption above the heatmap.
#[derive(Clone, Debug)]
pub struct Heatmap {
    pub z: Mat<f64>,
    pub gene_names: Vec<String>,
    pub cell_labels: Vec<String>,
    pub groups: Vec<String>,
    pub title: String,
}

impl Heatmap {
    /// Build the heatmap
    ///
    /// Cells are ordered by label, genes by the label group in which they
    /// have the highest mean (and by that mean within a group).
    ///
    /// ### Params
    ///
    /// * `matrix` - Expression, genes x cells.
    /// * `labels` - Cell labels.
    /// * `genes` - Genes to show; names missing from the matrix are ignored.
    ///
    /// ### Returns
    ///
    /// The `Heatmap`.
    pub fn new(matrix: &ExpressionMatrix, labels: &CellLabels, genes: &[String]) -> Result<Self> {
        labels.check_aligned(matrix)?;
        let index = matrix.gene_index();
        let rows: Vec<usize> = genes
            .iter()
            .filter_map(|g| index.get(g.as_str()).copied())
            .collect();
        if rows.is_empty() {
            return Err(ScFeatError::InsufficientData(
                "None of the heatmap genes are in the matrix".into(),
            ));
        }

        let (groups, membership) = labels.groups();
        let mut cell_order: Vec<usize> = (0..matrix.n_cells()).collect();
        cell_order.sort_by_key(|&j| membership[j]);
        let group_sizes: Vec<f64> = (0..groups.len())
            .map(|g| membership.iter().filter(|&&m| m == g).count() as f64)
            .collect();

        let m = matrix.view();
        // per gene: z-scores in cell order, best group, mean in best group
        let per_gene: Vec<(Vec<f64>, usize, f64)> = rows
            .iter()
            .map(|&i| {
                let logged: Vec<f64> = (0..matrix.n_cells())
                    .map(|j| (m[(i, j)] + 1.0).log2())
                    .collect();
                let n = logged.len() as f64;
                let mean = logged.iter().sum::<f64>() / n;
                let sd = if logged.len() > 1 {
                    (logged.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
                } else {
                    0.0
                };
                let z: Vec<f64> = cell_order
                    .iter()
                    .map(|&j| {
                        if sd > 1e-12 {
                            ((logged[j] - mean) / sd).clamp(-Z_LIMIT, Z_LIMIT)
                        } else {
                            0.0
                        }
                    })
                    .collect();

                let mut sums = vec![0.0; groups.len()];
                for (v, &g) in logged.iter().zip(membership.iter()) {
                    sums[g] += v;
                }
                let (best, best_mean) = sums
                    .iter()
                    .zip(group_sizes.iter())
                    .map(|(s, n)| s / n)
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (g, v)| {
                        if v > acc.1 {
                            (g, v)
                        } else {
                            acc
                        }
                    });
                (z, best, best_mean)
            })
            .collect();

        let mut gene_order: Vec<usize> = (0..rows.len()).collect();
        gene_order.sort_by(|&a, &b| {
            per_gene[a]
                .1
                .cmp(&per_gene[b].1)
                .then_with(|| per_gene[b].2.total_cmp(&per_gene[a].2))
        });

        let z = Mat::from_fn(rows.len(), cell_order.len(), |r, c| {
            per_gene[gene_order[r]].0[c]
        });
        let gene_names = gene_order
            .iter()
            .map(|&r| matrix.gene_names[rows[r]].clone())
            .collect();
        let cell_labels = cell_order
            .iter()
            .map(|&j| labels.labels[j].clone())
            .collect();

        Ok(Self {
            z,
            gene_names,
            cell_labels,
            groups,
            title: "Expression z-scores".to_string(),
        })
    }

    /// Set the caption
    pub fn titled(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// Image size for the given tile size
    pub fn dimensions(&self, cell_px: u32, gene_px: u32) -> (u32, u32) {
        let width = (self.z.ncols() as u32 * cell_px).max(200) + 2 * PAD;
        let height = TITLE_HEIGHT
            + BAR_HEIGHT
            + GAP
            + self.z.nrows() as u32 * gene_px
            + LEGEND_HEIGHT
            + PAD;
        (width, height)
    }

    /// Top left pixel of the first tile
    fn tile_origin(&self) -> (i32, i32) {
        (PAD as i32, (TITLE_HEIGHT + BAR_HEIGHT + GAP) as i32)
    }

    /// Render the heatmap
    ///
    /// ### Params
    ///
    /// * `cell_px` - Width of a cell column in pixels.
    /// * `gene_px` - Height of a gene row in pixels.
    ///
    /// ### Returns
    ///
    /// The RGB image: caption, a label colour bar, the z-score tiles and
    /// the group names below their block of cells.
    pub fn render(&self, cell_px: u32, gene_px: u32) -> Result<RgbImage> {
        if cell_px == 0 || gene_px == 0 {
            return Err(ScFeatError::InvalidParameter(
                "Heatmap tiles must be at least one pixel".into(),
            ));
        }
        crate::assert_ncols_len!(self.z, self.cell_labels);
        register_fonts()?;

        let (width, height) = self.dimensions(cell_px, gene_px);
        let (x0, y0) = self.tile_origin();
        let (cw, gh) = (cell_px as i32, gene_px as i32);
        let palette = generate_palette(self.groups.len());
        let group_of = |label: &str| self.groups.iter().position(|g| g == label);

        let mut buf = new_buffer(width, height)?;
        {
            let root = BitMapBackend::with_buffer(&mut buf, (width, height)).into_drawing_area();
            root.fill(&to_rgb(WHITE)).map_err(plot_err)?;
            root.draw(&Text::new(
                self.title.clone(),
                (PAD as i32, 6),
                (FONT, 16).into_font().color(&to_rgb(AXIS)),
            ))
            .map_err(plot_err)?;

            let bar_top = TITLE_HEIGHT as i32;
            for (c, label) in self.cell_labels.iter().enumerate() {
                let colour = group_of(label).map(|g| palette[g]).unwrap_or(WHITE);
                let x = x0 + c as i32 * cw;
                root.draw(&Rectangle::new(
                    [(x, bar_top), (x + cw - 1, bar_top + BAR_HEIGHT as i32 - 1)],
                    to_rgb(colour).filled(),
                ))
                .map_err(plot_err)?;
            }

            for r in 0..self.z.nrows() {
                let y = y0 + r as i32 * gh;
                for c in 0..self.z.ncols() {
                    let x = x0 + c as i32 * cw;
                    root.draw(&Rectangle::new(
                        [(x, y), (x + cw - 1, y + gh - 1)],
                        to_rgb(diverging(self.z[(r, c)], Z_LIMIT)).filled(),
                    ))
                    .map_err(plot_err)?;
                }
            }

            // cells are sorted by label, so every group is one block
            let legend_top = y0 + self.z.nrows() as i32 * gh + 4;
            for (g, group) in self.groups.iter().enumerate() {
                if let Some(first) = self.cell_labels.iter().position(|l| l == group) {
                    root.draw(&Text::new(
                        group.clone(),
                        (x0 + first as i32 * cw, legend_top),
                        (FONT, 12).into_font().color(&to_rgb(palette[g])),
                    ))
                    .map_err(plot_err)?;
                }
            }

            root.present().map_err(plot_err)?;
        }

        buffer_to_image(buf, width, height)
    }

    /// Render the heatmap and write it as PNG
    pub fn save<P: AsRef<Path>>(&self, path: P, cell_px: u32, gene_px: u32) -> Result<()> {
        self.render(cell_px, gene_px)?.save(path)?;
        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> (ExpressionMatrix, CellLabels) {
        // gene_0 high in "b", gene_1 high in "a", gene_2 constant
        let values = Mat::from_fn(3, 6, |i, j| match i {
            0 => {
                if j % 2 == 1 {
                    50.0
                } else {
                    1.0
                }
            }
            1 => {
                if j % 2 == 0 {
                    80.0 + j as f64
                } else {
                    0.0
                }
            }
            _ => 4.0,
        });
        let labels = CellLabels::new(
            (0..6)
                .map(|j| if j % 2 == 0 { "a".into() } else { "b".into() })
                .collect(),
        );
        (ExpressionMatrix::from_values(values), labels)
    }

    #[test]
    fn test_heatmap_ordering() {
        let (m, labels) = example();
        let genes: Vec<String> = ["gene_0", "gene_1", "gene_2", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let hm = Heatmap::new(&m, &labels, &genes).unwrap();

        assert_eq!(hm.cell_labels, vec!["a", "a", "a", "b", "b", "b"]);
        assert_eq!(hm.gene_names.len(), 3);
        // genes peaking in "a" come first
        assert_eq!(hm.gene_names[2], "gene_0");
        let pos_g1 = hm.gene_names.iter().position(|g| g == "gene_1").unwrap();
        assert_eq!(hm.z.nrows(), 3);
        assert!(hm.z[(pos_g1, 0)] > 0.0);
        assert!(hm.z[(pos_g1, 5)] < 0.0);
        let pos_g2 = hm.gene_names.iter().position(|g| g == "gene_2").unwrap();
        assert!((0..6).all(|c| hm.z[(pos_g2, c)] == 0.0));
        for r in 0..hm.z.nrows() {
            for c in 0..hm.z.ncols() {
                assert!(hm.z[(r, c)].abs() <= Z_LIMIT);
            }
        }
    }

    #[test]
    fn test_heatmap_render() {
        let (m, labels) = example();
        let hm = Heatmap::new(&m, &labels, &["gene_0".to_string()])
            .unwrap()
            .titled("Selected genes");
        let img = hm.render(4, 3).unwrap();
        assert_eq!(img.dimensions(), hm.dimensions(4, 3));
        assert_eq!(
            img.dimensions(),
            (200 + 2 * PAD, TITLE_HEIGHT + BAR_HEIGHT + GAP + 3 + LEGEND_HEIGHT + PAD)
        );

        // label bar: first and last cell belong to different groups
        let palette = generate_palette(2);
        assert_eq!(*img.get_pixel(PAD, TITLE_HEIGHT), palette[0]);
        assert_eq!(*img.get_pixel(PAD + 22, TITLE_HEIGHT), palette[1]);

        // gene_0 is low in "a" (first block) and high in "b"
        let tile_y = TITLE_HEIGHT + BAR_HEIGHT + GAP + 1;
        let low = img.get_pixel(PAD + 1, tile_y);
        let high = img.get_pixel(PAD + 22, tile_y);
        assert!(low.0[2] > low.0[0]);
        assert!(high.0[0] > high.0[2]);

        // caption is drawn
        assert!((0..TITLE_HEIGHT).any(|y| (0..img.width())
            .any(|x| img.get_pixel(x, y).0.iter().all(|&c| c < 100))));

        assert!(hm.render(0, 3).is_err());
    }

    #[test]
    fn test_heatmap_no_genes() {
        let (m, labels) = example();
        assert!(Heatmap::new(&m, &labels, &["nope".to_string()]).is_err());
    }
}

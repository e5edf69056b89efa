use faer::{Mat, MatRef};
use rayon::prelude::*;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::core::base::utils::{col_sums, row_means_vars, row_sums, select_cols, select_rows};
use crate::core::errors::{Result, ScFeatError};

////////////////
// Structures //
////////////////

/// Expression matrix with gene (row) and cell (column) names
///
/// ### Fields
///
/// * `values` - The expression values, genes x cells. Either raw counts or
///   normalised values.
/// * `gene_names` - Names of the genes, one per row.
/// * `cell_names` - Names of the cells, one per column.
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    pub values: Mat<f64>,
    pub gene_names: Vec<String>,
    pub cell_names: Vec<String>,
}

impl ExpressionMatrix {
    /// Generate a new expression matrix
    ///
    /// ### Params
    ///
    /// * `values` - Genes x cells matrix.
    /// * `gene_names` - One name per row.
    /// * `cell_names` - One name per column.
    ///
    /// ### Returns
    ///
    /// The matrix or a `DimensionMismatch` error.
    pub fn new(values: Mat<f64>, gene_names: Vec<String>, cell_names: Vec<String>) -> Result<Self> {
        if values.nrows() != gene_names.len() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "{} rows but {} gene names",
                values.nrows(),
                gene_names.len()
            )));
        }
        if values.ncols() != cell_names.len() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "{} columns but {} cell names",
                values.ncols(),
                cell_names.len()
            )));
        }

        Ok(Self {
            values,
            gene_names,
            cell_names,
        })
    }

    /// Generate an expression matrix with generic names `gene_i` / `cell_j`
    pub fn from_values(values: Mat<f64>) -> Self {
        let gene_names = (0..values.nrows()).map(|i| format!("gene_{}", i)).collect();
        let cell_names = (0..values.ncols()).map(|j| format!("cell_{}", j)).collect();
        Self {
            values,
            gene_names,
            cell_names,
        }
    }

    /// Number of genes (rows)
    pub fn n_genes(&self) -> usize {
        self.values.nrows()
    }

    /// Number of cells (columns)
    pub fn n_cells(&self) -> usize {
        self.values.ncols()
    }

    /// Borrow the values
    pub fn view(&self) -> MatRef<'_, f64> {
        self.values.as_ref()
    }

    /// Map from gene name to row index (first occurrence wins)
    pub fn gene_index(&self) -> FxHashMap<&str, usize> {
        let mut map = FxHashMap::with_capacity_and_hasher(self.n_genes(), FxBuildHasher);
        for (i, name) in self.gene_names.iter().enumerate() {
            map.entry(name.as_str()).or_insert(i);
        }
        map
    }

    /// Subset to the given genes (rows)
    pub fn subset_genes(&self, indices: &[usize]) -> Self {
        Self {
            values: select_rows(self.values.as_ref(), indices),
            gene_names: indices.iter().map(|&i| self.gene_names[i].clone()).collect(),
            cell_names: self.cell_names.clone(),
        }
    }

    /// Subset to the given cells (columns)
    pub fn subset_cells(&self, indices: &[usize]) -> Self {
        Self {
            values: select_cols(self.values.as_ref(), indices),
            gene_names: self.gene_names.clone(),
            cell_names: indices.iter().map(|&j| self.cell_names[j].clone()).collect(),
        }
    }

    /// Check if the matrix holds raw counts
    ///
    /// ### Returns
    ///
    /// `true` if all values are finite, non-negative integers.
    pub fn is_counts(&self) -> bool {
        self.values
            .par_col_iter()
            .all(|col| col.iter().all(|&v| v.is_finite() && v >= 0.0 && v.fract() == 0.0))
    }

    /// Number of cells in which every gene is detected (> 0)
    pub fn detected_per_gene(&self) -> Vec<usize> {
        let m = self.values.as_ref();
        (0..m.nrows())
            .into_par_iter()
            .map(|i| m.row(i).iter().filter(|&&v| v > 0.0).count())
            .collect()
    }

    /// Number of genes detected (> 0) in every cell
    pub fn detected_per_cell(&self) -> Vec<usize> {
        self.values
            .par_col_iter()
            .map(|col| col.iter().filter(|&&v| v > 0.0).count())
            .collect()
    }

    /// Library size (column sums)
    pub fn library_sizes(&self) -> Vec<f64> {
        col_sums(self.values.as_ref())
    }

    /// Total expression per gene (row sums)
    pub fn gene_totals(&self) -> Vec<f64> {
        row_sums(self.values.as_ref())
    }

    /// Per gene mean and sample variance across cells
    pub fn gene_means_vars(&self) -> (Vec<f64>, Vec<f64>) {
        row_means_vars(self.values.as_ref())
    }
}

/// Cell type labels aligned with the matrix columns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellLabels {
    pub labels: Vec<String>,
}

impl CellLabels {
    /// Wrap a vector of labels
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Are there no labels
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check that the labels line up with the columns of a matrix
    pub fn check_aligned(&self, matrix: &ExpressionMatrix) -> Result<()> {
        if self.labels.len() != matrix.n_cells() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "{} labels for {} cells",
                self.labels.len(),
                matrix.n_cells()
            )));
        }
        Ok(())
    }

    /// Subset the labels to the given cells
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            labels: indices.iter().map(|&i| self.labels[i].clone()).collect(),
        }
    }

    /// Group the cells by label
    ///
    /// ### Returns
    ///
    /// Tuple of the unique labels in order of first appearance and, for every
    /// cell, the index of its group.
    pub fn groups(&self) -> (Vec<String>, Vec<usize>) {
        let mut uniq: Vec<String> = Vec::new();
        let mut lookup: FxHashMap<&str, usize> = FxHashMap::default();
        let mut membership = Vec::with_capacity(self.labels.len());

        for label in &self.labels {
            let idx = match lookup.get(label.as_str()) {
                Some(&i) => i,
                None => {
                    uniq.push(label.clone());
                    lookup.insert(label.as_str(), uniq.len() - 1);
                    uniq.len() - 1
                }
            };
            membership.push(idx);
        }

        (uniq, membership)
    }
}

///////////
// Tests //
///////////

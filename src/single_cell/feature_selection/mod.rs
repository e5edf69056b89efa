//! Unsupervised feature selection. Every method scores the genes of a
//! genes x cells matrix and returns a ranked `FeatureTable`.

pub mod brennecke;
pub mod correlation;
pub mod m3drop;
pub mod nbumi;
pub mod pca;

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::Result;

///////////
// Enums //
///////////

/// The feature selection (or DE) method that produced a table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Technical noise fit of the squared coefficient of variation
    Brennecke,
    /// Michaelis-Menten dropout model
    M3Drop,
    /// Depth adjusted negative binomial, dropout based
    NbumiDrop,
    /// Depth adjusted negative binomial, dispersion based
    NbumiHighVar,
    /// Maximal gene-gene correlation
    Correlation,
    /// PCA loadings
    Pca,
    /// Kruskal-Wallis test across cell types
    KruskalWallis,
}

impl SelectionMethod {
    /// Short name used for file names and logs
    pub fn name(&self) -> &'static str {
        match self {
            SelectionMethod::Brennecke => "brennecke",
            SelectionMethod::M3Drop => "m3drop",
            SelectionMethod::NbumiDrop => "nbumi_drop",
            SelectionMethod::NbumiHighVar => "nbumi_highvar",
            SelectionMethod::Correlation => "correlation",
            SelectionMethod::Pca => "pca",
            SelectionMethod::KruskalWallis => "kruskal_wallis",
        }
    }
}

////////////////
// Structures //
////////////////

/// Score of a single gene
///
/// ### Fields
///
/// * `gene` - Name of the gene.
/// * `gene_idx` - Row of the gene in the matrix the method was run on.
/// * `effect_size` - Method specific effect size or score.
/// * `p_value` - P-value, if the method tests.
/// * `q_value` - Adjusted p-value, if the method tests.
/// * `selected` - Did the gene pass the method's selection rule.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeatureRow {
    pub gene: String,
    pub gene_idx: usize,
    pub effect_size: f64,
    pub p_value: Option<f64>,
    pub q_value: Option<f64>,
    pub selected: bool,
}

/// Ranked per gene scores of one method
///
/// ### Fields
///
/// * `method` - The `SelectionMethod`.
/// * `rows` - One row per scored gene, in the ranking order of the method.
#[derive(Clone, Debug)]
pub struct FeatureTable {
    pub method: SelectionMethod,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    /// Generate a new table
    pub fn new(method: SelectionMethod, rows: Vec<FeatureRow>) -> Self {
        Self { method, rows }
    }

    /// Number of scored genes
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Are there no scored genes
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All gene names in ranking order
    pub fn gene_names(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.gene.clone()).collect()
    }

    /// The `n` best ranked genes
    pub fn top_n(&self, n: usize) -> Vec<String> {
        self.rows.iter().take(n).map(|r| r.gene.clone()).collect()
    }

    /// Genes that passed the selection rule of the method
    pub fn selected_genes(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.selected)
            .map(|r| r.gene.clone())
            .collect()
    }

    /// Mark exactly the `n` best ranked genes as selected
    pub fn select_top(&mut self, n: usize) {
        for (i, row) in self.rows.iter_mut().enumerate() {
            row.selected = i < n;
        }
    }

    /// Write the table as tab separated file
    ///
    /// Missing p- and q-values are written as `NA`.
    ///
    /// ### Params
    ///
    /// * `path` - Output file.
    pub fn write_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        writer.write_record(["gene", "effect_size", "p_value", "q_value", "selected"])?;

        let fmt_opt = |v: Option<f64>| v.map(|x| format!("{:e}", x)).unwrap_or_else(|| "NA".into());

        for row in &self.rows {
            writer.write_record([
                row.gene.clone(),
                format!("{}", row.effect_size),
                fmt_opt(row.p_value),
                fmt_opt(row.q_value),
                if row.selected { "TRUE".into() } else { "FALSE".into() },
            ])?;
        }
        writer.flush()?;

        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn toy_table() -> FeatureTable {
        let rows = (0..4)
            .map(|i| FeatureRow {
                gene: format!("g{}", i),
                gene_idx: i,
                effect_size: 4.0 - i as f64,
                p_value: if i == 3 { None } else { Some(0.01 * i as f64) },
                q_value: None,
                selected: i < 2,
            })
            .collect();
        FeatureTable::new(SelectionMethod::Correlation, rows)
    }

    #[test]
    fn test_table_accessors() {
        let mut t = toy_table();
        assert_eq!(t.len(), 4);
        assert_eq!(t.top_n(2), vec!["g0".to_string(), "g1".to_string()]);
        assert_eq!(t.top_n(10).len(), 4);
        assert_eq!(t.selected_genes(), vec!["g0".to_string(), "g1".to_string()]);
        t.select_top(3);
        assert_eq!(t.selected_genes().len(), 3);
        assert_eq!(t.method.name(), "correlation");
    }

    #[test]
    fn test_write_tsv() {
        let dir = std::env::temp_dir().join(format!("scfeatsel_fs_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("table.tsv");
        toy_table().write_tsv(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("gene\teffect_size"));
        assert!(lines[4].contains("NA"));
        assert!(lines[1].ends_with("TRUE"));
    }
}

use csv::ReaderBuilder;
use rustc_hash::FxHashSet;
use std::path::Path;

use crate::core::data::io::delimiter_for;
use crate::core::errors::{Result, ScFeatError};

/// Column names recognised as the gene identifier
const GENE_COLUMNS: &[&str] = &["gene", "genes", "gene_id", "symbol", "feature"];

/// Column names recognised as adjusted p-values
const Q_COLUMNS: &[&str] = &["q.value", "qval", "q_value", "qvalue", "padj", "fdr", "p.adj"];

/// Set of reference differentially expressed genes
#[derive(Clone, Debug, Default)]
pub struct DeReference {
    pub genes: FxHashSet<String>,
}

impl DeReference {
    /// Generate a reference from any iterator of names
    pub fn from_genes<I, S>(genes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            genes: genes.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of reference genes
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    /// Is the reference empty
    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Is a gene part of the reference
    pub fn contains(&self, gene: &str) -> bool {
        self.genes.contains(gene)
    }
}

/// Read a table of differentially expressed genes
///
/// The gene column is the one named like a gene identifier, or the first
/// column. If an adjusted p-value column exists and `q_threshold` is given,
/// only genes with `q < q_threshold` are kept. Files without a recognisable
/// header are read as a plain list of gene names (first column).
///
/// ### Params
///
/// * `path` - Path to the delimited table.
/// * `q_threshold` - Optional threshold on the adjusted p-value column.
///
/// ### Returns
///
/// The `DeReference`.
pub fn read_de_reference<P: AsRef<Path>>(path: P, q_threshold: Option<f64>) -> Result<DeReference> {
    let file_name = path.as_ref().display().to_string();
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(&path))
        .has_headers(false)
        .flexible(true)
        .from_path(&path)?;

    let mut records = reader.records();
    let first = match records.next() {
        Some(r) => r?,
        None => return Ok(DeReference::default()),
    };
    let first: Vec<String> = first
        .iter()
        .map(|f| f.trim().trim_matches('"').to_string())
        .collect();

    let lower: Vec<String> = first.iter().map(|f| f.to_lowercase()).collect();
    let gene_col = lower
        .iter()
        .position(|f| GENE_COLUMNS.contains(&f.as_str()));
    let q_col = lower.iter().position(|f| Q_COLUMNS.contains(&f.as_str()));
    let has_header = gene_col.is_some() || q_col.is_some();

    let mut genes = FxHashSet::default();
    let mut offset: Option<usize> = None;

    if !has_header {
        if let Some(g) = first.first().filter(|g| !g.is_empty()) {
            genes.insert(g.clone());
        }
    }

    for (line_idx, record) in records.enumerate() {
        let record = record?;
        let fields: Vec<&str> = record.iter().map(|f| f.trim().trim_matches('"')).collect();
        if fields.iter().all(|f| f.is_empty()) {
            continue;
        }

        if !has_header {
            genes.insert(fields[0].to_string());
            continue;
        }

        // R style tables have an unnamed row name column, so a header that is
        // one field short shifts every data row by one
        let shift = *offset.get_or_insert(if fields.len() == first.len() + 1 { 1 } else { 0 });
        let gene_idx = gene_col.map(|c| c + shift).unwrap_or(0);
        let gene = fields.get(gene_idx).copied().unwrap_or("");
        if gene.is_empty() {
            continue;
        }

        if let (Some(threshold), Some(q_col)) = (q_threshold, q_col) {
            let raw = fields.get(q_col + shift).copied().unwrap_or("");
            if raw.eq_ignore_ascii_case("na") || raw.is_empty() {
                continue;
            }
            let q: f64 = raw.parse().map_err(|_| ScFeatError::Parse {
                file: file_name.clone(),
                line: line_idx + 2,
                msg: format!("'{}' is not a valid q-value", raw),
            })?;
            if q >= threshold {
                continue;
            }
        }

        genes.insert(gene.to_string());
    }

    Ok(DeReference { genes })
}

///////////
// Tests //
///////////

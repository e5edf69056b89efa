//! Reading and writing of delimited expression matrices and labels.

use csv::{ReaderBuilder, WriterBuilder};
use faer::Mat;
use log::info;
use rustc_hash::FxHashMap;
use std::path::Path;
use std::time::Instant;

use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::data::sparse_io_mtx::read_mtx_dir;
use crate::core::errors::{Result, ScFeatError};

/////////////
// Helpers //
/////////////

/// Pick the delimiter from the file extension
///
/// `.csv` files are comma separated, everything else is tab separated.
pub fn delimiter_for<P: AsRef<Path>>(path: P) -> u8 {
    let name = path.as_ref().to_string_lossy().to_lowercase();
    if name.ends_with(".csv") {
        b','
    } else {
        b'\t'
    }
}

fn parse_value(field: &str, file: &str, line: usize) -> Result<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") {
        return Err(ScFeatError::Parse {
            file: file.to_string(),
            line,
            msg: "missing value".into(),
        });
    }
    trimmed.parse::<f64>().map_err(|_| ScFeatError::Parse {
        file: file.to_string(),
        line,
        msg: format!("'{}' is not a number", trimmed),
    })
}

//////////////////
// Dense matrix //
//////////////////

/// Read a dense delimited expression matrix
///
/// Layout: first line holds the cell names (with or without a leading
/// corner field), every following line is a gene name followed by one value
/// per cell.
///
/// ### Params
///
/// * `path` - Path to the `.tsv`/`.txt`/`.csv` file.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `ExpressionMatrix` (genes x cells).
pub fn read_dense_matrix<P: AsRef<Path>>(path: P, verbose: bool) -> Result<ExpressionMatrix> {
    let start = Instant::now();
    let file_name = path.as_ref().display().to_string();

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(&path))
        .has_headers(false)
        .flexible(true)
        .from_path(&path)?;

    let mut records = reader.records();

    let header = records
        .next()
        .ok_or_else(|| ScFeatError::InsufficientData(format!("{} is empty", file_name)))??;
    let header: Vec<String> = header.iter().map(|s| s.trim().to_string()).collect();

    let mut gene_names = Vec::new();
    let mut columns: Vec<f64> = Vec::new();
    let mut n_values: Option<usize> = None;

    for (line_idx, record) in records.enumerate() {
        let record = record?;
        let line = line_idx + 2;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let n = record.len() - 1;
        match n_values {
            None => n_values = Some(n),
            Some(expected) if expected != n => {
                return Err(ScFeatError::Parse {
                    file: file_name,
                    line,
                    msg: format!("expected {} values, found {}", expected, n),
                })
            }
            _ => {}
        }
        gene_names.push(record[0].trim().to_string());
        for field in record.iter().skip(1) {
            columns.push(parse_value(field, &file_name, line)?);
        }
    }

    let n_cells = n_values.ok_or_else(|| {
        ScFeatError::InsufficientData(format!("{} contains no gene rows", file_name))
    })?;

    let cell_names: Vec<String> = if header.len() == n_cells {
        header
    } else if header.len() == n_cells + 1 {
        header.into_iter().skip(1).collect()
    } else {
        return Err(ScFeatError::Parse {
            file: file_name,
            line: 1,
            msg: format!("header has {} fields for {} value columns", header.len(), n_cells),
        });
    };

    // values were pushed row major
    let n_genes = gene_names.len();
    let values = Mat::from_fn(n_genes, n_cells, |i, j| columns[i * n_cells + j]);

    if verbose {
        info!(
            "Read {} genes x {} cells from {} in {:.2?}",
            n_genes,
            n_cells,
            file_name,
            start.elapsed()
        );
    }

    ExpressionMatrix::new(values, gene_names, cell_names)
}

/// Write a dense expression matrix in the layout read by `read_dense_matrix`
pub fn write_dense_matrix<P: AsRef<Path>>(matrix: &ExpressionMatrix, path: P) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter_for(&path))
        .from_path(&path)?;

    let mut header = Vec::with_capacity(matrix.n_cells() + 1);
    header.push("gene".to_string());
    header.extend(matrix.cell_names.iter().cloned());
    writer.write_record(&header)?;

    for (i, gene) in matrix.gene_names.iter().enumerate() {
        let mut row = Vec::with_capacity(matrix.n_cells() + 1);
        row.push(gene.clone());
        for j in 0..matrix.n_cells() {
            row.push(format!("{}", matrix.values[(i, j)]));
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;

    Ok(())
}

/// Read an expression matrix, dispatching on the path
///
/// Directories and `.mtx` files go through the Matrix Market reader,
/// everything else through the dense reader.
pub fn read_expression<P: AsRef<Path>>(path: P, verbose: bool) -> Result<ExpressionMatrix> {
    let p = path.as_ref();
    let is_mtx = p.is_dir() || p.to_string_lossy().to_lowercase().ends_with(".mtx");
    if is_mtx {
        read_mtx_dir(p, verbose)
    } else {
        read_dense_matrix(p, verbose)
    }
}

////////////
// Labels //
////////////

/// Read the cell type labels
///
/// Accepts either one label per line, or two columns `cell<sep>label`. For
/// the two column form the labels are re-ordered to `cell_names` when those
/// are given.
///
/// ### Params
///
/// * `path` - Path to the label file.
/// * `cell_names` - Optional cell names to align the labels against.
///
/// ### Returns
///
/// The `CellLabels`.
pub fn read_labels<P: AsRef<Path>>(path: P, cell_names: Option<&[String]>) -> Result<CellLabels> {
    let file_name = path.as_ref().display().to_string();
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(&path))
        .has_headers(false)
        .flexible(true)
        .from_path(&path)?;

    let mut pairs: Vec<(Option<String>, String)> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<&str> = record.iter().map(|f| f.trim()).filter(|f| !f.is_empty()).collect();
        match fields.len() {
            0 => continue,
            1 => pairs.push((None, fields[0].to_string())),
            _ => pairs.push((Some(fields[0].to_string()), fields[1].to_string())),
        }
    }

    let two_column = pairs.iter().all(|(c, _)| c.is_some());

    match (two_column, cell_names) {
        (true, Some(names)) => {
            let lookup: FxHashMap<&str, &str> = pairs
                .iter()
                .filter_map(|(c, l)| c.as_deref().map(|c| (c, l.as_str())))
                .collect();
            // a header line such as "cell<TAB>label" simply never matches
            let labels = names
                .iter()
                .map(|n| {
                    lookup.get(n.as_str()).map(|l| l.to_string()).ok_or_else(|| {
                        ScFeatError::DimensionMismatch(format!(
                            "cell '{}' has no label in {}",
                            n, file_name
                        ))
                    })
                })
                .collect::<Result<Vec<String>>>()?;
            Ok(CellLabels::new(labels))
        }
        (true, None) => Ok(CellLabels::new(pairs.into_iter().map(|(_, l)| l).collect())),
        (false, _) => Ok(CellLabels::new(pairs.into_iter().map(|(_, l)| l).collect())),
    }
}

/// Write labels, one per line
pub fn write_labels<P: AsRef<Path>>(labels: &CellLabels, cell_names: &[String], path: P) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(&path)?;
    for (cell, label) in cell_names.iter().zip(labels.labels.iter()) {
        writer.write_record([cell.as_str(), label.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_file(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("scfeatsel_io_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_dense_with_corner() {
        let path = tmp_file("corner.tsv", "gene\tc1\tc2\ng1\t1\t0\ng2\t3\t4\n");
        let m = read_dense_matrix(&path, false).unwrap();
        assert_eq!(m.n_genes(), 2);
        assert_eq!(m.n_cells(), 2);
        assert_eq!(m.cell_names, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(m.values[(1, 0)], 3.0);
    }

    #[test]
    fn test_read_dense_without_corner_csv() {
        let path = tmp_file("nocorner.csv", "c1,c2,c3\ng1,1,2,3\n");
        let m = read_dense_matrix(&path, false).unwrap();
        assert_eq!(m.n_cells(), 3);
        assert_eq!(m.gene_names, vec!["g1".to_string()]);
        assert_eq!(m.values[(0, 2)], 3.0);
    }

    #[test]
    fn test_read_dense_errors() {
        let path = tmp_file("ragged.tsv", "gene\tc1\tc2\ng1\t1\t0\ng2\t3\n");
        assert!(matches!(
            read_dense_matrix(&path, false),
            Err(ScFeatError::Parse { line: 3, .. })
        ));
        let path = tmp_file("nan.tsv", "gene\tc1\ng1\tfoo\n");
        assert!(read_dense_matrix(&path, false).is_err());
    }

    #[test]
    fn test_dense_round_trip() {
        let path = tmp_file("rt_in.tsv", "gene\tc1\tc2\ng1\t1\t0.5\n");
        let m = read_dense_matrix(&path, false).unwrap();
        let out = tmp_file("rt_out.tsv", "");
        write_dense_matrix(&m, &out).unwrap();
        let m2 = read_dense_matrix(&out, false).unwrap();
        assert_eq!(m2.values[(0, 1)], 0.5);
        assert_eq!(m2.cell_names, m.cell_names);
    }

    #[test]
    fn test_read_labels_aligned() {
        let path = tmp_file("labels.tsv", "c2\tzygote\nc1\t2cell\n");
        let names = vec!["c1".to_string(), "c2".to_string()];
        let labels = read_labels(&path, Some(&names)).unwrap();
        assert_eq!(labels.labels, vec!["2cell".to_string(), "zygote".to_string()]);

        let missing = vec!["c3".to_string()];
        assert!(read_labels(&path, Some(&missing)).is_err());
    }

    #[test]
    fn test_read_labels_single_column() {
        let path = tmp_file("labels1.txt", "zygote\nzygote\n4cell\n");
        let labels = read_labels(&path, None).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.labels[2], "4cell");
    }
}

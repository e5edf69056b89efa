use faer::Mat;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};

/////////
// MTX //
/////////

/// MTX file metadata
///
/// ### Fields
///
/// * `total_genes` - Number of genes (rows) identified in the .mtx header.
/// * `total_cells` - Number of cells (columns) identified in the .mtx header.
/// * `total_entries` - Number of entries identified in the .mtx header.
/// * `pattern` - Is this a `pattern` matrix without values.
#[derive(Debug, Clone)]
pub struct MtxHeader {
    pub total_genes: usize,
    pub total_cells: usize,
    pub total_entries: usize,
    pub pattern: bool,
}

/// MTX Reader
///
/// Reads coordinate Matrix Market files with genes as rows and cells as
/// columns into a dense matrix.
///
/// ### Fields
///
/// * `reader` - Buffered reader of the mtx file
/// * `header` - The header of the mtx file
/// * `file_name` - Name of the file for error messages
pub struct MtxReader {
    reader: BufReader<File>,
    header: MtxHeader,
    file_name: String,
}

impl MtxReader {
    /// Generate a new instance of the reader
    ///
    /// ### Params
    ///
    /// * `path` - Path to the mtx file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file_name = path.as_ref().display().to_string();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let header = Self::parse_header(&mut reader, &file_name)?;

        Ok(Self {
            reader,
            header,
            file_name,
        })
    }

    /// Header of the file
    pub fn header(&self) -> &MtxHeader {
        &self.header
    }

    /// Parse the header of the mtx file
    ///
    /// ### Returns
    ///
    /// The `MtxHeader`
    fn parse_header(reader: &mut BufReader<File>, file_name: &str) -> Result<MtxHeader> {
        let mut line = String::new();
        let mut pattern = false;
        let mut line_no = 0;

        loop {
            line.clear();
            line_no += 1;
            if reader.read_line(&mut line)? == 0 {
                return Err(ScFeatError::Parse {
                    file: file_name.to_string(),
                    line: line_no,
                    msg: "file ended before the size line".into(),
                });
            }
            if line.starts_with("%%") {
                let banner = line.to_lowercase();
                if !banner.contains("coordinate") {
                    return Err(ScFeatError::Parse {
                        file: file_name.to_string(),
                        line: line_no,
                        msg: "only coordinate Matrix Market files are supported".into(),
                    });
                }
                pattern = banner.contains("pattern");
            }
            if !line.starts_with('%') {
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        let invalid = |msg: &str| ScFeatError::Parse {
            file: file_name.to_string(),
            line: line_no,
            msg: msg.to_string(),
        };

        if parts.len() != 3 {
            return Err(invalid("Invalid MTX header format"));
        }

        let total_genes = parts[0].parse().map_err(|_| invalid("Invalid gene count"))?;
        let total_cells = parts[1].parse().map_err(|_| invalid("Invalid cell count"))?;
        let total_entries = parts[2].parse().map_err(|_| invalid("Invalid entry count"))?;

        Ok(MtxHeader {
            total_genes,
            total_cells,
            total_entries,
            pattern,
        })
    }

    /// Read all entries into a dense genes x cells matrix
    ///
    /// ### Params
    ///
    /// * `verbose` - Controls verbosity of the function.
    ///
    /// ### Returns
    ///
    /// The dense matrix.
    pub fn read_dense(&mut self, verbose: bool) -> Result<Mat<f64>> {
        let start = Instant::now();
        let mut mat = Mat::<f64>::zeros(self.header.total_genes, self.header.total_cells);
        let mut line_buffer = Vec::with_capacity(128);
        let mut n_read = 0_usize;

        while {
            line_buffer.clear();
            self.reader.read_until(b'\n', &mut line_buffer)? > 0
        } {
            while matches!(line_buffer.last(), Some(b'\n') | Some(b'\r')) {
                line_buffer.pop();
            }
            if line_buffer.is_empty() || line_buffer[0] == b'%' {
                continue;
            }

            let (row, col, val) = parse_mtx_line(&line_buffer, self.header.pattern)
                .ok_or_else(|| ScFeatError::Parse {
                    file: self.file_name.clone(),
                    line: n_read + 1,
                    msg: format!(
                        "malformed entry '{}'",
                        String::from_utf8_lossy(&line_buffer)
                    ),
                })?;

            if row == 0 || col == 0 || row > self.header.total_genes || col > self.header.total_cells
            {
                return Err(ScFeatError::Parse {
                    file: self.file_name.clone(),
                    line: n_read + 1,
                    msg: format!("entry ({}, {}) outside the declared dimensions", row, col),
                });
            }

            mat[(row - 1, col - 1)] += val;
            n_read += 1;
        }

        if n_read != self.header.total_entries {
            return Err(ScFeatError::Parse {
                file: self.file_name.clone(),
                line: n_read,
                msg: format!(
                    "header announces {} entries, found {}",
                    self.header.total_entries, n_read
                ),
            });
        }

        if verbose {
            info!(
                "Read {} entries from {} in {:.2?}",
                n_read,
                self.file_name,
                start.elapsed()
            );
        }

        Ok(mat)
    }
}

/// Parse one entry line of an mtx file
///
/// ### Params
///
/// * `line` - The raw bytes of the line.
/// * `pattern` - If `true`, no value column is expected and the value is 1.
///
/// ### Returns
///
/// Tuple of the 1-based row, 1-based column and the value.
#[inline]
pub fn parse_mtx_line(line: &[u8], pattern: bool) -> Option<(usize, usize, f64)> {
    let mut i = 0;
    let len = line.len();

    let skip_ws = |i: &mut usize| {
        while *i < len && (line[*i] == b' ' || line[*i] == b'\t') {
            *i += 1;
        }
    };

    let parse_int = |i: &mut usize| -> Option<usize> {
        let start = *i;
        let mut v = 0usize;
        while *i < len && line[*i].is_ascii_digit() {
            v = v * 10 + (line[*i] - b'0') as usize;
            *i += 1;
        }
        if *i == start {
            None
        } else {
            Some(v)
        }
    };

    skip_ws(&mut i);
    let row = parse_int(&mut i)?;
    skip_ws(&mut i);
    let col = parse_int(&mut i)?;

    if pattern {
        return Some((row, col, 1.0));
    }

    skip_ws(&mut i);
    if i >= len {
        return None;
    }
    let rest = std::str::from_utf8(&line[i..]).ok()?;
    let val: f64 = rest.split_whitespace().next()?.parse().ok()?;

    Some((row, col, val))
}

/////////////////
// Name files  //
/////////////////

/// Read the first (or `column`th) field of every line of a names file
fn read_name_file(path: &Path, column: usize) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let name = fields.get(column).or_else(|| fields.first()).copied().unwrap_or("");
        names.push(name.trim().to_string());
    }
    Ok(names)
}

fn first_existing(dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(|c| dir.join(c)).find(|p| p.exists())
}

/// Read a Matrix Market expression matrix with its name files
///
/// `path` can be a directory holding `matrix.mtx` together with
/// `genes.tsv`/`features.tsv` and `barcodes.tsv` (10x layout), or a single
/// `.mtx` file. Missing name files fall back to generic names. For 10x
/// feature files the gene symbol (second column) is used.
///
/// ### Params
///
/// * `path` - Directory or `.mtx` file.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `ExpressionMatrix`.
pub fn read_mtx_dir<P: AsRef<Path>>(path: P, verbose: bool) -> Result<ExpressionMatrix> {
    let path = path.as_ref();
    let (mtx_path, dir) = if path.is_dir() {
        let mtx = first_existing(path, &["matrix.mtx"]).ok_or_else(|| {
            ScFeatError::InsufficientData(format!("no matrix.mtx in {}", path.display()))
        })?;
        (mtx, path.to_path_buf())
    } else {
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        (path.to_path_buf(), dir)
    };

    let mut reader = MtxReader::new(&mtx_path)?;
    let values = reader.read_dense(verbose)?;

    let mut matrix = ExpressionMatrix::from_values(values);

    if let Some(genes) = first_existing(&dir, &["features.tsv", "genes.tsv"]) {
        let names = read_name_file(&genes, 1)?;
        if names.len() != matrix.n_genes() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "{} lists {} genes, matrix has {}",
                genes.display(),
                names.len(),
                matrix.n_genes()
            )));
        }
        matrix.gene_names = names;
    }
    if let Some(barcodes) = first_existing(&dir, &["barcodes.tsv"]) {
        let names = read_name_file(&barcodes, 0)?;
        if names.len() != matrix.n_cells() {
            return Err(ScFeatError::DimensionMismatch(format!(
                "{} lists {} cells, matrix has {}",
                barcodes.display(),
                names.len(),
                matrix.n_cells()
            )));
        }
        matrix.cell_names = names;
    }

    Ok(matrix)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_mtx_line() {
        assert_eq!(parse_mtx_line(b"3 2 5", false), Some((3, 2, 5.0)));
        assert_eq!(parse_mtx_line(b"  1\t4\t2.5", false), Some((1, 4, 2.5)));
        assert_eq!(parse_mtx_line(b"1 4", true), Some((1, 4, 1.0)));
        assert_eq!(parse_mtx_line(b"1 4", false), None);
        assert_eq!(parse_mtx_line(b"x 4 1", false), None);
    }

    #[test]
    fn test_read_mtx_dir() {
        let dir = std::env::temp_dir().join(format!("scfeatsel_mtx_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("matrix.mtx"),
            "%%MatrixMarket matrix coordinate integer general\n% comment\n3 2 3\n1 1 4\n3 2 1\n2 1 7\n",
        )
        .unwrap();
        fs::write(dir.join("genes.tsv"), "ENSG1\tSox2\nENSG2\tNanog\nENSG3\tKlf4\n").unwrap();
        fs::write(dir.join("barcodes.tsv"), "AAAC\nAAAG\n").unwrap();

        let m = read_mtx_dir(&dir, false).unwrap();
        assert_eq!(m.n_genes(), 3);
        assert_eq!(m.n_cells(), 2);
        assert_eq!(m.values[(1, 0)], 7.0);
        assert_eq!(m.values[(2, 1)], 1.0);
        assert_eq!(m.gene_names[1], "Nanog");
        assert_eq!(m.cell_names[1], "AAAG");
    }

    #[test]
    fn test_entry_count_mismatch() {
        let dir = std::env::temp_dir().join(format!("scfeatsel_mtx_bad_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let f = dir.join("bad.mtx");
        fs::write(
            &f,
            "%%MatrixMarket matrix coordinate integer general\n2 2 3\n1 1 4\n",
        )
        .unwrap();
        assert!(read_mtx_dir(&f, false).is_err());
    }
}

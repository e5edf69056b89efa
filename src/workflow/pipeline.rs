//! Runs the complete sequence from loading the data to the evaluation of
//! every selection method and writes the results.

use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::borrow::Cow;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::data::de_table::{read_de_reference, DeReference};
use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::data::io::{read_expression, read_labels};
use crate::core::errors::Result;
use crate::plotting::heatmap::Heatmap;
use crate::plotting::scatter::{brennecke_plot, m3drop_plot, nbumi_plot, pca_plot};
use crate::single_cell::dge::kruskal_wallis_de;
use crate::single_cell::evaluation::{evaluate_selection, SelectionEvaluation};
use crate::single_cell::feature_selection::brennecke::brennecke_get_variable_genes;
use crate::single_cell::feature_selection::correlation::correlation_feature_selection;
use crate::single_cell::feature_selection::m3drop::m3drop_feature_selection;
use crate::single_cell::feature_selection::nbumi::{
    check_fit, combined_drop_selection, compare_dropouts, fit_dispersion_vs_mean, fit_nbumi,
    high_var_selection,
};
use crate::single_cell::feature_selection::pca::{pca_feature_selection, PcaParams};
use crate::single_cell::feature_selection::FeatureTable;
use crate::single_cell::processing::{
    clean_data, spike_in_indices, to_integer_counts, CleanedData,
};
use crate::workflow::config::WorkflowConfig;

/// Number of genes listed per method in the summary
const SUMMARY_TOP: usize = 20;

////////////////
// Structures //
////////////////

/// Files a workflow run reads from and writes to
///
/// ### Fields
///
/// * `counts` - Expression matrix (dense delimited text, `.mtx` or a 10x
///   style directory).
/// * `labels` - Optional cell labels.
/// * `reference` - Optional table of reference DE genes. Without it, and
///   with labels, a Kruskal-Wallis reference is computed.
/// * `output_dir` - Directory for tables, plots and `summary.json`.
#[derive(Clone, Debug)]
pub struct WorkflowInputs {
    pub counts: PathBuf,
    pub labels: Option<PathBuf>,
    pub reference: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Outcome of one selection method
///
/// ### Fields
///
/// * `method` - Name of the method.
/// * `n_scored` - Number of genes with a score.
/// * `n_selected` - Number of selected genes.
/// * `top_genes` - Best scoring genes.
/// * `evaluation` - Comparison with the reference, if there is one.
#[derive(Clone, Debug, Serialize)]
pub struct MethodSummary {
    pub method: String,
    pub n_scored: usize,
    pub n_selected: usize,
    pub top_genes: Vec<String>,
    pub evaluation: Option<SelectionEvaluation>,
}

/// Summary of a workflow run, written as `summary.json`
///
/// ### Fields
///
/// * `n_genes_input` / `n_cells_input` - Dimensions of the loaded matrix.
/// * `n_genes_clean` / `n_cells_clean` - Dimensions after cleaning.
/// * `was_counts` - Did the input hold raw counts.
/// * `n_spike_ins` - Number of spike-ins used as technical reference.
/// * `brennecke_a0` / `brennecke_a1` - Technical noise fit.
/// * `m3drop_k` - Fitted Michaelis constant.
/// * `nbumi_gene_error` / `nbumi_cell_error` - Squared errors of the zero
///   fit of the depth adjusted model.
/// * `pca_var_explained` - Variance explained by the used components.
/// * `reference_source` - Where the reference genes came from.
/// * `n_reference` - Size of the reference.
/// * `methods` - Per method outcome.
/// * `outputs` - Files written.
/// * `elapsed_secs` - Run time.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowSummary {
    pub n_genes_input: usize,
    pub n_cells_input: usize,
    pub n_genes_clean: usize,
    pub n_cells_clean: usize,
    pub was_counts: bool,
    pub n_spike_ins: usize,
    pub brennecke_a0: f64,
    pub brennecke_a1: f64,
    pub m3drop_k: f64,
    pub nbumi_gene_error: f64,
    pub nbumi_cell_error: f64,
    pub pca_var_explained: Vec<f64>,
    pub reference_source: Option<String>,
    pub n_reference: Option<usize>,
    pub methods: Vec<MethodSummary>,
    pub outputs: Vec<String>,
    pub elapsed_secs: f64,
}

/// Reference to compare against
enum Reference {
    File(PathBuf),
    Given(DeReference),
    None,
}

/////////////
// Helpers //
/////////////

/// Keeps track of the written files
struct OutputDir {
    root: PathBuf,
    written: Vec<String>,
}

impl OutputDir {
    fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            written: Vec::new(),
        })
    }

    /// Path of a new output file, recorded as written
    fn file(&mut self, name: &str) -> PathBuf {
        self.written.push(name.to_string());
        self.root.join(name)
    }
}

/// Summarise a table and evaluate its selection
fn summarise(
    table: &FeatureTable,
    reference: Option<&DeReference>,
    universe: &[String],
) -> MethodSummary {
    let selected = table.selected_genes();
    MethodSummary {
        method: table.method.name().to_string(),
        n_scored: table.len(),
        n_selected: selected.len(),
        top_genes: table.top_n(SUMMARY_TOP),
        evaluation: reference.map(|r| evaluate_selection(&selected, r, universe)),
    }
}

/// Heatmap of the selected genes of a table, capped at `top_n`
fn write_heatmap(
    out: &mut OutputDir,
    matrix: &ExpressionMatrix,
    labels: &CellLabels,
    table: &FeatureTable,
    top_n: usize,
) -> Result<()> {
    let genes: Vec<String> = table.selected_genes().into_iter().take(top_n).collect();
    if genes.is_empty() {
        warn!(
            "No genes selected by {}, skipping the heatmap",
            table.method.name()
        );
        return Ok(());
    }
    let gene_px = if genes.len() > 300 { 1 } else { 3 };
    let cell_px = if matrix.n_cells() > 600 { 1 } else { 2 };
    Heatmap::new(matrix, labels, &genes)?
        .titled(&format!("{} genes ({})", table.method.name(), genes.len()))
        .save(
            out.file(&format!("heatmap_{}.png", table.method.name())),
            cell_px,
            gene_px,
        )
}

///////////////
// Functions //
///////////////

/// Run the workflow on files
///
/// Loads the inputs and runs the same steps as `run_on_matrix`.
///
/// ### Params
///
/// * `inputs` - The `WorkflowInputs`.
/// * `config` - The `WorkflowConfig`.
///
/// ### Returns
///
/// The `WorkflowSummary` (also written to `summary.json`).
pub fn run_workflow(inputs: &WorkflowInputs, config: &WorkflowConfig) -> Result<WorkflowSummary> {
    config.validate()?;
    let matrix = read_expression(&inputs.counts, config.verbose)?;
    let labels = match &inputs.labels {
        Some(path) => Some(read_labels(path, Some(matrix.cell_names.as_slice()))?),
        None => None,
    };
    let reference = match &inputs.reference {
        Some(path) => Reference::File(path.clone()),
        None => Reference::None,
    };
    run_inner(&matrix, labels.as_ref(), reference, &inputs.output_dir, config)
}

/// Run the workflow on data in memory
///
/// ### Params
///
/// * `matrix` - Expression, genes x cells.
/// * `labels` - Optional cell labels.
/// * `reference` - Optional reference DE genes. Without it, and with
///   labels, a Kruskal-Wallis reference is computed.
/// * `output_dir` - Directory for the results.
/// * `config` - The `WorkflowConfig`.
///
/// ### Returns
///
/// The `WorkflowSummary`.
pub fn run_on_matrix(
    matrix: &ExpressionMatrix,
    labels: Option<&CellLabels>,
    reference: Option<DeReference>,
    output_dir: &Path,
    config: &WorkflowConfig,
) -> Result<WorkflowSummary> {
    config.validate()?;
    let reference = match reference {
        Some(r) => Reference::Given(r),
        None => Reference::None,
    };
    run_inner(matrix, labels, reference, output_dir, config)
}

/// Count matrix for the depth adjusted model
///
/// Raw counts of the kept genes and cells if the input held counts,
/// otherwise the ceiling of the normalised values.
fn nb_input(cleaned: &CleanedData) -> Result<Cow<'_, ExpressionMatrix>> {
    match cleaned.counts.as_ref() {
        Some(counts) => Ok(Cow::Borrowed(counts)),
        None => Ok(Cow::Owned(to_integer_counts(&cleaned.matrix)?)),
    }
}

fn run_inner(
    matrix: &ExpressionMatrix,
    labels: Option<&CellLabels>,
    reference: Reference,
    output_dir: &Path,
    config: &WorkflowConfig,
) -> Result<WorkflowSummary> {
    let start = Instant::now();
    let verbose = config.verbose;
    let mut out = OutputDir::new(output_dir)?;

    // cleaning
    let cleaned = clean_data(matrix, labels, &config.clean, verbose)?;
    let norm = &cleaned.matrix;
    let spikes = spike_in_indices(norm, &config.clean.spike_prefix);
    info!(
        "Cleaned data: {} genes x {} cells ({} spike-ins)",
        norm.n_genes(),
        norm.n_cells(),
        spikes.len()
    );

    // highly variable genes
    let brennecke = brennecke_get_variable_genes(norm, &spikes, &config.brennecke, verbose)?;
    brennecke.table.write_tsv(out.file("brennecke.tsv"))?;

    // dropout based selection
    let m3drop = m3drop_feature_selection(norm, &config.m3drop, verbose)?;
    m3drop.table.write_tsv(out.file("m3drop.tsv"))?;

    // depth adjusted negative binomial
    let counts = nb_input(&cleaned)?;
    let nb_fit = fit_nbumi(&counts, verbose)?;
    let disp = fit_dispersion_vs_mean(&nb_fit)?;
    let nb_check = check_fit(&nb_fit);
    if verbose {
        info!(
            "Depth adjusted model, squared error of zeros per gene {:.2} and per cell {:.2}",
            nb_check.gene_error, nb_check.cell_error
        );
    }
    let nb_drop = combined_drop_selection(
        &nb_fit,
        config.nbumi.ntop,
        &config.nbumi.mt_method,
        config.nbumi.qval_threshold,
    )?;
    nb_drop.write_tsv(out.file("nbumi_drop.tsv"))?;
    let nb_hvg = high_var_selection(&nb_fit, Some(config.top_n))?;
    nb_hvg.write_tsv(out.file("nbumi_highvar.tsv"))?;

    // correlation
    let mut cor_table = correlation_feature_selection(norm, &config.correlation, verbose)?;
    if config.correlation.fdr.is_none() {
        cor_table.select_top(config.top_n);
    }
    cor_table.write_tsv(out.file("correlation.tsv"))?;

    // PCA
    let pca_params = PcaParams {
        seed: config.seed,
        ..config.pca.clone()
    };
    let mut pca_res = pca_feature_selection(norm, &pca_params, verbose)?;
    pca_res.table.select_top(config.top_n);
    pca_res.table.write_tsv(out.file("pca.tsv"))?;

    // reference
    let (reference, reference_source) = match reference {
        Reference::File(path) => (
            Some(read_de_reference(&path, Some(config.de_threshold))?),
            Some(path.display().to_string()),
        ),
        Reference::Given(r) => (Some(r), Some("provided".to_string())),
        Reference::None => match cleaned.labels.as_ref() {
            Some(l) => {
                let de = kruskal_wallis_de(norm, l, config.de_threshold, verbose)?;
                de.write_tsv(out.file("kruskal_wallis.tsv"))?;
                (
                    Some(DeReference::from_genes(de.selected_genes())),
                    Some("kruskal_wallis".to_string()),
                )
            }
            None => (None, None),
        },
    };
    if let Some(r) = &reference {
        if r.is_empty() {
            warn!("The reference contains no genes, precision will be 0");
        }
    }

    let universe = norm.gene_names.clone();
    let tables: Vec<&FeatureTable> = vec![
        &brennecke.table,
        &m3drop.table,
        &nb_drop,
        &nb_hvg,
        &cor_table,
        &pca_res.table,
    ];
    let methods: Vec<MethodSummary> = tables
        .iter()
        .map(|t| summarise(t, reference.as_ref(), &universe))
        .collect();
    for m in &methods {
        match &m.evaluation {
            Some(ev) => info!(
                "{}: {} genes selected, precision {:.3}, recall {:.3}, enrichment p {:.3e}",
                m.method, m.n_selected, ev.precision, ev.recall, ev.enrichment_p
            ),
            None => info!("{}: {} genes selected", m.method, m.n_selected),
        }
    }

    // plots
    if config.plots {
        brennecke_plot(&brennecke)?.save(out.file("brennecke.png"))?;
        m3drop_plot(&m3drop)?.save(out.file("m3drop.png"))?;
        let cmp = compare_dropouts(&nb_fit, &disp);
        nbumi_plot(&nb_fit, &cmp, Some(&nb_drop))?.save(out.file("nbumi.png"))?;
        if pca_res.projections.ncols() >= 2 {
            pca_plot(&pca_res, config.top_n)?.save(out.file("pca.png"))?;
        }
        if let Some(l) = cleaned.labels.as_ref() {
            for table in &tables {
                write_heatmap(&mut out, norm, l, table, config.top_n)?;
            }
        }
    }

    let mut outputs = out.written.clone();
    outputs.push("summary.json".to_string());
    let summary = WorkflowSummary {
        n_genes_input: matrix.n_genes(),
        n_cells_input: matrix.n_cells(),
        n_genes_clean: norm.n_genes(),
        n_cells_clean: norm.n_cells(),
        was_counts: cleaned.was_counts,
        n_spike_ins: spikes.len(),
        brennecke_a0: brennecke.a0,
        brennecke_a1: brennecke.a1,
        m3drop_k: m3drop.fit.k,
        nbumi_gene_error: nb_check.gene_error,
        nbumi_cell_error: nb_check.cell_error,
        pca_var_explained: pca_res.var_explained.clone(),
        n_reference: reference.as_ref().map(|r| r.len()),
        reference_source,
        methods,
        outputs,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };

    let writer = BufWriter::new(File::create(out.file("summary.json"))?);
    serde_json::to_writer_pretty(writer, &summary)?;

    info!(
        "Workflow finished in {:.2?}, results in {}",
        start.elapsed(),
        output_dir.display()
    );

    Ok(summary)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_sc_counts;

    #[test]
    fn test_run_on_matrix_without_labels() {
        let data = generate_sc_counts(150, 60, 3, 0.1, 11).unwrap();
        let dir = std::env::temp_dir().join("scfeatsel_pipeline_unlabelled");
        let _ = fs::remove_dir_all(&dir);
        let config = WorkflowConfig {
            top_n: 30,
            plots: false,
            ..WorkflowConfig::default()
        };

        let summary = run_on_matrix(&data.counts, None, None, &dir, &config).unwrap();
        assert_eq!(summary.methods.len(), 6);
        assert!(summary.methods.iter().all(|m| m.evaluation.is_none()));
        assert!(summary.reference_source.is_none());
        assert!(dir.join("brennecke.tsv").exists());
        assert!(dir.join("summary.json").exists());
        assert!(!dir.join("brennecke.png").exists());
        let pca = summary.methods.iter().find(|m| m.method == "pca").unwrap();
        assert_eq!(pca.n_selected, 30);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_nb_fit_uses_raw_counts() {
        let data = generate_sc_counts(300, 90, 3, 0.1, 7).unwrap();
        let config = WorkflowConfig::default();
        let cleaned = clean_data(&data.counts, None, &config.clean, false).unwrap();
        let kept_cells: Vec<usize> = (0..cleaned.quality.to_keep.len())
            .filter(|&j| cleaned.quality.to_keep[j])
            .collect();
        let raw_sizes = data
            .counts
            .subset_genes(&cleaned.kept_genes)
            .subset_cells(&kept_cells)
            .library_sizes();

        let counts = nb_input(&cleaned).unwrap();
        let fit = fit_nbumi(&counts, false).unwrap();
        assert_eq!(fit.tis.len(), raw_sizes.len());
        for (t, s) in fit.tis.iter().zip(raw_sizes.iter()) {
            assert!((t - s).abs() < 1e-9, "{} vs {}", t, s);
        }
        assert!(fit.tis.iter().all(|&t| t < 1e5));
    }

    #[test]
    fn test_nb_input_normalised() {
        let data = generate_sc_counts(100, 40, 2, 0.1, 5).unwrap();
        let mut norm = data.counts.clone();
        norm.values = faer::Mat::from_fn(norm.n_genes(), norm.n_cells(), |i, j| {
            data.counts.values[(i, j)] * 0.5 + 0.25
        });
        let config = WorkflowConfig::default();
        let cleaned = clean_data(&norm, None, &config.clean, false).unwrap();
        assert!(!cleaned.was_counts);
        let counts = nb_input(&cleaned).unwrap();
        assert!(counts.is_counts());
        assert_eq!(counts.n_genes(), cleaned.matrix.n_genes());
    }

    #[test]
    fn test_run_with_single_spike_in() {
        let data = generate_sc_counts(150, 60, 3, 0.1, 11).unwrap();
        let mut counts = data.counts.clone();
        counts.gene_names[5] = "ERCC-00002".to_string();
        let dir = std::env::temp_dir().join("scfeatsel_pipeline_single_spike");
        let _ = fs::remove_dir_all(&dir);
        let config = WorkflowConfig {
            top_n: 30,
            plots: false,
            ..WorkflowConfig::default()
        };

        let summary = run_on_matrix(&counts, None, None, &dir, &config).unwrap();
        assert_eq!(summary.n_spike_ins, 1);
        assert_eq!(summary.methods.len(), 6);
        assert!(summary.brennecke_a0.is_finite());
        let _ = fs::remove_dir_all(&dir);
    }
}

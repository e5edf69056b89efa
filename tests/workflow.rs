use std::fs;
use std::path::PathBuf;

use scfeatsel::core::data::io::{write_dense_matrix, write_labels};
use scfeatsel::core::data::synthetic_data::generate_sc_counts;
use scfeatsel::single_cell::feature_selection::SelectionMethod;
use scfeatsel::workflow::{run_workflow, WorkflowConfig, WorkflowInputs};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("scfeatsel_it_{}", name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_workflow_on_synthetic_data() {
    let dir = scratch_dir("full");
    let data = generate_sc_counts(300, 90, 3, 0.1, 2024).unwrap();

    let counts = dir.join("counts.tsv");
    let labels = dir.join("labels.tsv");
    let reference = dir.join("de_genes.txt");
    write_dense_matrix(&data.counts, &counts).unwrap();
    write_labels(&data.labels, &data.counts.cell_names, &labels).unwrap();
    fs::write(&reference, data.de_genes.join("\n")).unwrap();

    let inputs = WorkflowInputs {
        counts,
        labels: Some(labels),
        reference: Some(reference),
        output_dir: dir.join("out"),
    };
    let config = WorkflowConfig {
        top_n: 50,
        ..WorkflowConfig::default()
    };

    let summary = run_workflow(&inputs, &config).unwrap();

    assert_eq!(summary.n_genes_input, 300);
    assert_eq!(summary.n_cells_input, 90);
    assert!(summary.was_counts);
    assert!(summary.n_genes_clean > 0 && summary.n_genes_clean <= 300);
    assert_eq!(summary.n_reference, Some(data.de_genes.len()));
    assert_eq!(summary.methods.len(), 6);

    let expected: Vec<&str> = vec![
        SelectionMethod::Brennecke.name(),
        SelectionMethod::M3Drop.name(),
        SelectionMethod::NbumiDrop.name(),
        SelectionMethod::NbumiHighVar.name(),
        SelectionMethod::Correlation.name(),
        SelectionMethod::Pca.name(),
    ];
    for (m, name) in summary.methods.iter().zip(expected.iter()) {
        assert_eq!(m.method, *name);
        let ev = m.evaluation.as_ref().unwrap();
        assert!(ev.precision >= 0.0 && ev.precision <= 1.0);
        assert!(ev.enrichment_p >= 0.0 && ev.enrichment_p <= 1.0);
    }

    // the PCA score picks up the cell type structure of the DE genes
    let pca = summary.methods.iter().find(|m| m.method == "pca").unwrap();
    assert_eq!(pca.n_selected, 50);
    let pca_eval = pca.evaluation.as_ref().unwrap();
    assert!(pca_eval.n_overlap > 0);

    let out = dir.join("out");
    for file in [
        "brennecke.tsv",
        "m3drop.tsv",
        "nbumi_drop.tsv",
        "nbumi_highvar.tsv",
        "correlation.tsv",
        "pca.tsv",
        "brennecke.png",
        "m3drop.png",
        "nbumi.png",
        "pca.png",
        "heatmap_pca.png",
        "summary.json",
    ] {
        assert!(out.join(file).exists(), "{} missing", file);
    }
    for plot in ["brennecke.png", "m3drop.png", "nbumi.png", "pca.png"] {
        let img = image::open(out.join(plot)).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (640, 480), "{}", plot);
    }

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
    assert_eq!(json["methods"].as_array().unwrap().len(), 6);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_workflow_missing_input() {
    let dir = scratch_dir("missing");
    let inputs = WorkflowInputs {
        counts: dir.join("does_not_exist.tsv"),
        labels: None,
        reference: None,
        output_dir: dir.join("out"),
    };
    assert!(run_workflow(&inputs, &WorkflowConfig::default()).is_err());
    let _ = fs::remove_dir_all(&dir);
}

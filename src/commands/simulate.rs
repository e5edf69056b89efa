//! Synthetic data for trying out the workflow

use anyhow::Result;
use log::info;
use std::fs;
use std::path::PathBuf;
use structopt::StructOpt;

use scfeatsel::core::data::io::{write_dense_matrix, write_labels};
use scfeatsel::core::data::synthetic_data::generate_sc_counts;

#[derive(StructOpt, Debug)]
#[structopt(name = "simulate")]
pub struct SimulateArgs {
    #[structopt(long, short = "o", parse(from_os_str), help = "Output directory")]
    pub output: PathBuf,

    #[structopt(long, default_value = "2000", help = "Number of genes")]
    pub genes: usize,

    #[structopt(long, default_value = "300", help = "Number of cells")]
    pub cells: usize,

    #[structopt(long, default_value = "3", help = "Number of cell types")]
    pub groups: usize,

    #[structopt(long, default_value = "0.1", help = "Fraction of differentially expressed genes")]
    pub de_fraction: f64,

    #[structopt(long, default_value = "42", help = "Random seed")]
    pub seed: u64,
}

pub fn run_simulate(args: SimulateArgs) -> Result<()> {
    let data = generate_sc_counts(args.genes, args.cells, args.groups, args.de_fraction, args.seed)?;
    fs::create_dir_all(&args.output)?;

    write_dense_matrix(&data.counts, args.output.join("counts.tsv"))?;
    write_labels(&data.labels, &data.counts.cell_names, args.output.join("labels.tsv"))?;
    fs::write(args.output.join("de_genes.txt"), data.de_genes.join("\n") + "\n")?;

    info!(
        "Wrote {} genes x {} cells ({} DE genes) to {}",
        data.counts.n_genes(),
        data.counts.n_cells(),
        data.de_genes.len(),
        args.output.display()
    );
    Ok(())
}

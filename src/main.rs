//! scfeatsel - unsupervised feature selection for single cell RNA-seq
//!
//! # Tools
//!
//! - `run`: clean the data, run every selection method, evaluate against a
//!   reference and write tables, plots and a JSON summary
//! - `simulate`: write a synthetic labelled count matrix
//! - `de`: Kruskal-Wallis reference table of differentially expressed genes
//!
//! # Usage
//!
//! ```bash
//! scfeatsel simulate --output sim
//! scfeatsel run --counts sim/counts.tsv --labels sim/labels.tsv --output results
//! scfeatsel de --counts sim/counts.tsv --labels sim/labels.tsv --output sim/de.tsv
//! ```

pub mod commands;

use anyhow::Result;
use env_logger::Env;
use log::*;
use scfeatsel::core::errors::is_broken_pipe;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case", author, about)]
/// Unsupervised feature selection for single cell RNA-seq data
struct Args {
    #[structopt(subcommand)]
    subcommand: Subcommand,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Run all feature selection methods and evaluate them
    Run(commands::RunArgs),
    /// Generate a synthetic labelled count matrix
    Simulate(commands::SimulateArgs),
    /// Build the Kruskal-Wallis DE reference table
    De(commands::DeArgs),
}

impl Subcommand {
    fn run(self) -> Result<()> {
        match self {
            Subcommand::Run(args) => commands::run_run(args)?,
            Subcommand::Simulate(args) => commands::run_simulate(args)?,
            Subcommand::De(args) => commands::run_de(args)?,
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = Args::from_args().subcommand.run() {
        if is_broken_pipe(&err) {
            std::process::exit(0);
        }
        error!("{}", err);
        std::process::exit(1);
    }
    Ok(())
}

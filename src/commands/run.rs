//! Complete feature selection workflow
//!
//! Loads the expression matrix (and optionally labels and a DE reference),
//! cleans it, runs every selection method and writes one TSV table per
//! method, diagnostic PNG plots and `summary.json` into the output
//! directory.

use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;
use structopt::StructOpt;

use scfeatsel::workflow::{run_workflow, WorkflowConfig, WorkflowInputs};

#[derive(StructOpt, Debug)]
#[structopt(name = "run")]
pub struct RunArgs {
    #[structopt(long, parse(from_os_str), help = "Expression matrix (TSV/CSV, .mtx or 10x directory), genes x cells")]
    pub counts: PathBuf,

    #[structopt(long, parse(from_os_str), help = "Cell labels, one per line or cell<TAB>label")]
    pub labels: Option<PathBuf>,

    #[structopt(long, parse(from_os_str), help = "Reference table of differentially expressed genes")]
    pub reference: Option<PathBuf>,

    #[structopt(long, parse(from_os_str), help = "JSON configuration file")]
    pub config: Option<PathBuf>,

    #[structopt(long, short = "o", parse(from_os_str), help = "Output directory")]
    pub output: PathBuf,

    #[structopt(long, help = "Number of genes taken from the score based methods")]
    pub top_n: Option<usize>,

    #[structopt(long, help = "Random seed")]
    pub seed: Option<u64>,

    #[structopt(long, help = "Do not write PNG plots")]
    pub no_plots: bool,

    #[structopt(long, short = "v", help = "Verbose output")]
    pub verbose: bool,
}

impl RunArgs {
    /// Configuration from the JSON file (or defaults) with the command line
    /// overrides applied
    fn workflow_config(&self) -> Result<WorkflowConfig> {
        let mut config = match &self.config {
            Some(path) => WorkflowConfig::from_json(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => WorkflowConfig::default(),
        };
        if let Some(n) = self.top_n {
            config.top_n = n;
        }
        if let Some(s) = self.seed {
            config.seed = s;
        }
        if self.no_plots {
            config.plots = false;
        }
        config.verbose |= self.verbose;
        config.validate()?;
        Ok(config)
    }
}

pub fn run_run(args: RunArgs) -> Result<()> {
    info!("Arguments: {:?}", args);
    let config = args.workflow_config()?;
    let inputs = WorkflowInputs {
        counts: args.counts,
        labels: args.labels,
        reference: args.reference,
        output_dir: args.output,
    };

    let summary = run_workflow(&inputs, &config)?;
    info!(
        "{} genes x {} cells after cleaning, {} files written",
        summary.n_genes_clean,
        summary.n_cells_clean,
        summary.outputs.len()
    );
    Ok(())
}

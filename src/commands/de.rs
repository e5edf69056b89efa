//! Kruskal-Wallis reference of differentially expressed genes

use anyhow::{anyhow, Result};
use log::info;
use std::path::PathBuf;
use structopt::StructOpt;

use scfeatsel::core::data::io::{read_expression, read_labels};
use scfeatsel::single_cell::dge::kruskal_wallis_de;
use scfeatsel::single_cell::processing::{clean_data, CleanParams};

#[derive(StructOpt, Debug)]
#[structopt(name = "de")]
pub struct DeArgs {
    #[structopt(long, parse(from_os_str), help = "Expression matrix, genes x cells")]
    pub counts: PathBuf,

    #[structopt(long, parse(from_os_str), help = "Cell labels")]
    pub labels: PathBuf,

    #[structopt(long, short = "o", parse(from_os_str), help = "Output TSV")]
    pub output: PathBuf,

    #[structopt(long, default_value = "0.05", help = "q-value threshold")]
    pub threshold: f64,

    #[structopt(long, help = "Test the input as is, without cleaning")]
    pub raw: bool,

    #[structopt(long, short = "v", help = "Verbose output")]
    pub verbose: bool,
}

pub fn run_de(args: DeArgs) -> Result<()> {
    let matrix = read_expression(&args.counts, args.verbose)?;
    let labels = read_labels(&args.labels, Some(matrix.cell_names.as_slice()))?;

    let table = if args.raw {
        kruskal_wallis_de(&matrix, &labels, args.threshold, args.verbose)?
    } else {
        let cleaned = clean_data(&matrix, Some(&labels), &CleanParams::default(), args.verbose)?;
        let labels = cleaned
            .labels
            .ok_or_else(|| anyhow!("Labels were lost during cleaning"))?;
        kruskal_wallis_de(&cleaned.matrix, &labels, args.threshold, args.verbose)?
    };
    table.write_tsv(&args.output)?;

    info!(
        "{} of {} genes differentially expressed at q < {}, written to {}",
        table.selected_genes().len(),
        table.len(),
        args.threshold,
        args.output.display()
    );
    Ok(())
}

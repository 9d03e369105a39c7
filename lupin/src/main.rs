mod centile_cmd;
mod run_cmd;

use centile_cmd::*;
use run_cmd::*;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser)]
#[command(
    name = "lupin",
    version,
    about = "Donor-aware single-cell clustering and expression centiles",
    long_about = "Cluster single-cell counts across donors and rank gene expression:\n\
		  (1) Parse donor/replicate from cell identifiers and filter cells by QC\n\
		  (2) Log-normalize per donor, select variable genes, run PCA\n\
		  (3) Align donors by canonical-correlation anchors\n\
		  (4) Cluster the shared embedding (SNN + Louvain)\n\
		  (5) Bin expression of genes of interest into centiles.\n"
)]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// maximum number of worker threads (all cores by default)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline from a gene × cell count table
    Run(RunArgs),
    /// Recompute expression centiles from a saved checkpoint
    Centile(CentileCmdArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let max_threads = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;
    info!("will use {} threads", rayon::current_num_threads());

    match &cli.commands {
        Commands::Run(args) => {
            run(args)?;
        }
        Commands::Centile(args) => {
            centile(args)?;
        }
    }

    Ok(())
}

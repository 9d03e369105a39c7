use lupin::centile::CentileArgs;
use lupin::checkpoint::Checkpoint;
use lupin::output::write_centile_outputs;
use lupin::pipeline::centiles_from_checkpoint;

use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct CentileCmdArgs {
    /// checkpoint written by `lupin run`
    #[arg(long, short, required = true)]
    checkpoint: Box<str>,

    /// genes of interest (comma-separated)
    #[arg(long, short, value_delimiter(','), required = true)]
    genes: Vec<Box<str>>,

    /// annotation column used to group cells (clusters by default)
    #[arg(long)]
    group_column: Option<Box<str>>,

    /// extract cells with centile strictly above this
    #[arg(long, short, default_value_t = 95)]
    threshold: u8,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,
}

pub fn centile(args: &CentileCmdArgs) -> anyhow::Result<()> {
    if args.threshold > 100 {
        anyhow::bail!("threshold must be within [0, 100], got {}", args.threshold);
    }

    let checkpoint = Checkpoint::from_json_file(&args.checkpoint)?;
    let centile_args = CentileArgs {
        genes: args.genes.clone(),
        group_column: args.group_column.clone(),
        threshold: args.threshold,
    };

    let table = centiles_from_checkpoint(&checkpoint, &centile_args)?;
    let files = write_centile_outputs(&table, args.threshold, &args.out)?;

    info!(
        "centiles of {} genes over {} cells -> {} files",
        table.genes.len(),
        table.num_cells(),
        files.len()
    );
    Ok(())
}

mod cli;
mod demux;
mod error;
mod options;
mod pipeline;
mod reader;
mod record;
mod samplesheet;
mod seq;
mod spsc;
mod stats;
mod worker;
mod writer;

use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let opts = Arc::new(args.into_options()?);
    let start = Instant::now();

    let tally = if opts.paired_end {
        pipeline::PairedEndPipeline::new(Arc::clone(&opts)).run()?
    } else {
        pipeline::SingleEndPipeline::new(Arc::clone(&opts)).run()?
    };

    let report = stats::RunReport::new(&opts, &tally, start.elapsed());
    report.log(opts.paired_end);
    if let Some(path) = &opts.report {
        report.write(path)?;
        info!("run report written to {}", path.display());
    }

    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::Parser;

use zync::cli::Args;
use zync::logger::Log;
use zync::{client, server, Options};

fn main() {
    let args = Args::parse();
    let log = Log::new(args.verbose);
    let opts = args.options();
    if let Err(e) = run(&args, &opts, log) {
        log.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(args: &Args, opts: &Options, log: Log) -> Result<()> {
    // The tree being synchronized is always the working directory.
    let root = std::env::current_dir().context("determine working directory")?;
    if args.server {
        server::serve(&root, opts, log)
    } else if let Some(uri) = &args.connect {
        client::run(uri, &root, opts, log)
    } else {
        bail!("one of --server (-s), --connect (-c) must be specified");
    }
}

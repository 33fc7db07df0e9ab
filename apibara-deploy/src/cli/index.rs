use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use clap::Args;
use log::{debug, info};

use super::common;
use crate::{
    indexer::{Indexer, IndexerConfig},
    Result,
};

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// JSON file with the indexer configuration. Defaults to the contract and stream of the
    /// StarkNet preview indexer.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long = "print-config", default_value_t)]
    pub print_config: bool,

    /// JSON lines file with one block per line. Blocks are read from standard input when omitted.
    pub input: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<IndexerConfig> {
    let Some(path) = path else {
        return Ok(IndexerConfig::default());
    };
    let file = File::open(path).map_err(|error| format!("failed to open {path:?}: {error}"))?;
    let config = serde_json::from_reader(BufReader::new(file))
        .map_err(|error| format!("failed to parse {path:?}: {error}"))?;
    Ok(config)
}

pub fn index(args: IndexArgs) -> Result<()> {
    let IndexArgs {
        config,
        print_config,
        input,
    } = args;

    let config = load_config(config.as_deref())?;
    if print_config {
        return common::print_json(&config);
    }

    let indexer = Indexer::new(config);
    debug!(
        "indexing blocks of {stream_url}",
        stream_url = indexer.config().stream_url
    );

    let summary = match input {
        Some(path) => {
            let file =
                File::open(&path).map_err(|error| format!("failed to open {path:?}: {error}"))?;
            indexer.process(BufReader::new(file))?
        }
        None => indexer.process(io::stdin().lock())?,
    };
    info!(
        "processed {blocks} blocks, skipped {skipped} blocks, logged {events} events",
        blocks = summary.blocks,
        skipped = summary.skipped_blocks,
        events = summary.events
    );
    Ok(())
}

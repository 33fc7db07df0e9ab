//! A StarkNet indexer that logs the events of a single contract. Blocks are consumed as JSON
//! lines; subscribing to the stream itself is left to the Apibara runtime.

use std::io::BufRead;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_STREAM_URL: &str = "https://starknet.preview.apibara.org";
pub const DEFAULT_STARTING_ORDER_KEY: u64 = 900_000;
pub const DEFAULT_CONTRACT_ADDRESS: &str =
    "0x028d709c875c0ceac3dce7065bec5328186dc89fe254527084d1689910954b0a";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexerConfig {
    pub stream_url: String,
    pub starting_cursor: Cursor,
    pub filter: Filter,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_owned(),
            starting_cursor: Cursor {
                order_key: DEFAULT_STARTING_ORDER_KEY,
            },
            filter: Filter {
                events: vec![EventFilter {
                    address: DEFAULT_CONTRACT_ADDRESS.to_owned(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub order_key: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub events: Vec<EventFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: Option<BlockHeader>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub block_number: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub address: Option<String>,
    pub event_index: u64,
    pub transaction_hash: String,
}

/// Felts are compared by value: case and leading zeros do not matter.
fn normalize_address(address: &str) -> String {
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address)
        .trim_start_matches('0');
    digits.to_ascii_lowercase()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub blocks: u64,
    pub skipped_blocks: u64,
    pub events: u64,
}

pub struct Indexer {
    config: IndexerConfig,
    addresses: Vec<String>,
}

impl Indexer {
    pub fn new(config: IndexerConfig) -> Self {
        let addresses = config
            .filter
            .events
            .iter()
            .map(|filter| normalize_address(&filter.address))
            .collect();
        Self { config, addresses }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    fn matches(&self, event: &Event) -> bool {
        if self.addresses.is_empty() {
            return true;
        }
        event.address.as_deref().is_some_and(|address| {
            let address = normalize_address(address);
            self.addresses.iter().any(|expected| *expected == address)
        })
    }

    /// Logs the block number and every event that passes the filter, and returns those events.
    pub fn transform<'b>(&self, block: &'b Block) -> Vec<&'b Event> {
        match &block.header {
            Some(header) => info!("Block number {}", header.block_number),
            None => info!("Block number unknown"),
        }
        let events: Vec<&Event> = block
            .events
            .iter()
            .filter(|event| self.matches(event))
            .collect();
        for event in &events {
            info!(
                "Event {index} tx={tx}",
                index = event.event_index,
                tx = event.transaction_hash
            );
        }
        events
    }

    /// Transforms every block of a JSON lines stream. Blocks before the starting cursor are
    /// skipped; blank lines are ignored.
    pub fn process<R: BufRead>(&self, reader: R) -> Result<Summary> {
        let starting_order_key = self.config.starting_cursor.order_key;
        let mut summary = Summary::default();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let block: Block = serde_json::from_str(&line)
                .map_err(|error| format!("invalid block on line {}: {error}", index + 1))?;

            if let Some(header) = &block.header {
                if header.block_number < starting_order_key {
                    debug!(
                        "skipping block {} before starting cursor {starting_order_key}",
                        header.block_number
                    );
                    summary.skipped_blocks += 1;
                    continue;
                }
            }

            summary.events += self.transform(&block).len() as u64;
            summary.blocks += 1;
        }

        Ok(summary)
    }
}

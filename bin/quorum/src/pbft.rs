//! PBFT network simulation
//!
//! Every producer runs its own controller over a replica of one shared chain. A block is
//! produced each round, every online controller ticks, and outgoing messages are relayed to
//! the other online controllers until the network is quiet.

use clap::Parser;
use quorum_pbft::{
    test_utils::{producer_keys, MemoryChain},
    PbftChain, PbftConfig, PbftController, PbftMessage, PbftSignals,
};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};

/// PBFT simulation arguments
#[derive(Debug, Parser)]
pub struct PbftArgs {
    /// Number of scheduled producers
    #[arg(long, short = 'p', default_value = "4")]
    pub producers: usize,

    /// Blocks to produce
    #[arg(long, short = 'n', default_value = "20")]
    pub blocks: usize,

    /// Producers that never tick nor receive messages
    #[arg(long, default_value = "0")]
    pub offline: usize,

    /// Extra rounds without new blocks at the end
    #[arg(long, default_value = "0")]
    pub idle_rounds: usize,

    /// Blocks between checkpoints
    #[arg(long, default_value = "10")]
    pub checkpoint_interval: u32,

    /// Ticks without progress before a view change
    #[arg(long, default_value = "6")]
    pub view_change_timeout: u32,

    /// Directory for persisted views, a temporary one when absent
    #[arg(long, env = "QUORUM_SIM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

struct Producer {
    controller: PbftController<MemoryChain>,
    outgoing: broadcast::Receiver<PbftMessage>,
    online: bool,
}

impl PbftArgs {
    /// The configured data directory, or a fresh temporary one that lives as long as the guard.
    fn resolve_data_dir(&self) -> std::io::Result<(PathBuf, Option<TempDir>)> {
        match &self.data_dir {
            Some(dir) => Ok((dir.clone(), None)),
            None => {
                let temp_dir = tempfile::tempdir()?;
                Ok((temp_dir.path().to_path_buf(), Some(temp_dir)))
            }
        }
    }

    /// Run the simulation
    pub fn run(&self) -> eyre::Result<()> {
        eyre::ensure!(self.producers > 0, "at least one producer is required");
        eyre::ensure!(self.offline <= self.producers, "more offline producers than producers");

        let (data_dir, _temp_dir) = self.resolve_data_dir()?;

        info!(
            target: "quorum::sim",
            producers = self.producers,
            offline = self.offline,
            blocks = self.blocks,
            data_dir = %data_dir.display(),
            "Starting PBFT simulation"
        );

        let keys = producer_keys(self.producers);
        let mut chain = MemoryChain::with_producers(&keys);
        let mut producers = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let config = PbftConfig {
                checkpoint_interval: self.checkpoint_interval,
                view_change_timeout: self.view_change_timeout,
                ..PbftConfig::with_data_dir(data_dir.join(format!("producer{i}")))
            };
            let signals = PbftSignals::default();
            let outgoing = signals.subscribe_outgoing();
            let controller =
                PbftController::new(config, chain.replica(), Some(key.clone()), signals)?;
            producers.push(Producer { controller, outgoing, online: i >= self.offline });
        }

        for round in 0..self.blocks + self.idle_rounds {
            if round < self.blocks {
                chain.produce_blocks(1);
            }
            let relayed = run_round(&mut producers);
            let leader = producers.iter().find(|p| p.online).map(|p| &p.controller);
            if let Some(controller) = leader {
                info!(
                    target: "quorum::sim",
                    round,
                    head = chain.head_block_num(),
                    lib = controller.database().chain().last_irreversible_block_num(),
                    view = controller.current_view(),
                    state = controller.state().name(),
                    relayed,
                    "round complete"
                );
            }
        }

        for (i, producer) in producers.iter().enumerate() {
            let db = producer.controller.database();
            info!(
                target: "quorum::sim",
                producer = i,
                online = producer.online,
                lib = db.chain().last_irreversible_block_num(),
                stable_checkpoint = db.chain().last_stable_checkpoint_block_num(),
                view = producer.controller.current_view(),
                state = producer.controller.state().name(),
                "final state"
            );
        }
        Ok(())
    }
}

/// Tick online producers, then relay until quiet. Returns the number of relayed messages.
fn run_round(producers: &mut [Producer]) -> usize {
    for producer in producers.iter_mut().filter(|p| p.online) {
        producer.controller.tick();
    }

    let mut relayed = 0;
    loop {
        let mut pending = Vec::new();
        for (from, producer) in producers.iter_mut().enumerate() {
            loop {
                match producer.outgoing.try_recv() {
                    Ok(msg) => pending.push((from, msg)),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(
                            target: "quorum::sim",
                            producer = from,
                            skipped,
                            "outgoing channel lagged"
                        );
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        if pending.is_empty() {
            return relayed;
        }
        relayed += pending.len();
        for (from, msg) in pending {
            for (to, producer) in producers.iter_mut().enumerate() {
                if to != from && producer.online {
                    producer.controller.on_message(msg.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_is_used_as_is() {
        let args = PbftArgs::parse_from(["pbft", "--data-dir", "/var/lib/quorum"]);
        let (dir, temp_dir) = args.resolve_data_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/var/lib/quorum"));
        assert!(temp_dir.is_none());
    }

    #[test]
    fn missing_data_dir_falls_back_to_a_temporary_one() {
        let args = PbftArgs::parse_from(["pbft"]);
        let (dir, temp_dir) = args.resolve_data_dir().unwrap();
        let temp_dir = temp_dir.unwrap();
        assert_eq!(dir, temp_dir.path());
        assert!(dir.exists());
    }
}

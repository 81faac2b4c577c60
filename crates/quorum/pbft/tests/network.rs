//! Several controllers over one shared chain, messages relayed through their signals.

use quorum_pbft::{
    test_utils::{producer_keys, MemoryChain},
    PbftChain, PbftConfig, PbftController, PbftMessage, PbftSignals, PsmState,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Network {
    nodes: Vec<PbftController<MemoryChain>>,
    outgoing: Vec<broadcast::Receiver<PbftMessage>>,
    online: Vec<bool>,
    _dir: TempDir,
}

impl Network {
    fn new(n: usize, offline: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let keys = producer_keys(n);
        let mut chain = MemoryChain::with_producers(&keys);
        chain.produce_blocks(3);

        let mut nodes = Vec::new();
        let mut outgoing = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let config = PbftConfig {
                checkpoint_interval: 2,
                ..PbftConfig::with_data_dir(dir.path().join(format!("node{i}")))
            };
            let signals = PbftSignals::default();
            outgoing.push(signals.subscribe_outgoing());
            let node =
                PbftController::new(config, chain.replica(), Some(key.clone()), signals).unwrap();
            nodes.push(node);
        }
        let online = (0..n).map(|i| i >= offline).collect();
        Self { nodes, outgoing, online, _dir: dir }
    }

    /// Tick every online node, then relay until no node has anything left to say.
    fn round(&mut self) {
        for (node, online) in self.nodes.iter_mut().zip(&self.online) {
            if *online {
                node.tick();
            }
        }
        loop {
            let mut relayed = false;
            for from in 0..self.nodes.len() {
                while let Ok(msg) = self.outgoing[from].try_recv() {
                    relayed = true;
                    for to in 0..self.nodes.len() {
                        if to != from && self.online[to] {
                            self.nodes[to].on_message(msg.clone());
                        }
                    }
                }
            }
            if !relayed {
                break;
            }
        }
    }

    fn produce_block(&mut self) {
        self.nodes[0].database_mut().chain_mut().produce_blocks(1);
    }

    fn libs(&self) -> Vec<u32> {
        self.nodes
            .iter()
            .map(|node| node.database().chain().last_irreversible_block_num())
            .collect()
    }
}

#[test]
fn four_producers_finalize_blocks() {
    let mut network = Network::new(4, 0);
    network.round();
    assert_eq!(network.libs(), vec![4; 4]);

    for _ in 0..5 {
        network.produce_block();
        network.round();
    }
    assert_eq!(network.libs(), vec![9; 4]);
    assert!(network.nodes.iter().all(|node| node.current_view() == 0));
    assert!(network.nodes.iter().all(|node| node.state() == PsmState::Committed));

    // checkpoints every other block are stable everywhere
    for node in &network.nodes {
        let lscb = node.database().chain().last_stable_checkpoint_block_num();
        assert!(lscb >= 7, "stable checkpoint {lscb}");
    }
}

#[test]
fn one_offline_producer_is_tolerated() {
    let mut network = Network::new(4, 1);
    for _ in 0..3 {
        network.produce_block();
        network.round();
    }
    let libs = network.libs();
    assert_eq!(libs[0], 0);
    assert!(libs[1..].iter().all(|lib| *lib == 7));
}

#[test]
fn two_offline_producers_stall() {
    let mut network = Network::new(4, 2);
    for _ in 0..3 {
        network.produce_block();
        network.round();
    }
    assert!(network.libs().iter().all(|lib| *lib == 0));
}

#[test]
fn stalled_network_moves_to_next_view() {
    // nothing to prepare beyond the LIB, so every timer expires
    let mut network = Network::new(4, 0);
    network.round();
    assert_eq!(network.libs(), vec![4; 4]);

    for _ in 0..20 {
        network.round();
        if network.nodes.iter().all(|node| node.current_view() == 1) {
            break;
        }
    }
    assert!(network.nodes.iter().all(|node| node.current_view() == 1));
    assert!(network.nodes.iter().all(|node| node.state() == PsmState::Committed));
}

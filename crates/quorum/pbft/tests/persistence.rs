//! The current view survives a restart through the view file.

use assert_matches::assert_matches;
use quorum_pbft::{
    test_utils::{producer_keys, MemoryChain},
    PbftConfig, PbftController, PbftError, PbftSignals, PsmState, PBFT_DB_FILENAME,
};
use std::fs;

fn controller(config: PbftConfig) -> Result<PbftController<MemoryChain>, PbftError> {
    let keys = producer_keys(4);
    let chain = MemoryChain::with_producers(&keys);
    PbftController::new(config, chain, Some(keys[0].clone()), PbftSignals::default())
}

#[test]
fn view_is_restored_and_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let config = PbftConfig::with_data_dir(dir.path());
    fs::write(dir.path().join(PBFT_DB_FILENAME), 5u32.to_le_bytes()).unwrap();

    let node = controller(config.clone()).unwrap();
    assert_eq!(node.current_view(), 5);
    assert_eq!(node.target_view(), 6);
    assert_eq!(node.state(), PsmState::Committed);
    assert!(!config.view_file().exists());

    drop(node);
    assert_eq!(fs::read(config.view_file()).unwrap(), 5u32.to_le_bytes());

    let node = controller(config).unwrap();
    assert_eq!(node.current_view(), 5);
}

#[test]
fn fresh_data_dir_starts_at_view_zero() {
    let dir = tempfile::tempdir().unwrap();
    let node = controller(PbftConfig::with_data_dir(dir.path().join("nested/pbft"))).unwrap();
    assert_eq!(node.current_view(), 0);
    assert_eq!(node.target_view(), 1);
}

#[test]
fn corrupt_view_file_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(PBFT_DB_FILENAME), [1u8]).unwrap();
    assert_matches!(
        controller(PbftConfig::with_data_dir(dir.path())),
        Err(PbftError::CorruptViewFile(1))
    );
}

#[test]
fn invalid_config_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = PbftConfig { view_change_timeout: 0, ..PbftConfig::with_data_dir(dir.path()) };
    assert_matches!(controller(config), Err(PbftError::InvalidConfig(_)));
}

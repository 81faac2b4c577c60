//! Quorum bookkeeping over an in-memory chain.

use quorum_pbft::{
    test_utils::{producer_keys, MemoryChain},
    BlockNum, PbftChain, PbftCommit, PbftDatabase, PbftPrepare, PbftSignals, SignedMessage, View,
};
use quorum_primitives::PrivateKey;

fn database(n: usize) -> (PbftDatabase<MemoryChain>, Vec<PrivateKey>) {
    let keys = producer_keys(n);
    let mut chain = MemoryChain::with_producers(&keys);
    chain.produce_blocks(5);
    (PbftDatabase::new(chain, Some(keys[0].clone()), PbftSignals::default(), 100), keys)
}

fn prepare(
    db: &PbftDatabase<MemoryChain>,
    key: &PrivateKey,
    view: View,
    num: BlockNum,
) -> PbftPrepare {
    let block = db.chain().fetch_block_by_num(num).unwrap();
    let chain_id = db.chain().chain_id();
    let mut prepare = PbftPrepare::new(view, num, block.id, key.public_key(), chain_id);
    prepare.sign(key);
    prepare
}

fn commit(
    db: &PbftDatabase<MemoryChain>,
    key: &PrivateKey,
    view: View,
    num: BlockNum,
) -> PbftCommit {
    let block = db.chain().fetch_block_by_num(num).unwrap();
    let mut commit = PbftCommit::new(view, num, block.id, key.public_key(), db.chain().chain_id());
    commit.sign(key);
    commit
}

#[test]
fn three_of_four_prepares_reach_quorum() {
    let (mut db, keys) = database(4);

    for key in &keys[..2] {
        let p = prepare(&db, key, 0, 5);
        db.add_pbft_prepare(p);
    }
    assert!(!db.should_prepared());

    let p = prepare(&db, &keys[2], 0, 5);
    db.add_pbft_prepare(p);
    assert!(db.should_prepared());
}

#[test]
fn duplicate_prepare_is_suppressed() {
    let (mut db, keys) = database(4);
    let block_id = db.chain().fetch_block_by_num(5).unwrap().id;

    let p = prepare(&db, &keys[1], 0, 5);
    db.add_pbft_prepare(p.clone());
    db.add_pbft_prepare(p.clone());
    assert_eq!(db.pbft_state(&block_id).unwrap().prepares.len(), 1);

    // a re-broadcast carries a fresh uuid but the same signer and view
    let mut resent = p;
    resent.uuid = quorum_pbft::new_uuid();
    db.add_pbft_prepare(resent);
    assert_eq!(db.pbft_state(&block_id).unwrap().prepares.len(), 1);
    assert!(!db.should_prepared());
}

#[test]
fn stranger_and_forged_votes_are_dropped() {
    let (mut db, keys) = database(4);
    let block_id = db.chain().fetch_block_by_num(5).unwrap().id;

    let stranger = PrivateKey::from_seed(b"stranger");
    let p = prepare(&db, &stranger, 0, 5);
    db.add_pbft_prepare(p);

    let mut forged = prepare(&db, &keys[1], 0, 5);
    forged.block_num = 4;
    db.add_pbft_prepare(forged);

    assert!(db.pbft_state(&block_id).is_none());
}

#[test]
fn commit_quorum_and_local_commit() {
    let (mut db, keys) = database(4);
    for key in &keys[..3] {
        let c = commit(&db, key, 1, 4);
        db.add_pbft_commit(c);
    }
    assert!(db.should_committed());
    assert_eq!(db.get_committed_view(), 1);

    db.commit_local();
    assert_eq!(db.chain().last_irreversible_block_num(), 4);
    assert!(!db.should_committed());
    // the committed view is still known after the block became irreversible
    assert_eq!(db.get_committed_view(), 1);

    // votes at or below the LIB no longer create state
    let late = commit(&db, &keys[3], 1, 3);
    db.add_pbft_commit(late);
    let id = db.chain().fetch_block_by_num(3).unwrap().id;
    assert_eq!(db.pbft_state(&id).unwrap().commits.len(), 3);
}

#[test]
fn view_change_thresholds() {
    let (mut db, keys) = database(4);
    let chain_id = db.chain().chain_id();
    let send = |db: &mut PbftDatabase<MemoryChain>, key: &PrivateKey, target: View| {
        let mut vc =
            quorum_pbft::PbftViewChange::new(0, target, None, None, key.public_key(), chain_id);
        vc.sign(key);
        db.add_pbft_view_change(vc);
    };

    send(&mut db, &keys[1], 3);
    send(&mut db, &keys[2], 3);
    send(&mut db, &keys[1], 2);
    assert_eq!(db.should_view_change(0), 3);
    assert_eq!(db.should_view_change(3), 0);
    assert!(!db.should_new_view(3));

    send(&mut db, &keys[3], 3);
    assert!(db.should_new_view(3));
    assert_eq!(db.get_proposed_new_view_num(), 3);
    // round-robin primary
    assert_eq!(db.get_new_view_primary_key(3), Some(keys[3].public_key()));
    assert!(!db.is_new_primary(3));
    assert!(db.generate_view_changed_certificate(3).is_some());
    assert!(db.generate_view_changed_certificate(2).is_none());
}

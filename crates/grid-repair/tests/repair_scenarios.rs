//! End-to-end repair scenarios over in-memory grids.
//!
//! A "local" replica grid with missing or corrupt blocks repairs itself
//! from a fully populated "peer" grid: the queue emits request batches, the
//! test fetches each block from the peer, verifies it, writes it locally,
//! and completes the repair. This is the same loop the replica's transport
//! and write path drive in production.

use grid_block::{
    GridMedia, IndexBlockBuilder, MemGrid, build_data_block, verify_block,
};
use grid_freeset::FreeSet;
use grid_repair::{RepairQueue, RepairQueueOptions, RepairResult, TableCallback};
use grid_types::{BlockAddress, BlockRef};
use std::cell::RefCell;
use std::rc::Rc;

const BATCH: usize = 4;

fn queue(blocks_max: usize, tables_max: usize) -> RepairQueue {
    RepairQueue::init(RepairQueueOptions {
        blocks_max,
        tables_max,
    })
    .expect("reserve queue")
}

fn recording_callback(log: &Rc<RefCell<Vec<(u64, RepairResult)>>>) -> TableCallback {
    let log = Rc::clone(log);
    Box::new(move |record, result| {
        log.borrow_mut().push((record.index_address.0, result));
    })
}

/// Publish a data block on the peer, returning its reference.
fn publish_data(peer: &MemGrid, address: u64, payload: &[u8]) -> BlockRef {
    let block = build_data_block(BlockAddress(address), payload);
    let header = verify_block(&block).expect("built block verifies");
    peer.write_block(header.address, &block).expect("peer write");
    BlockRef::new(header.address, header.checksum)
}

/// Publish a table (index block + content blocks) on the peer, returning
/// the index block's reference.
fn publish_table(peer: &MemGrid, index_address: u64, content_addresses: &[u64]) -> BlockRef {
    let mut builder = IndexBlockBuilder::new();
    for &address in content_addresses {
        builder.push(publish_data(peer, address, &address.to_le_bytes()));
    }
    let block = builder.build(BlockAddress(index_address));
    let header = verify_block(&block).expect("built index verifies");
    peer.write_block(header.address, &block).expect("peer write");
    BlockRef::new(header.address, header.checksum)
}

/// Drive the repair loop to quiescence: batch requests, fetch each block
/// from the peer, verify it, write it locally, complete the repair.
fn run_repairs(queue: &mut RepairQueue, local: &MemGrid, peer: &MemGrid) {
    let mut requests = [BlockRef::ZERO; BATCH];
    loop {
        let filled = queue.next_batch_of_block_requests(&mut requests);
        if filled == 0 {
            break;
        }
        for request in &requests[..filled] {
            if !queue.repair_waiting(request.address, request.checksum) {
                continue;
            }
            let block = peer.read_block(request.address).expect("peer holds block");
            let header = verify_block(&block).expect("peer block verifies");
            assert_eq!(header.address, request.address);
            assert_eq!(header.checksum, request.checksum);

            queue.repair_commence(request.address, request.checksum);
            local.write_block(request.address, &block).expect("local write");
            queue.repair_complete(&block);
        }
    }
}

#[test]
fn missing_block_repaired_from_peer() {
    let local = MemGrid::new(1024);
    let peer = MemGrid::new(1024);
    let target = publish_data(&peer, 100, b"replica payload");

    let mut queue = queue(4, 0);
    queue.enqueue_block(target.address, target.checksum);
    run_repairs(&mut queue, &local, &peer);

    assert!(queue.is_empty());
    let repaired = local.read_block(target.address).expect("repaired block");
    let header = verify_block(&repaired).expect("repaired block verifies");
    assert_eq!(header.checksum, target.checksum);
}

#[test]
fn corrupt_block_detected_and_repaired() {
    let local = MemGrid::new(1024);
    let peer = MemGrid::new(1024);
    let target = publish_data(&peer, 7, b"will be corrupted locally");

    // The local copy has a flipped body byte: the read path rejects it.
    let mut corrupt = peer.read_block(target.address).expect("peer copy");
    corrupt[grid_block::BLOCK_HEADER_SIZE] ^= 0x01;
    local.write_block(target.address, &corrupt).expect("local write");
    assert!(verify_block(&local.read_block(target.address).expect("read")).is_err());

    let mut queue = queue(4, 0);
    queue.enqueue_block(target.address, target.checksum);
    run_repairs(&mut queue, &local, &peer);

    let repaired = local.read_block(target.address).expect("read");
    assert!(verify_block(&repaired).is_ok());
}

#[test]
fn table_repair_fetches_index_then_content() {
    let local = MemGrid::new(1024);
    let peer = MemGrid::new(1024);
    let index = publish_table(&peer, 200, &[201, 202, 203]);

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut queue = queue(4, 1);
    queue.enqueue_table(recording_callback(&log), index.address, index.checksum);
    run_repairs(&mut queue, &local, &peer);

    assert!(queue.is_empty());
    assert_eq!(log.borrow().as_slice(), &[(200, RepairResult::Repaired)]);
    for address in [200, 201, 202, 203] {
        let block = local.read_block(BlockAddress(address)).expect("table block");
        assert!(verify_block(&block).is_ok());
    }
}

#[test]
fn release_mid_write_drains_through_checkpoint() {
    let local = MemGrid::new(1024);
    let peer = MemGrid::new(1024);
    let doomed = publish_data(&peer, 300, b"released mid-write");
    let survivor = publish_data(&peer, 301, b"stays faulty");

    let mut free_set = FreeSet::new(1024);
    free_set.acquire(doomed.address);
    free_set.acquire(survivor.address);

    let mut queue = queue(4, 0);
    queue.enqueue_block(doomed.address, doomed.checksum);
    queue.enqueue_block(survivor.address, survivor.checksum);

    // The doomed block's write is in flight when the checkpoint stages its
    // release.
    let block = peer.read_block(doomed.address).expect("peer copy");
    queue.repair_commence(doomed.address, doomed.checksum);
    free_set.release(doomed.address);

    queue.checkpoint_commence(&free_set);
    assert!(!queue.checkpoint_complete());

    // The in-flight write drains; it repairs nothing.
    local.write_block(doomed.address, &block).expect("drain write");
    queue.repair_complete(&block);
    assert!(queue.checkpoint_complete());

    // The free-set folds the release; only the survivor remains queued.
    assert_eq!(free_set.checkpoint(), 1);
    assert!(free_set.is_free(doomed.address));
    assert_eq!(queue.faulty_blocks_count(), 1);
    run_repairs(&mut queue, &local, &peer);
    assert!(queue.is_empty());
}

#[test]
fn scrubbed_index_block_upgrades_into_table_repair() {
    let local = MemGrid::new(1024);
    let peer = MemGrid::new(1024);
    let index = publish_table(&peer, 400, &[401, 402]);

    let mut queue = queue(4, 1);

    // The scrubber finds the index block first and its repair write is
    // already in flight when the table enqueue arrives.
    queue.enqueue_block(index.address, index.checksum);
    let in_flight = peer.read_block(index.address).expect("peer copy");
    queue.repair_commence(index.address, index.checksum);

    let log = Rc::new(RefCell::new(Vec::new()));
    queue.enqueue_table(recording_callback(&log), index.address, index.checksum);

    // The in-flight write completes and seeds the content-block repairs.
    local.write_block(index.address, &in_flight).expect("local write");
    queue.repair_complete(&in_flight);
    assert_eq!(queue.faulty_blocks_count(), 2);

    run_repairs(&mut queue, &local, &peer);
    assert!(queue.is_empty());
    assert_eq!(log.borrow().as_slice(), &[(400, RepairResult::Repaired)]);
}

#[test]
fn cancel_terminates_outstanding_tables() {
    let peer = MemGrid::new(1024);
    let first = publish_table(&peer, 500, &[501]);
    let second = publish_table(&peer, 510, &[511]);

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut queue = queue(4, 2);
    queue.enqueue_table(recording_callback(&log), first.address, first.checksum);
    queue.enqueue_table(recording_callback(&log), second.address, second.checksum);

    queue.cancel();
    assert_eq!(
        log.borrow().as_slice(),
        &[
            (500, RepairResult::Canceled),
            (510, RepairResult::Canceled)
        ]
    );
    assert!(queue.is_empty());

    // After re-initialization the queue is usable again.
    queue.reset();
    let local = MemGrid::new(1024);
    queue.enqueue_block(first.address, first.checksum);
    run_repairs(&mut queue, &local, &peer);
    assert!(queue.is_empty());
}

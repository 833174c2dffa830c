#![forbid(unsafe_code)]
//! Grid repair queue.
//!
//! When the replica reads a grid block and finds it corrupt or missing, it
//! enqueues a repair here: the block must be fetched from peer replicas and
//! written locally before the replica may treat it as present. Two fault
//! granularities interleave in one bounded structure: standalone blocks,
//! and whole tables (an index block plus every content block it references)
//! repaired as a unit with a per-table completion callback.
//!
//! The queue is single-threaded and run-to-completion. All storage is
//! reserved at [`RepairQueue::init`]; contract violations are fatal
//! assertions so the replica fails fast and deterministically.
//!
//! # Flow
//!
//! Readers call [`RepairQueue::enqueue_block`] / [`RepairQueue::enqueue_table`].
//! The transport periodically drains [`RepairQueue::next_batch_of_block_requests`]
//! and fetches the returned `(address, checksum)` pairs from peers. When a
//! reply arrives the grid calls [`RepairQueue::repair_commence`], performs
//! the disk write, then calls [`RepairQueue::repair_complete`] with the
//! written block. Checkpointing retires released blocks through
//! [`RepairQueue::checkpoint_commence`] / [`RepairQueue::checkpoint_complete`].

pub mod fault_map;
pub mod table_list;

pub use table_list::{ContentBlockSet, RepairResult, RepairTable, TableCallback, TableSlot};

use fault_map::FaultMap;
use grid_block::{BlockHeader, IndexBlock, block_body};
use grid_error::Result;
use grid_freeset::FreeSet;
use grid_types::{BlockAddress, BlockRef, Checksum, TABLE_CONTENT_BLOCKS_MAX};
use table_list::TableList;
use tracing::{debug, trace};

/// Sizing options for [`RepairQueue::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairQueueOptions {
    /// Slack reserved for standalone single-block repairs.
    pub blocks_max: usize,
    /// Maximum concurrent table repairs.
    pub tables_max: usize,
}

impl RepairQueueOptions {
    /// Worst-case fault count: the standalone slack plus every permitted
    /// table holding its maximum content-block footprint at once.
    #[must_use]
    pub fn fault_capacity(self) -> usize {
        self.tables_max
            .checked_mul(TABLE_CONTENT_BLOCKS_MAX as usize)
            .and_then(|reserve| self.blocks_max.checked_add(reserve))
            .expect("fault capacity overflow")
    }
}

/// Lifecycle state of one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Known faulty; a request will be emitted each cycle.
    Waiting,
    /// A repair write for this block is in flight.
    Writing,
    /// The block was released by a checkpoint mid-write; the write is being
    /// drained and its completion counts toward nothing.
    Aborting,
}

/// What a fault repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultProgress {
    /// Standalone single-block repair.
    Block,
    /// The index block of a table repair; its arrival seeds the table's
    /// content-block enqueues.
    TableIndex { table: TableSlot },
    /// One content block of a table repair at a known ordinal.
    TableContent { table: TableSlot, index: u32 },
}

impl FaultProgress {
    #[must_use]
    fn is_table(self) -> bool {
        !matches!(self, Self::Block)
    }
}

/// One entry of the fault map.
#[derive(Debug, Clone, Copy)]
pub struct FaultyBlock {
    pub checksum: Checksum,
    pub state: FaultState,
    pub progress: FaultProgress,
}

#[derive(Debug, Clone, Copy)]
struct Checkpointing {
    /// Released-while-writing faults still draining.
    aborting: usize,
}

/// Bounded queue of grid blocks awaiting repair from peers.
#[derive(Debug)]
pub struct RepairQueue {
    options: RepairQueueOptions,
    faulty_blocks: FaultMap<FaultyBlock>,
    /// Cycler position. Always less than the fault count when any fault
    /// exists, zero otherwise.
    faulty_blocks_repair_index: usize,
    enqueued_blocks_single: usize,
    enqueued_blocks_table: usize,
    faulty_tables: TableList,
    checkpointing: Option<Checkpointing>,
    canceling: bool,
}

impl RepairQueue {
    /// Reserve a queue for `options`. The only fallible path: capacity
    /// reservation may fail with `GridError::OutOfMemory`.
    pub fn init(options: RepairQueueOptions) -> Result<Self> {
        let faulty_blocks = FaultMap::with_capacity(options.fault_capacity())?;
        let faulty_tables = TableList::with_capacity(options.tables_max)?;
        Ok(Self {
            options,
            faulty_blocks,
            faulty_blocks_repair_index: 0,
            enqueued_blocks_single: 0,
            enqueued_blocks_table: 0,
            faulty_tables,
            checkpointing: None,
            canceling: false,
        })
    }

    #[must_use]
    pub fn options(&self) -> RepairQueueOptions {
        self.options
    }

    #[must_use]
    pub fn faulty_blocks_count(&self) -> usize {
        self.faulty_blocks.len()
    }

    #[must_use]
    pub fn faulty_tables_count(&self) -> usize {
        self.faulty_tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faulty_blocks.is_empty() && self.faulty_tables.is_empty()
    }

    #[must_use]
    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing.is_some()
    }

    #[must_use]
    pub fn is_canceling(&self) -> bool {
        self.canceling
    }

    /// The fault at `address`, if any.
    #[must_use]
    pub fn fault(&self, address: BlockAddress) -> Option<&FaultyBlock> {
        self.faulty_blocks.get(address)
    }

    /// The table record at `slot`. The slot must hold a live table.
    #[must_use]
    pub fn table(&self, slot: TableSlot) -> &RepairTable {
        self.faulty_tables.get(slot)
    }

    /// Slack available for standalone-block inserts after reserving the
    /// worst-case footprint of all permitted tables. This conservative
    /// reservation is what gives `tables_max` a hard bound without growth.
    #[must_use]
    pub fn enqueue_blocks_available(&self) -> usize {
        self.faulty_blocks.capacity()
            - self.enqueued_blocks_single
            - self.options.tables_max * TABLE_CONTENT_BLOCKS_MAX as usize
    }

    // ── Enqueue ─────────────────────────────────────────────────────────

    /// Record a standalone faulty block. Enqueuing the same
    /// `(address, checksum)` again is a no-op; a different checksum at the
    /// same address is a contract violation.
    pub fn enqueue_block(&mut self, address: BlockAddress, checksum: Checksum) {
        assert!(!self.canceling, "enqueue_block while canceling");
        assert!(
            self.enqueue_blocks_available() > 0,
            "enqueue_block without available capacity"
        );

        match self.faulty_blocks.get(address) {
            Some(fault) => {
                // The caller holds the authoritative block reference; two
                // different checksums for one address cannot both be right.
                assert_eq!(
                    fault.checksum, checksum,
                    "enqueue_block checksum mismatch at {address}"
                );
            }
            None => {
                self.faulty_blocks.insert(
                    address,
                    FaultyBlock {
                        checksum,
                        state: FaultState::Waiting,
                        progress: FaultProgress::Block,
                    },
                );
                self.enqueued_blocks_single += 1;
                trace!(
                    target: "grid::repair",
                    address = address.0,
                    "enqueue_block"
                );
            }
        }
        self.assert_invariants();
    }

    /// Begin a table repair keyed by its index block. Installs the table
    /// record, appends it to the FIFO, and inserts (or upgrades in place) a
    /// fault for the index block. Returns the table's slot.
    ///
    /// `callback` fires exactly once with the terminal [`RepairResult`].
    pub fn enqueue_table(
        &mut self,
        callback: TableCallback,
        address: BlockAddress,
        checksum: Checksum,
    ) -> TableSlot {
        assert!(!self.canceling, "enqueue_table while canceling");
        assert!(
            self.faulty_tables.len() < self.options.tables_max,
            "enqueue_table beyond tables_max"
        );
        assert!(
            !self.faulty_tables.contains_index_address(address),
            "table already enqueued at {address}"
        );

        let slot = self
            .faulty_tables
            .push_back(RepairTable::new(address, checksum, callback));

        match self.faulty_blocks.get_mut(address) {
            Some(fault) => {
                // The scrubber may have queued (and even started) this block
                // as a standalone repair; upgrade it in place.
                assert_eq!(
                    fault.checksum, checksum,
                    "enqueue_table checksum mismatch at {address}"
                );
                assert_eq!(
                    fault.progress,
                    FaultProgress::Block,
                    "index block already owned by a table"
                );
                assert_ne!(fault.state, FaultState::Aborting);
                fault.progress = FaultProgress::TableIndex { table: slot };
                self.enqueued_blocks_single -= 1;
                self.enqueued_blocks_table += 1;
            }
            None => {
                self.faulty_blocks.insert(
                    address,
                    FaultyBlock {
                        checksum,
                        state: FaultState::Waiting,
                        progress: FaultProgress::TableIndex { table: slot },
                    },
                );
                self.enqueued_blocks_table += 1;
            }
        }

        trace!(
            target: "grid::repair",
            address = address.0,
            tables = self.faulty_tables.len(),
            "enqueue_table"
        );
        self.assert_invariants();
        slot
    }

    /// Enqueue one content block on behalf of a table whose index block just
    /// arrived.
    fn enqueue_table_content(&mut self, table: TableSlot, content: BlockRef, ordinal: u32) {
        match self.faulty_blocks.get_mut(content.address) {
            Some(fault) => {
                assert_eq!(
                    fault.checksum, content.checksum,
                    "content block checksum mismatch at {}",
                    content.address
                );
                assert_eq!(
                    fault.progress,
                    FaultProgress::Block,
                    "content block already owned by a table"
                );
                assert_ne!(fault.state, FaultState::Aborting);

                let commenced = fault.state == FaultState::Writing;
                fault.progress = FaultProgress::TableContent {
                    table,
                    index: ordinal,
                };
                self.enqueued_blocks_single -= 1;
                self.enqueued_blocks_table += 1;

                if commenced {
                    // The standalone write already commenced, so the ordinal
                    // was never recorded; pre-set it here.
                    self.faulty_tables
                        .get_mut(table)
                        .content_blocks_received
                        .set(ordinal);
                }
            }
            None => {
                self.faulty_blocks.insert(
                    content.address,
                    FaultyBlock {
                        checksum: content.checksum,
                        state: FaultState::Waiting,
                        progress: FaultProgress::TableContent {
                            table,
                            index: ordinal,
                        },
                    },
                );
                self.enqueued_blocks_table += 1;
            }
        }
    }

    // ── Request cycling ─────────────────────────────────────────────────

    /// Fill `requests` with `(address, checksum)` pairs for faults still in
    /// `Waiting`, walking circularly from the cycler position. The position
    /// advances by the number of entries examined, so successive calls
    /// progress over the whole fault set even when `requests` is smaller
    /// than it. Returns the number of requests populated.
    pub fn next_batch_of_block_requests(&mut self, requests: &mut [BlockRef]) -> usize {
        assert!(!self.canceling, "request batch while canceling");

        let count = self.faulty_blocks.len();
        if count == 0 {
            assert_eq!(self.faulty_blocks_repair_index, 0);
            return 0;
        }

        let mut examined = 0;
        let mut filled = 0;
        while examined < count && filled < requests.len() {
            let position = (self.faulty_blocks_repair_index + examined) % count;
            let (address, fault) = self.faulty_blocks.get_index(position).expect("in range");
            if fault.state == FaultState::Waiting {
                requests[filled] = BlockRef::new(address, fault.checksum);
                filled += 1;
            }
            examined += 1;
        }
        self.faulty_blocks_repair_index = (self.faulty_blocks_repair_index + examined) % count;

        self.assert_invariants();
        filled
    }

    // ── Repair write path ───────────────────────────────────────────────

    /// True iff a fault exists at `address` with this checksum and is still
    /// `Waiting`. The gate the grid checks before beginning a repair write.
    #[must_use]
    pub fn repair_waiting(&self, address: BlockAddress, checksum: Checksum) -> bool {
        assert!(!self.canceling, "repair_waiting while canceling");
        match self.faulty_blocks.get(address) {
            Some(fault) => fault.checksum == checksum && fault.state == FaultState::Waiting,
            None => false,
        }
    }

    /// Transition `Waiting → Writing`. For a table content block, records
    /// the ordinal in the table's received-set, which must not already hold
    /// it.
    pub fn repair_commence(&mut self, address: BlockAddress, checksum: Checksum) {
        assert!(!self.canceling, "repair_commence while canceling");

        let fault = self
            .faulty_blocks
            .get_mut(address)
            .expect("repair_commence without fault");
        assert_eq!(
            fault.checksum, checksum,
            "repair_commence checksum mismatch at {address}"
        );
        assert_eq!(
            fault.state,
            FaultState::Waiting,
            "repair_commence on a fault that is not waiting"
        );
        fault.state = FaultState::Writing;
        let progress = fault.progress;

        if let FaultProgress::TableContent { table, index } = progress {
            self.faulty_tables
                .get_mut(table)
                .content_blocks_received
                .set(index);
        }
        self.assert_invariants();
    }

    /// Called when the repair write for a block finishes. The block header
    /// supplies the authoritative address and checksum; the fault must be
    /// `Writing` or `Aborting` and is removed.
    ///
    /// Completing a table's index block reads the index schema from the
    /// block and enqueues a fault per referenced content block. Content
    /// blocks are enqueued only now, so a block already mid-flight when the
    /// table enqueue arrived is handled by the in-place upgrade path rather
    /// than a duplicate insert.
    pub fn repair_complete(&mut self, block: &[u8]) {
        assert!(!self.canceling, "repair_complete while canceling");

        let header = BlockHeader::parse(block).expect("repair_complete on malformed block");
        let address = header.address;

        let fault = self
            .faulty_blocks
            .swap_remove(address)
            .expect("repair_complete without fault");
        self.clamp_repair_index();
        assert_eq!(
            fault.checksum, header.checksum,
            "repair_complete checksum mismatch at {address}"
        );

        if fault.progress.is_table() {
            self.enqueued_blocks_table -= 1;
        } else {
            self.enqueued_blocks_single -= 1;
        }

        match fault.state {
            FaultState::Waiting => panic!("repair_complete on a waiting fault"),
            FaultState::Aborting => {
                // The block was released by the checkpoint; its write was
                // merely drained. It counts toward no table's progress.
                let checkpointing = self
                    .checkpointing
                    .as_mut()
                    .expect("aborting fault outside a checkpoint");
                assert!(checkpointing.aborting > 0);
                checkpointing.aborting -= 1;
                trace!(
                    target: "grid::repair",
                    address = address.0,
                    remaining = checkpointing.aborting,
                    "repair_complete aborted"
                );
                self.assert_invariants();
                return;
            }
            FaultState::Writing => {}
        }

        match fault.progress {
            FaultProgress::Block => {
                trace!(
                    target: "grid::repair",
                    address = address.0,
                    "repair_complete block"
                );
            }
            FaultProgress::TableIndex { table } => {
                let index_block = IndexBlock::parse(block_body(block, &header))
                    .expect("repair_complete on malformed index block");
                {
                    let record = self.faulty_tables.get_mut(table);
                    assert_eq!(record.index_address, address);
                    assert_eq!(record.index_checksum, header.checksum);
                    assert!(
                        record.table_blocks_total.is_none(),
                        "index block completed twice"
                    );
                    record.table_blocks_total = Some(1 + index_block.content_blocks_used());
                }
                for ordinal in 0..index_block.content_blocks_used() {
                    self.enqueue_table_content(table, index_block.content_block(ordinal), ordinal);
                }
                trace!(
                    target: "grid::repair",
                    address = address.0,
                    content_blocks = index_block.content_blocks_used(),
                    "repair_complete table_index"
                );
                self.table_block_written(table);
            }
            FaultProgress::TableContent { table, index } => {
                assert!(
                    self.faulty_tables
                        .get(table)
                        .content_blocks_received
                        .is_set(index),
                    "content block completed without commence"
                );
                self.table_block_written(table);
            }
        }
        self.assert_invariants();
    }

    /// Count one completed write toward a table, firing its callback with
    /// `Repaired` once every block (index + content) has been written.
    fn table_block_written(&mut self, slot: TableSlot) {
        let done = {
            let record = self.faulty_tables.get_mut(slot);
            record.table_blocks_written += 1;
            let total = record
                .table_blocks_total
                .expect("table progress before index block");
            assert!(record.table_blocks_written <= total);
            record.table_blocks_written == total
        };

        if done {
            let mut record = self.faulty_tables.unlink(slot);
            debug!(
                target: "grid::repair",
                address = record.index_address.0,
                blocks = record.table_blocks_written,
                "table repaired"
            );
            let callback = record.take_callback();
            callback(&record, RepairResult::Repaired);
        }
    }

    // ── Checkpoint coordination ─────────────────────────────────────────

    /// Reconcile the queue against a newly staged free-set: released
    /// `Waiting` faults are removed outright, released `Writing` faults
    /// drain as `Aborting`, and released tables fire their callbacks with
    /// `Released`.
    pub fn checkpoint_commence(&mut self, free_set: &FreeSet) {
        assert!(!self.canceling, "checkpoint_commence while canceling");
        assert!(
            self.checkpointing.is_none(),
            "checkpoint_commence while already checkpointing"
        );

        let mut aborting = 0;
        let mut removed = 0;
        let mut position = 0;
        while position < self.faulty_blocks.len() {
            let (address, fault) = self.faulty_blocks.get_index(position).expect("in range");
            // Coherence: the queue never holds a fault for a free block.
            assert!(!free_set.is_free(address), "fault for free block {address}");

            if !free_set.is_released(address) {
                position += 1;
                continue;
            }

            let (state, progress) = (fault.state, fault.progress);
            match state {
                FaultState::Waiting => {
                    // Swap-remove moves the last entry into `position`, so
                    // stay put and re-examine this slot.
                    self.faulty_blocks.swap_remove_index(position);
                    if progress.is_table() {
                        self.enqueued_blocks_table -= 1;
                        debug_assert!(self.released_fault_table_released(free_set, progress));
                    } else {
                        self.enqueued_blocks_single -= 1;
                    }
                    removed += 1;
                }
                FaultState::Writing => {
                    self.faulty_blocks
                        .get_index_mut(position)
                        .expect("in range")
                        .1
                        .state = FaultState::Aborting;
                    aborting += 1;
                    position += 1;
                }
                FaultState::Aborting => {
                    panic!("aborting fault predates checkpoint_commence")
                }
            }
        }
        self.clamp_repair_index();

        // Walk the table FIFO, dropping released tables in place.
        let mut released_tables = 0;
        let mut prev = None;
        let mut cursor = self.faulty_tables.head();
        while let Some(slot) = cursor {
            let next = self.faulty_tables.next(slot);
            let index_address = self.faulty_tables.get(slot).index_address;
            if free_set.is_released(index_address) {
                let mut record = self.faulty_tables.unlink_after(prev, slot);
                let callback = record.take_callback();
                callback(&record, RepairResult::Released);
                released_tables += 1;
            } else {
                assert!(
                    !free_set.is_free(index_address),
                    "table for free index block {index_address}"
                );
                prev = Some(slot);
            }
            cursor = next;
        }

        self.checkpointing = Some(Checkpointing { aborting });
        debug!(
            target: "grid::repair",
            aborting,
            removed,
            released_tables,
            "checkpoint_commence"
        );
        self.assert_invariants();
    }

    /// True iff every write aborted by [`Self::checkpoint_commence`] has
    /// drained. Clears the checkpoint on success; otherwise the caller polls
    /// again after each subsequent [`Self::repair_complete`].
    pub fn checkpoint_complete(&mut self) -> bool {
        assert!(!self.canceling, "checkpoint_complete while canceling");
        let checkpointing = self
            .checkpointing
            .expect("checkpoint_complete without checkpoint_commence");

        if checkpointing.aborting > 0 {
            return false;
        }

        self.checkpointing = None;
        for (address, fault) in self.faulty_blocks.iter() {
            assert_ne!(
                fault.state,
                FaultState::Aborting,
                "aborting fault {address} survived checkpoint"
            );
        }
        debug!(target: "grid::repair", "checkpoint_complete");
        self.assert_invariants();
        true
    }

    // ── Cancellation ────────────────────────────────────────────────────

    /// Drop every outstanding fault and fire every table callback with
    /// `Canceled`, in FIFO order. Latches `canceling`: all further public
    /// operations except [`Self::reset`] are contract violations until the
    /// queue is re-initialized.
    pub fn cancel(&mut self) {
        assert!(!self.canceling, "cancel while already canceling");
        self.canceling = true;

        let mut canceled_tables = 0;
        while let Some(mut record) = self.faulty_tables.pop_front() {
            let callback = record.take_callback();
            callback(&record, RepairResult::Canceled);
            canceled_tables += 1;
        }

        debug!(
            target: "grid::repair",
            faults = self.faulty_blocks.len(),
            tables = canceled_tables,
            "cancel"
        );
        self.faulty_blocks.clear();
        self.enqueued_blocks_single = 0;
        self.enqueued_blocks_table = 0;
        self.faulty_blocks_repair_index = 0;
        self.checkpointing = None;
        self.assert_invariants();
    }

    /// Restore the post-init empty state, clearing the `canceling` latch.
    /// Outstanding tables must have been drained (by completion or
    /// [`Self::cancel`]) first: their callbacks fire exactly once, and reset
    /// will not fire them.
    pub fn reset(&mut self) {
        assert!(
            self.faulty_tables.is_empty(),
            "reset with tables outstanding"
        );
        self.faulty_blocks.clear();
        self.enqueued_blocks_single = 0;
        self.enqueued_blocks_table = 0;
        self.faulty_blocks_repair_index = 0;
        self.checkpointing = None;
        self.canceling = false;
        self.assert_invariants();
    }

    // ── Invariants ──────────────────────────────────────────────────────

    fn clamp_repair_index(&mut self) {
        let count = self.faulty_blocks.len();
        if count == 0 {
            self.faulty_blocks_repair_index = 0;
        } else {
            self.faulty_blocks_repair_index %= count;
        }
    }

    fn released_fault_table_released(&self, free_set: &FreeSet, progress: FaultProgress) -> bool {
        // A released table fault implies its whole table was released; the
        // LSM frees a table's index and content blocks together.
        let table = match progress {
            FaultProgress::Block => return true,
            FaultProgress::TableIndex { table } | FaultProgress::TableContent { table, .. } => {
                table
            }
        };
        free_set.is_released(self.faulty_tables.get(table).index_address)
    }

    fn assert_invariants(&self) {
        assert_eq!(
            self.faulty_blocks.len(),
            self.enqueued_blocks_single + self.enqueued_blocks_table
        );
        assert!(
            self.enqueued_blocks_table
                <= self.options.tables_max * TABLE_CONTENT_BLOCKS_MAX as usize
        );
        assert!(self.faulty_tables.len() <= self.options.tables_max);
        if self.faulty_blocks.is_empty() {
            assert_eq!(self.faulty_blocks_repair_index, 0);
        } else {
            assert!(self.faulty_blocks_repair_index < self.faulty_blocks.len());
        }

        #[cfg(debug_assertions)]
        self.verify_detailed();
    }

    /// Full recount of the accounting partition and per-fault/table state.
    #[cfg(debug_assertions)]
    fn verify_detailed(&self) {
        let mut single = 0;
        let mut table = 0;
        let mut aborting = 0;
        for (_, fault) in self.faulty_blocks.iter() {
            if fault.progress.is_table() {
                table += 1;
            } else {
                single += 1;
            }
            if fault.state == FaultState::Aborting {
                aborting += 1;
            }
        }
        assert_eq!(single, self.enqueued_blocks_single);
        assert_eq!(table, self.enqueued_blocks_table);
        match self.checkpointing {
            Some(checkpointing) => assert_eq!(aborting, checkpointing.aborting),
            None => assert_eq!(aborting, 0),
        }

        for (_, record) in self.faulty_tables.iter() {
            if let Some(total) = record.table_blocks_total {
                assert!(record.table_blocks_written <= total);
                assert!(record.content_blocks_received.count() < total);
            } else {
                assert_eq!(record.table_blocks_written, 0);
            }
        }
    }
}

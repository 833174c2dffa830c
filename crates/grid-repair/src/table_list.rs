//! Repair-table records and the intrusive FIFO that threads them.
//!
//! Table records live in a fixed arena of `tables_max` slots owned by the
//! queue; the FIFO is a singly-linked chain of slot indices, so linking and
//! unlinking never move a record and a [`TableSlot`] held by a fault record
//! stays valid for the table's whole lifetime.

use grid_error::{GridError, Result};
use grid_types::{BlockAddress, Checksum, TABLE_CONTENT_BLOCKS_MAX};
use std::fmt;

/// Terminal outcome of a table repair, delivered through the table's
/// callback exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairResult {
    /// Every block of the table was fetched and written locally.
    Repaired,
    /// The queue was canceled before the table completed.
    Canceled,
    /// The table's blocks were released by a checkpoint before it completed.
    Released,
}

/// Completion callback of a table repair.
pub type TableCallback = Box<dyn FnOnce(&RepairTable, RepairResult)>;

const CONTENT_SET_WORDS: usize = (TABLE_CONTENT_BLOCKS_MAX as usize + 63) / 64;

/// Fixed-width bitset over content-block ordinals of one table.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentBlockSet {
    words: [u64; CONTENT_SET_WORDS],
}

impl ContentBlockSet {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_set(&self, ordinal: u32) -> bool {
        assert!(ordinal < TABLE_CONTENT_BLOCKS_MAX, "ordinal out of range");
        self.words[ordinal as usize / 64] >> (ordinal % 64) & 1 == 1
    }

    /// Set `ordinal`. It must not already be set.
    pub fn set(&mut self, ordinal: u32) {
        assert!(ordinal < TABLE_CONTENT_BLOCKS_MAX, "ordinal out of range");
        let word = &mut self.words[ordinal as usize / 64];
        let mask = 1_u64 << (ordinal % 64);
        assert!(*word & mask == 0, "content ordinal already received");
        *word |= mask;
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl fmt::Debug for ContentBlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentBlockSet({}/{})", self.count(), TABLE_CONTENT_BLOCKS_MAX)
    }
}

/// Arena index of a table record. Stable for the table's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableSlot(u32);

impl TableSlot {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One in-flight table repair: the index block that names the table plus
/// progress over its content blocks.
pub struct RepairTable {
    /// The index block identifying this table.
    pub index_address: BlockAddress,
    pub index_checksum: Checksum,
    /// Content-block ordinals whose repair writes have commenced.
    pub content_blocks_received: ContentBlockSet,
    /// Writes completed so far (index block included).
    pub table_blocks_written: u32,
    /// `None` until the index block arrives; then `1 + content_block_count`.
    pub table_blocks_total: Option<u32>,
    callback: Option<TableCallback>,
    next: Option<TableSlot>,
}

impl RepairTable {
    pub(crate) fn new(
        index_address: BlockAddress,
        index_checksum: Checksum,
        callback: TableCallback,
    ) -> Self {
        Self {
            index_address,
            index_checksum,
            content_blocks_received: ContentBlockSet::empty(),
            table_blocks_written: 0,
            table_blocks_total: None,
            callback: Some(callback),
            next: None,
        }
    }

    pub(crate) fn take_callback(&mut self) -> TableCallback {
        self.callback
            .take()
            .expect("table callback fires exactly once")
    }
}

impl fmt::Debug for RepairTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairTable")
            .field("index_address", &self.index_address)
            .field("index_checksum", &self.index_checksum)
            .field("content_blocks_received", &self.content_blocks_received)
            .field("table_blocks_written", &self.table_blocks_written)
            .field("table_blocks_total", &self.table_blocks_total)
            .field("callback_pending", &self.callback.is_some())
            .field("next", &self.next)
            .finish()
    }
}

/// Fixed arena of table slots threaded into a FIFO.
#[derive(Debug)]
pub struct TableList {
    slots: Vec<Option<RepairTable>>,
    free: Vec<TableSlot>,
    head: Option<TableSlot>,
    tail: Option<TableSlot>,
    len: usize,
}

impl TableList {
    /// Reserve an arena of exactly `tables_max` slots.
    pub fn with_capacity(tables_max: usize) -> Result<Self> {
        let slot_count = u32::try_from(tables_max).map_err(|_| GridError::OutOfMemory)?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(tables_max)
            .map_err(|_| GridError::OutOfMemory)?;
        let mut free = Vec::new();
        free.try_reserve_exact(tables_max)
            .map_err(|_| GridError::OutOfMemory)?;

        for i in (0..slot_count).rev() {
            slots.push(None);
            free.push(TableSlot(i));
        }
        Ok(Self {
            slots,
            free,
            head: None,
            tail: None,
            len: 0,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn head(&self) -> Option<TableSlot> {
        self.head
    }

    /// The slot after `slot` in FIFO order.
    #[must_use]
    pub fn next(&self, slot: TableSlot) -> Option<TableSlot> {
        self.get(slot).next
    }

    #[must_use]
    pub fn get(&self, slot: TableSlot) -> &RepairTable {
        self.slots[slot.index()].as_ref().expect("vacant table slot")
    }

    pub fn get_mut(&mut self, slot: TableSlot) -> &mut RepairTable {
        self.slots[slot.index()].as_mut().expect("vacant table slot")
    }

    /// Append a table to the FIFO tail, returning its slot.
    pub fn push_back(&mut self, table: RepairTable) -> TableSlot {
        let slot = self.free.pop().expect("table list full");
        assert!(self.slots[slot.index()].is_none());
        assert!(table.next.is_none());
        self.slots[slot.index()] = Some(table);

        match self.tail {
            Some(tail) => self.get_mut(tail).next = Some(slot),
            None => {
                assert!(self.head.is_none());
                self.head = Some(slot);
            }
        }
        self.tail = Some(slot);
        self.len += 1;
        slot
    }

    /// Unlink `slot`, whose predecessor in the FIFO is `prev` (`None` when
    /// `slot` is the head). The slot is returned to the free pool.
    pub fn unlink_after(&mut self, prev: Option<TableSlot>, slot: TableSlot) -> RepairTable {
        match prev {
            None => assert_eq!(self.head, Some(slot), "slot is not the head"),
            Some(p) => assert_eq!(self.get(p).next, Some(slot), "prev does not link slot"),
        }

        let mut table = self.slots[slot.index()].take().expect("vacant table slot");
        let next = table.next.take();
        match prev {
            None => self.head = next,
            Some(p) => self.get_mut(p).next = next,
        }
        if self.tail == Some(slot) {
            self.tail = prev;
        }
        self.free.push(slot);
        self.len -= 1;
        table
    }

    /// Unlink `slot` by walking the FIFO to find its predecessor.
    pub fn unlink(&mut self, slot: TableSlot) -> RepairTable {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == slot {
                return self.unlink_after(prev, slot);
            }
            prev = Some(current);
            cursor = self.next(current);
        }
        panic!("table slot not linked");
    }

    /// Unlink and return the FIFO head.
    pub fn pop_front(&mut self) -> Option<RepairTable> {
        self.head.map(|head| self.unlink_after(None, head))
    }

    /// Iterate `(slot, table)` pairs in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = (TableSlot, &RepairTable)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let table = self.get(slot);
            cursor = table.next;
            Some((slot, table))
        })
    }

    /// Whether any linked table is keyed by this index-block address.
    #[must_use]
    pub fn contains_index_address(&self, address: BlockAddress) -> bool {
        self.iter().any(|(_, table)| table.index_address == address)
    }
}

//! Fixed-capacity indexed associative store for fault records.
//!
//! An address-keyed map with both O(1) by-key lookup and O(1) by-ordinal
//! access, so the request cycler can walk entries positionally while the
//! repair paths look up by address. Removal is swap-with-last: only the
//! moved entry's position changes, which the cycler tolerates by clamping
//! its index after each mutation.
//!
//! The map is pre-sized at init and never grows; callers gate inserts on
//! the queue's capacity accounting, so `insert` asserts rather than
//! reallocating.

use grid_error::{GridError, Result};
use grid_types::BlockAddress;
use std::collections::HashMap;

#[derive(Debug)]
pub struct FaultMap<V> {
    entries: Vec<(BlockAddress, V)>,
    index: HashMap<BlockAddress, usize>,
    capacity: usize,
}

impl<V> FaultMap<V> {
    /// Reserve a map for exactly `capacity` entries.
    ///
    /// This is the only allocation the map ever performs; failure surfaces
    /// as `GridError::OutOfMemory`.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|_| GridError::OutOfMemory)?;
        let mut index = HashMap::new();
        index
            .try_reserve(capacity)
            .map_err(|_| GridError::OutOfMemory)?;
        Ok(Self {
            entries,
            index,
            capacity,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn contains(&self, address: BlockAddress) -> bool {
        self.index.contains_key(&address)
    }

    #[must_use]
    pub fn get(&self, address: BlockAddress) -> Option<&V> {
        self.index
            .get(&address)
            .map(|&position| &self.entries[position].1)
    }

    pub fn get_mut(&mut self, address: BlockAddress) -> Option<&mut V> {
        match self.index.get(&address) {
            Some(&position) => Some(&mut self.entries[position].1),
            None => None,
        }
    }

    /// Current position of `address` in the dense entry order.
    #[must_use]
    pub fn position(&self, address: BlockAddress) -> Option<usize> {
        self.index.get(&address).copied()
    }

    #[must_use]
    pub fn get_index(&self, position: usize) -> Option<(BlockAddress, &V)> {
        self.entries.get(position).map(|(a, v)| (*a, v))
    }

    pub fn get_index_mut(&mut self, position: usize) -> Option<(BlockAddress, &mut V)> {
        self.entries.get_mut(position).map(|(a, v)| (*a, v))
    }

    /// Insert a new entry. The address must be absent and the map below
    /// capacity.
    pub fn insert(&mut self, address: BlockAddress, value: V) {
        assert!(self.entries.len() < self.capacity, "fault map full");
        let previous = self.index.insert(address, self.entries.len());
        assert!(previous.is_none(), "duplicate fault address");
        self.entries.push((address, value));
    }

    /// Remove by address via swap-with-last. Order beyond the moved entry
    /// is preserved.
    pub fn swap_remove(&mut self, address: BlockAddress) -> Option<V> {
        let position = self.index.get(&address).copied()?;
        let (_, value) = self.swap_remove_index(position);
        Some(value)
    }

    /// Remove the entry at `position` via swap-with-last.
    pub fn swap_remove_index(&mut self, position: usize) -> (BlockAddress, V) {
        assert!(position < self.entries.len(), "position out of range");
        let (address, value) = self.entries.swap_remove(position);
        self.index.remove(&address);
        if position < self.entries.len() {
            let moved = self.entries[position].0;
            *self.index.get_mut(&moved).expect("moved entry is indexed") = position;
        }
        (address, value)
    }

    /// Drop every entry, retaining capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Iterate entries in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockAddress, &V)> + '_ {
        self.entries.iter().map(|(a, v)| (*a, v))
    }
}

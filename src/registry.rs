//! Fixed-capacity slot table for connected peers.
//!
//! The registry is an arena addressed by slot index. A slot is either empty
//! or holds exactly one handle; the index carries no meaning beyond storage
//! location. The multiplex loop owns the registry exclusively, so there is no
//! locking anywhere in this module.

/// Ordered fixed-size collection of client slots.
///
/// Generic over the handle type so the table can be exercised without real
/// sockets. A full registry is not an error from the registry's point of
/// view; [`Registry::find_free_slot`] returning `None` is the signal the
/// caller must act on.
pub struct Registry<T> {
    slots: Vec<Option<T>>,
}

impl<T> Registry<T> {
    /// Creates a registry with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Index of the first unoccupied slot, or `None` when the table is full.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    /// Stores `handle` at `slot`. The caller guarantees the slot was free.
    pub fn assign(&mut self, slot: usize, handle: T) {
        debug_assert!(self.slots[slot].is_none(), "slot {slot} already occupied");
        self.slots[slot] = Some(handle);
    }

    /// Clears `slot`, returning the handle it held.
    pub fn release(&mut self, slot: usize) -> Option<T> {
        self.slots[slot].take()
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Occupied slots in slot order. Stable across calls as long as no
    /// assign or release happens in between.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|handle| (index, handle)))
    }

    /// Snapshot of the occupied indices, for iteration that mutates the
    /// registry along the way (broadcast, teardown).
    pub fn occupied_indices(&self) -> Vec<usize> {
        self.occupied().map(|(index, _)| index).collect()
    }
}

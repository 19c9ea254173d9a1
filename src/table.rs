use std::num::NonZeroUsize;

/// Fixed-capacity ring of tracked connections.
///
/// Admission always writes to the slot under the cursor and then advances it,
/// so once the ring has wrapped the oldest admitted entry is the one replaced.
/// Slots freed by [`ConnectionTable::remove`] are only reused when the cursor
/// comes back around to them; activity plays no part in who gets evicted.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Box<[Option<T>]>,
    cursor: usize,
    len: usize,
}

impl<T> ConnectionTable<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: (0..capacity.get()).map(|_| None).collect(),
            cursor: 0,
            len: 0,
        }
    }

    /// Stores `conn` at the cursor and returns the slot it landed in together
    /// with the entry it displaced, which the caller is expected to close.
    pub fn admit(&mut self, conn: T) -> (usize, Option<T>) {
        let slot = self.cursor;
        let evicted = self.slots[slot].replace(conn);
        if evicted.is_none() {
            self.len += 1;
        }
        self.cursor = (self.cursor + 1) % self.slots.len();
        (slot, evicted)
    }

    /// Empties `slot` without touching the cursor.
    pub fn remove(&mut self, slot: usize) -> Option<T> {
        let removed = self.slots.get_mut(slot)?.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)?.as_ref()
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, conn)| Some((slot, conn.as_ref()?)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next admission will target.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> ConnectionTable<u32> {
        ConnectionTable::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn fills_then_evicts_oldest() {
        let mut t = table(3);
        assert_eq!(t.admit(1), (0, None));
        assert_eq!(t.admit(2), (1, None));
        assert_eq!(t.admit(3), (2, None));
        assert_eq!(t.len(), 3);

        assert_eq!(t.admit(4), (0, Some(1)));
        assert_eq!(t.admit(5), (1, Some(2)));
        assert_eq!(t.len(), 3);
        assert_eq!(t.iter().map(|(_, c)| *c).collect::<Vec<_>>(), [4, 5, 3]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut t = table(4);
        for i in 0..50 {
            t.admit(i);
            assert!(t.len() <= t.capacity());
        }
        assert_eq!(t.len(), 4);
        assert_eq!(t.iter().map(|(_, c)| *c).collect::<Vec<_>>(), [48, 49, 46, 47]);
    }

    #[test]
    fn remove_keeps_cursor() {
        let mut t = table(3);
        t.admit(1);
        t.admit(2);
        assert_eq!(t.cursor(), 2);

        assert_eq!(t.remove(0), Some(1));
        assert_eq!(t.remove(0), None);
        assert_eq!(t.cursor(), 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.iter().collect::<Vec<_>>(), [(1, &2)]);
    }

    #[test]
    fn freed_slot_does_not_shield_older_entries() {
        let mut t = table(3);
        t.admit(1);
        t.admit(2);
        t.admit(3);
        t.remove(2);

        // The cursor is back at slot 0, so entry 1 goes even though slot 2 is free.
        assert_eq!(t.admit(4), (0, Some(1)));
        assert_eq!(t.admit(5), (1, Some(2)));
        assert_eq!(t.admit(6), (2, None));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn single_slot_always_replaces() {
        let mut t = table(1);
        assert_eq!(t.admit(1), (0, None));
        assert_eq!(t.admit(2), (0, Some(1)));
        assert_eq!(t.get(0), Some(&2));
        assert_eq!(t.cursor(), 0);
    }

    #[test]
    fn out_of_range_slots_are_empty() {
        let mut t = table(2);
        assert_eq!(t.get(5), None);
        assert_eq!(t.remove(5), None);
        assert!(t.is_empty());
    }
}

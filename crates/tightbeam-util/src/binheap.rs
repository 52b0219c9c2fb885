/// A binary min-heap with O(log n) removal of arbitrary entries.
///
/// Same as `std::collections::BinaryHeap`, but `insert` returns a
/// [`NodeKey`] that can later remove that exact entry without a linear
/// scan. Performance characteristics:
///
///   insert()   O(log(size))
///   remove()   O(log(size))
///   top()      O(1)
///
/// Entries live in an internal slot arena; keys carry a generation
/// counter, so a key whose entry has already been removed is simply
/// stale and `remove`/`contains` treat it as absent. The ordering of an
/// entry relative to the others must not change while it is in the heap,
/// which holds trivially here because the heap owns its values.
#[derive(Debug)]
pub struct BinHeap<T> {
    /// Heap positions; `heap[0]` is the minimum. Values are slot indices.
    heap: Vec<usize>,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

/// Key identifying one live entry in a [`BinHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKey {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Option<Entry<T>>,
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    /// Back-pointer into `heap`, kept in sync on every swap.
    pos: usize,
}

impl<T: Ord> BinHeap<T> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self { heap: Vec::new(), slots: Vec::new(), free: Vec::new() }
    }

    /// Number of entries currently in the heap.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the heap holds no entries.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts a value, returning the key that can remove it later.
    pub fn insert(&mut self, value: T) -> NodeKey {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot { generation: 0, entry: None });
                self.slots.len() - 1
            }
        };
        let pos = self.heap.len();
        debug_assert!(self.slots[slot].entry.is_none());
        self.slots[slot].entry = Some(Entry { value, pos });
        self.heap.push(slot);
        self.sift_up(pos);
        NodeKey { slot, generation: self.slots[slot].generation }
    }

    /// Returns true if `key` still refers to a live entry.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.slots
            .get(key.slot)
            .map(|s| s.generation == key.generation && s.entry.is_some())
            .unwrap_or(false)
    }

    /// Removes the entry identified by `key`, returning its value.
    /// A stale or unknown key returns `None` and leaves the heap intact.
    pub fn remove(&mut self, key: NodeKey) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        let entry = self.slots[key.slot].entry.take().expect("checked by contains");
        self.slots[key.slot].generation += 1;
        self.free.push(key.slot);

        let pos = entry.pos;
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        self.heap.pop();
        if pos < self.heap.len() {
            let moved_slot = self.heap[pos];
            self.entry_mut(moved_slot).pos = pos;
            // The entry that filled the hole may need to move either way.
            self.sift_down(pos);
            let current = self.entry(moved_slot).pos;
            self.sift_up(current);
        }
        Some(entry.value)
    }

    /// Peeks at the minimum entry without removing it.
    pub fn top(&self) -> Option<&T> {
        self.heap.first().map(|&slot| &self.entry(slot).value)
    }

    /// Key of the minimum entry, if any.
    pub fn top_key(&self) -> Option<NodeKey> {
        self.heap
            .first()
            .map(|&slot| NodeKey { slot, generation: self.slots[slot].generation })
    }

    /// Removes and returns the minimum entry.
    pub fn pop(&mut self) -> Option<T> {
        self.top_key().and_then(|key| self.remove(key))
    }

    /// Validates the complete internal structure. Intended for tests.
    ///
    /// Panics if the heap property is violated at any parent, if any
    /// back-pointer disagrees with the entry's actual position, or if the
    /// live-slot count disagrees with the heap length.
    pub fn validate(&self) {
        let live = self.slots.iter().filter(|s| s.entry.is_some()).count();
        assert_eq!(live, self.heap.len(), "live slots != heap length");
        for (pos, &slot) in self.heap.iter().enumerate() {
            let entry = self.entry(slot);
            assert_eq!(entry.pos, pos, "stale back-pointer at position {}", pos);
            if pos > 0 {
                let parent = self.entry(self.heap[(pos - 1) / 2]);
                assert!(
                    parent.value <= entry.value,
                    "heap property violated at position {}",
                    pos
                );
            }
        }
    }

    fn entry(&self, slot: usize) -> &Entry<T> {
        self.slots[slot].entry.as_ref().expect("slot in heap must be occupied")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<T> {
        self.slots[slot].entry.as_mut().expect("slot in heap must be occupied")
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.entry(self.heap[a]).value < self.entry(self.heap[b]).value
    }

    fn swap_positions(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let slot_a = self.heap[a];
        let slot_b = self.heap[b];
        self.entry_mut(slot_a).pos = a;
        self.entry_mut(slot_b).pos = b;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap_positions(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut min = pos;
            if left < self.heap.len() && self.less(left, min) {
                min = left;
            }
            if right < self.heap.len() && self.less(right, min) {
                min = right;
            }
            if min == pos {
                break;
            }
            self.swap_positions(pos, min);
            pos = min;
        }
    }
}

impl<T: Ord> Default for BinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basics() {
        let mut h: BinHeap<i32> = BinHeap::new();
        assert_eq!(h.len(), 0);
        assert!(h.is_empty());

        let k1 = h.insert(10);
        let _k2 = h.insert(20);
        let _k3 = h.insert(30);
        let k4 = h.insert(40);
        assert_eq!(h.len(), 4);
        assert!(!h.is_empty());
        h.validate();

        assert_eq!(h.top(), Some(&10));
        assert_eq!(h.remove(k1), Some(10));
        assert!(!h.contains(k1));

        assert_eq!(h.top(), Some(&20));
        assert_eq!(h.pop(), Some(20));

        // Remove a node not on top
        assert_eq!(h.remove(k4), Some(40));
        h.validate();

        assert_eq!(h.top(), Some(&30));
        assert_eq!(h.pop(), Some(30));
        assert!(h.is_empty());
    }

    #[test]
    fn test_removal_sequence_from_middle() {
        // Insert [30, 40, 20, 10]; top is 10. Remove it, top is 20.
        // Remove 40 (internal, not top); heap stays valid; top still 20.
        let mut h: BinHeap<i32> = BinHeap::new();
        let _k30 = h.insert(30);
        let k40 = h.insert(40);
        let _k20 = h.insert(20);
        let k10 = h.insert(10);

        assert_eq!(h.top(), Some(&10));
        assert_eq!(h.remove(k10), Some(10));
        assert_eq!(h.top(), Some(&20));

        assert_eq!(h.remove(k40), Some(40));
        h.validate();
        assert_eq!(h.top(), Some(&20));

        assert_eq!(h.pop(), Some(20));
        assert_eq!(h.top(), Some(&30));
    }

    #[test]
    fn test_max_heap_via_reverse() {
        use std::cmp::Reverse;
        let mut h: BinHeap<Reverse<i32>> = BinHeap::new();
        for v in [10, 30, 40, 20] {
            h.insert(Reverse(v));
        }
        h.validate();
        for expected in [40, 30, 20, 10] {
            assert_eq!(h.pop(), Some(Reverse(expected)));
        }
    }

    #[test]
    fn test_stale_key_is_ignored() {
        let mut h: BinHeap<i32> = BinHeap::new();
        let k = h.insert(5);
        assert_eq!(h.remove(k), Some(5));
        // Slot is reused, but the generation moved on.
        let k2 = h.insert(6);
        assert_eq!(h.remove(k), None);
        assert!(h.contains(k2));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_duplicate_values() {
        let mut h: BinHeap<i32> = BinHeap::new();
        let a = h.insert(7);
        let b = h.insert(7);
        assert_eq!(h.remove(a), Some(7));
        assert!(h.contains(b));
        assert_eq!(h.pop(), Some(7));
        assert!(h.is_empty());
    }

    // Replicates the same behavior with a simple sorted-vec model, with
    // poor performance. Keys are paired so removals hit the same logical
    // entry in both structures.
    #[test]
    fn test_fuzz_against_model() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x7167);
        let mut real: BinHeap<u32> = BinHeap::new();
        let mut model: Vec<(u32, NodeKey)> = Vec::new();

        // The chance of insert/remove is equal, so the heap grows and
        // shrinks like a random walk staying around O(sqrt(M)) entries.
        for _ in 0..10_000 {
            real.validate();
            assert_eq!(model.len(), real.len());
            if let Some(top) = real.top() {
                let model_min = model.iter().map(|(v, _)| *v).min().unwrap();
                assert_eq!(*top, model_min);
            }
            if rng.random_bool(0.5) {
                let v: u32 = rng.random_range(0..100);
                let key = real.insert(v);
                model.push((v, key));
            } else if !model.is_empty() {
                let index = rng.random_range(0..model.len());
                let (v, key) = model.swap_remove(index);
                assert_eq!(real.remove(key), Some(v));
            }
        }
        real.validate();
    }
}

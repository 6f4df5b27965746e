use crate::hashing::HashMap;
use std::hash::Hash;

const NULL_INDEX: u32 = u32::MAX;

#[derive(Copy, Clone)]
struct EvictionQueueNode {
    next: u32,
    previous: u32,
}

impl Default for EvictionQueueNode {
    fn default() -> Self {
        EvictionQueueNode {
            next: NULL_INDEX,
            previous: NULL_INDEX,
        }
    }
}

/// Queue of eviction candidates ordered by when they were last freed. New entries go to the head
/// (most recently freed), eviction pops from the tail (least recently freed).
///
/// Unlike a bounded LRU cache this never drops entries on its own. Pushing a key that is already
/// queued moves it back to the head instead of adding a duplicate, so a resource that is released,
/// reclaimed and released again is only considered once, at its latest position.
pub struct EvictionQueue<K, V> {
    // Doubly linked list with NULL_INDEX for "null" and using indices instead of pointers
    head: u32,
    tail: u32,
    nodes: Vec<EvictionQueueNode>,

    // Slots that line up with the doubly linked list
    entries: Vec<Option<(K, V)>>,

    // Slots that were popped and can be reused by the next push
    free_slots: Vec<u32>,

    // Lookup for the index a key is stored at
    lookup: HashMap<K, u32>,
}

impl<K: Clone + Eq + Hash, V> Default for EvictionQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash, V> EvictionQueue<K, V> {
    pub fn new() -> Self {
        EvictionQueue {
            head: NULL_INDEX,
            tail: NULL_INDEX,
            nodes: Vec::default(),
            entries: Vec::default(),
            free_slots: Vec::default(),
            lookup: HashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn contains(
        &self,
        k: &K,
    ) -> bool {
        self.lookup.contains_key(k)
    }

    // For debug, can throw in to try and find when state is invalid
    #[cfg(test)]
    fn check_list(&self) {
        let mut iter = self.head;
        let mut previous = NULL_INDEX;
        let mut count = 0;
        while iter != NULL_INDEX {
            assert_eq!(self.nodes[iter as usize].previous, previous);
            previous = iter;
            iter = self.nodes[iter as usize].next;
            count += 1;
        }

        assert_eq!(previous, self.tail);
        assert_eq!(count, self.lookup.len());
    }

    // Splice a node out of the list, leaving it unlinked
    fn unlink(
        &mut self,
        node_index: u32,
    ) {
        let node = self.nodes[node_index as usize];

        if node.previous != NULL_INDEX {
            self.nodes[node.previous as usize].next = node.next;
        } else {
            assert_eq!(self.head, node_index);
            self.head = node.next;
        }

        if node.next != NULL_INDEX {
            self.nodes[node.next as usize].previous = node.previous;
        } else {
            assert_eq!(self.tail, node_index);
            self.tail = node.previous;
        }

        self.nodes[node_index as usize] = EvictionQueueNode::default();
    }

    // Make an unlinked node the new head
    fn link_at_head(
        &mut self,
        node_index: u32,
    ) {
        self.nodes[node_index as usize] = EvictionQueueNode {
            next: self.head,
            previous: NULL_INDEX,
        };

        if self.head != NULL_INDEX {
            assert_eq!(self.nodes[self.head as usize].previous, NULL_INDEX);
            self.nodes[self.head as usize].previous = node_index;
        } else {
            // List was empty, this node is also the tail
            self.tail = node_index;
        }

        self.head = node_index;
    }

    fn allocate_slot(&mut self) -> u32 {
        if let Some(slot) = self.free_slots.pop() {
            return slot;
        }

        let slot = self.nodes.len() as u32;
        assert_ne!(slot, NULL_INDEX);
        self.nodes.push(EvictionQueueNode::default());
        self.entries.push(None);
        slot
    }

    /// Insert at the most-recently-freed end. If the key is already queued, its value is replaced
    /// and it moves to the most-recently-freed end.
    pub fn push(
        &mut self,
        k: K,
        v: V,
    ) {
        if let Some(&node_index) = self.lookup.get(&k) {
            self.unlink(node_index);
            self.link_at_head(node_index);
            self.entries[node_index as usize] = Some((k, v));
            return;
        }

        let node_index = self.allocate_slot();
        self.entries[node_index as usize] = Some((k.clone(), v));
        self.lookup.insert(k, node_index);
        self.link_at_head(node_index);
    }

    /// Remove and return the least-recently-freed entry
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        if self.tail == NULL_INDEX {
            return None;
        }

        let node_index = self.tail;
        self.unlink(node_index);
        let (k, v) = self.entries[node_index as usize].take()?;
        self.lookup.remove(&k);
        self.free_slots.push(node_index);
        Some((k, v))
    }

    #[cfg(test)]
    fn peek_oldest(&self) -> Option<(&K, &V)> {
        if self.tail == NULL_INDEX {
            return None;
        }

        self.entries[self.tail as usize]
            .as_ref()
            .map(|(k, v)| (k, v))
    }

    pub fn remove(
        &mut self,
        k: &K,
    ) -> Option<V> {
        let node_index = self.lookup.remove(k)?;
        self.unlink(node_index);
        self.free_slots.push(node_index);
        self.entries[node_index as usize].take().map(|(_, v)| v)
    }

    // Keys in eviction order, oldest first
    #[cfg(test)]
    fn keys_oldest_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut iter = self.tail;
        while iter != NULL_INDEX {
            if let Some((k, _)) = &self.entries[iter as usize] {
                keys.push(k.clone());
            }
            iter = self.nodes[iter as usize].previous;
        }

        keys
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_pops_least_recently_freed() {
        let mut queue = EvictionQueue::new();
        queue.push(0, "a");
        queue.push(1, "b");
        queue.push(2, "c");
        queue.check_list();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_oldest(), Some((0, "a")));
        assert_eq!(queue.pop_oldest(), Some((1, "b")));
        assert_eq!(queue.pop_oldest(), Some((2, "c")));
        assert_eq!(queue.pop_oldest(), None);
        assert!(queue.is_empty());
        queue.check_list();
    }

    #[test]
    fn check_repush_moves_to_most_recent() {
        let mut queue = EvictionQueue::new();
        queue.push(0, 0);
        queue.push(1, 1);
        queue.push(2, 2);

        // Freed again, so it should now be the last to go
        queue.push(0, 10);
        queue.check_list();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.keys_oldest_first(), vec![1, 2, 0]);

        assert_eq!(queue.pop_oldest(), Some((1, 1)));
        assert_eq!(queue.pop_oldest(), Some((2, 2)));
        assert_eq!(queue.pop_oldest(), Some((0, 10)));
    }

    #[test]
    fn check_remove() {
        let mut queue = EvictionQueue::new();
        queue.push(0, 0);
        queue.push(1, 1);
        queue.push(2, 2);

        assert_eq!(queue.remove(&1), Some(1));
        assert_eq!(queue.remove(&1), None);
        queue.check_list();
        assert!(!queue.contains(&1));

        queue.remove(&0);
        queue.remove(&2);
        queue.check_list();
        assert!(queue.is_empty());
        assert!(queue.peek_oldest().is_none());

        // Freed slots get reused
        queue.push(3, 3);
        queue.push(4, 4);
        queue.check_list();
        assert_eq!(queue.peek_oldest(), Some((&3, &3)));
        assert_eq!(queue.keys_oldest_first(), vec![3, 4]);
    }
}

//! Doubly linked list of cancelation callbacks, stored in a slab.
//!
//! Links are slab keys. Every entry also carries a list-unique id so a
//! registration that outlived its entry cannot remove whatever reused the key.

use super::cancel_ref::CancelationRef;
use slab::Slab;
use std::fmt;
use std::sync::Weak;

pub(crate) enum Callback {
    User(Box<dyn FnOnce() + Send + 'static>),
    /// Cancels a linked child source.
    Link {
        child: Weak<CancelationRef>,
        source_id: u32,
    },
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::User(_) => f.write_str("User(..)"),
            Callback::Link { source_id, .. } => f.debug_struct("Link").field("source_id", source_id).finish(),
        }
    }
}

struct Entry {
    id: u64,
    prev: Option<usize>,
    next: Option<usize>,
    callback: Callback,
}

#[derive(Default)]
pub(crate) struct CallbackList {
    entries: Slab<Entry>,
    head: Option<usize>,
    tail: Option<usize>,
    next_id: u64,
}

impl CallbackList {
    /// Appends `callback`, returning its key and id.
    pub(crate) fn push_back(&mut self, callback: Callback) -> (usize, u64) {
        self.next_id += 1;
        let id = self.next_id;
        let key = self.entries.insert(Entry {
            id,
            prev: self.tail,
            next: None,
            callback,
        });
        match self.tail {
            Some(tail) => self.entries[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        (key, id)
    }

    pub(crate) fn contains(&self, key: usize, id: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.id == id)
    }

    pub(crate) fn remove(&mut self, key: usize, id: u64) -> Option<Callback> {
        if !self.contains(key, id) {
            return None;
        }
        let entry = self.entries.remove(key);
        self.unlink(entry.prev, entry.next);
        Some(entry.callback)
    }

    /// Removes the most recently added callback.
    pub(crate) fn pop_back(&mut self) -> Option<(u64, Callback)> {
        let key = self.tail?;
        let entry = self.entries.remove(key);
        self.unlink(entry.prev, entry.next);
        Some((entry.id, entry.callback))
    }

    pub(crate) fn drain(&mut self) -> Vec<Callback> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some((_, callback)) = self.pop_back() {
            drained.push(callback);
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unlink(&mut self, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Callback {
        let log = log.clone();
        Callback::User(Box::new(move || log.lock().unwrap().push(value)))
    }

    fn run(callback: Callback) {
        match callback {
            Callback::User(f) => f(),
            Callback::Link { .. } => unreachable!(),
        }
    }

    #[test]
    fn pops_in_reverse_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        for value in 1..=4 {
            list.push_back(recording(&log, value));
        }
        while let Some((_, callback)) = list.pop_back() {
            run(callback);
        }
        assert_eq!(*log.lock().unwrap(), [4, 3, 2, 1]);
        assert!(list.is_empty());
    }

    #[test]
    fn removal_from_the_middle_keeps_links_intact() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        let _first = list.push_back(recording(&log, 1));
        let (key, id) = list.push_back(recording(&log, 2));
        let _third = list.push_back(recording(&log, 3));

        assert!(list.remove(key, id).is_some());
        assert!(list.remove(key, id).is_none());
        assert_eq!(list.len(), 2);

        for callback in list.drain() {
            run(callback);
        }
        assert_eq!(*log.lock().unwrap(), [3, 1]);
    }

    #[test]
    fn reused_keys_are_told_apart_by_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        let (key, id) = list.push_back(recording(&log, 1));
        list.remove(key, id);

        let (reused, fresh) = list.push_back(recording(&log, 2));
        assert_eq!(reused, key);
        assert!(!list.contains(key, id));
        assert!(list.contains(reused, fresh));
        assert!(list.remove(key, id).is_none());
    }
}

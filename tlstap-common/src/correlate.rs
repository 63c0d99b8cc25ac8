//! Pairs a read entry with its matching return.
//!
//! A call goes `NoContext -> AwaitingReturn -> NoContext`. A second begin for
//! the same identity overwrites the first (last write wins), and an end with
//! nothing stored is a silent miss.

use crate::{BufferDescriptor, CallIdentity};

/// Backing storage for in-flight read contexts.
pub trait ContextStore {
    fn get(&self, id: &CallIdentity) -> Option<BufferDescriptor>;
    fn insert(&self, id: &CallIdentity, desc: &BufferDescriptor) -> Result<(), i64>;
    fn remove(&self, id: &CallIdentity);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    NoContext,
    AwaitingReturn(BufferDescriptor),
}

pub struct Correlator<'a, S: ContextStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ContextStore + ?Sized> Correlator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Records the caller buffer for `id`, replacing any earlier one.
    #[inline(always)]
    pub fn begin(&self, id: &CallIdentity, desc: &BufferDescriptor) -> Result<(), i64> {
        self.store.insert(id, desc)
    }

    /// Takes the stored buffer for `id`. The entry is consumed either way.
    #[inline(always)]
    pub fn end(&self, id: &CallIdentity) -> Option<BufferDescriptor> {
        let desc = self.store.get(id)?;
        self.store.remove(id);
        Some(desc)
    }

    pub fn state(&self, id: &CallIdentity) -> CallState {
        match self.store.get(id) {
            Some(desc) => CallState::AwaitingReturn(desc),
            None => CallState::NoContext,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore {
        entries: RefCell<HashMap<CallIdentity, BufferDescriptor>>,
        capacity: Option<usize>,
    }

    impl ContextStore for MemStore {
        fn get(&self, id: &CallIdentity) -> Option<BufferDescriptor> {
            self.entries.borrow().get(id).copied()
        }

        fn insert(&self, id: &CallIdentity, desc: &BufferDescriptor) -> Result<(), i64> {
            let mut entries = self.entries.borrow_mut();
            if let Some(cap) = self.capacity {
                if entries.len() >= cap && !entries.contains_key(id) {
                    return Err(-7);
                }
            }
            entries.insert(*id, *desc);
            Ok(())
        }

        fn remove(&self, id: &CallIdentity) {
            self.entries.borrow_mut().remove(id);
        }
    }

    fn id(pid: u64, lwt_id: u64) -> CallIdentity {
        CallIdentity { pid, lwt_id }
    }

    fn buf(ptr: u64, len: u64) -> BufferDescriptor {
        BufferDescriptor { ptr, len, cap: len, len_ptr: 0 }
    }

    #[test]
    fn test_begin_then_end_returns_descriptor_once() {
        let store = MemStore::default();
        let correlator = Correlator::new(&store);
        correlator.begin(&id(1, 7), &buf(0x1000, 64)).unwrap();

        assert_eq!(correlator.state(&id(1, 7)), CallState::AwaitingReturn(buf(0x1000, 64)));
        assert_eq!(correlator.end(&id(1, 7)), Some(buf(0x1000, 64)));
        assert_eq!(correlator.state(&id(1, 7)), CallState::NoContext);
        assert_eq!(correlator.end(&id(1, 7)), None);
    }

    #[test]
    fn test_second_begin_overwrites() {
        let store = MemStore::default();
        let correlator = Correlator::new(&store);
        correlator.begin(&id(1, 7), &buf(0x1000, 64)).unwrap();
        correlator.begin(&id(1, 7), &buf(0x2000, 128)).unwrap();

        assert_eq!(correlator.end(&id(1, 7)), Some(buf(0x2000, 128)));
        assert_eq!(correlator.end(&id(1, 7)), None);
    }

    #[test]
    fn test_end_without_begin_is_miss() {
        let store = MemStore::default();
        assert_eq!(Correlator::new(&store).end(&id(3, 3)), None);
    }

    #[test]
    fn test_identities_are_independent() {
        let store = MemStore::default();
        let correlator = Correlator::new(&store);
        correlator.begin(&id(1, 7), &buf(0x1000, 64)).unwrap();
        correlator.begin(&id(1, 8), &buf(0x2000, 64)).unwrap();
        correlator.begin(&id(2, 7), &buf(0x3000, 64)).unwrap();

        assert_eq!(correlator.end(&id(1, 8)), Some(buf(0x2000, 64)));
        assert_eq!(correlator.end(&id(2, 7)), Some(buf(0x3000, 64)));
        assert_eq!(correlator.end(&id(1, 7)), Some(buf(0x1000, 64)));
    }

    #[test]
    fn test_store_failure_is_reported() {
        let store = MemStore { capacity: Some(1), ..Default::default() };
        let correlator = Correlator::new(&store);
        correlator.begin(&id(1, 1), &buf(0x1000, 8)).unwrap();
        assert_eq!(correlator.begin(&id(1, 2), &buf(0x2000, 8)), Err(-7));
        assert_eq!(correlator.state(&id(1, 2)), CallState::NoContext);
    }
}

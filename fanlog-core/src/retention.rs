use std::sync::{Arc, Mutex};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::{
    error::{Error, Result},
    event::LogEvent,
    utils::lock,
};

/// Smallest bounded capacity a store accepts.
pub const MIN_CAPACITY: usize = 5;

/// Insertion-ordered history of dispatched events.
///
/// Writers serialize on the capacity lock and publish a fresh snapshot with
/// every mutation. Readers only load the published snapshot and never wait on
/// a writer.
pub struct RetentionStore {
    capacity: Mutex<Option<usize>>,
    events: ArcSwap<Vec<Arc<LogEvent>>>,
    last: ArcSwapOption<LogEvent>,
}

impl RetentionStore {
    /// `None` keeps every event.
    pub fn new(capacity: Option<usize>) -> Result<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            capacity: Mutex::new(capacity),
            events: ArcSwap::from_pointee(Vec::new()),
            last: ArcSwapOption::empty(),
        })
    }

    pub fn unbounded() -> Self {
        Self {
            capacity: Mutex::new(None),
            events: ArcSwap::from_pointee(Vec::new()),
            last: ArcSwapOption::empty(),
        }
    }

    pub fn append(&self, event: Arc<LogEvent>) {
        let capacity = lock(&self.capacity);
        let current = self.events.load();
        let keep = match *capacity {
            Some(cap) => cap.saturating_sub(1).min(current.len()),
            None => current.len(),
        };
        let mut events = Vec::with_capacity(keep + 1);
        events.extend_from_slice(&current[current.len() - keep..]);
        events.push(event.clone());
        self.events.store(Arc::new(events));
        self.last.store(Some(event));
    }

    pub fn capacity(&self) -> Option<usize> {
        *lock(&self.capacity)
    }

    /// Changes the cap; a smaller cap evicts the excess oldest events at once.
    pub fn set_capacity(&self, capacity: Option<usize>) -> Result<()> {
        check_capacity(capacity)?;
        let mut current_capacity = lock(&self.capacity);
        *current_capacity = capacity;
        let current = self.events.load();
        if let Some(cap) = capacity
            && current.len() > cap
        {
            let events = current[current.len() - cap..].to_vec();
            self.events.store(Arc::new(events));
        }
        Ok(())
    }

    /// Oldest first. The returned vector is never touched again by the store.
    pub fn get_all(&self) -> Arc<Vec<Arc<LogEvent>>> {
        self.events.load_full()
    }

    pub fn get_last(&self) -> Option<Arc<LogEvent>> {
        self.last.load_full()
    }

    pub fn len(&self) -> usize {
        self.events.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_capacity(capacity: Option<usize>) -> Result<()> {
    match capacity {
        Some(n) if n < MIN_CAPACITY => Err(Error::InvalidCapacity(n)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::NO_TAGS, level::Level};

    fn event(message: impl Into<String>) -> Arc<LogEvent> {
        Arc::new(LogEvent::new(Level::Info, message, None, NO_TAGS))
    }

    fn messages(store: &RetentionStore) -> Vec<String> {
        store
            .get_all()
            .iter()
            .map(|e| e.message().to_string())
            .collect()
    }

    #[test]
    fn test_keeps_most_recent() {
        let store = RetentionStore::new(Some(5)).unwrap();
        for i in 0..100 {
            store.append(event(i.to_string()));
        }
        assert_eq!(messages(&store), vec!["95", "96", "97", "98", "99"]);
        assert_eq!(store.get_last().unwrap().message(), "99");
    }

    #[test]
    fn test_rejects_small_capacity() {
        assert!(matches!(
            RetentionStore::new(Some(4)),
            Err(Error::InvalidCapacity(4))
        ));
        let store = RetentionStore::unbounded();
        assert!(store.set_capacity(Some(0)).is_err());
        assert_eq!(store.capacity(), None);
        assert!(store.set_capacity(Some(MIN_CAPACITY)).is_ok());
    }

    #[test]
    fn test_shrinking_evicts_excess_at_once() {
        let store = RetentionStore::unbounded();
        for i in 0..20 {
            store.append(event(i.to_string()));
        }
        assert_eq!(store.len(), 20);
        store.set_capacity(Some(6)).unwrap();
        assert_eq!(messages(&store), vec!["14", "15", "16", "17", "18", "19"]);
        store.set_capacity(None).unwrap();
        store.append(event("20"));
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let store = RetentionStore::new(Some(5)).unwrap();
        assert!(store.get_last().is_none());
        assert!(store.get_all().is_empty());
        store.append(event("a"));
        let before = store.get_all();
        // unchanged store hands out the same snapshot
        assert!(Arc::ptr_eq(&before, &store.get_all()));
        for m in ["b", "c", "d", "e", "f"] {
            store.append(event(m));
        }
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].message(), "a");
        assert_eq!(messages(&store), vec!["b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_concurrent_readers() {
        let store = Arc::new(RetentionStore::new(Some(50)).unwrap());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = store.get_all();
                        assert!(snapshot.len() <= 50);
                        let numbers: Vec<usize> = snapshot
                            .iter()
                            .map(|e| e.message().parse().unwrap())
                            .collect();
                        assert!(numbers.windows(2).all(|w| w[0] + 1 == w[1]));
                    }
                })
            })
            .collect();
        for i in 0..1000 {
            store.append(event(i.to_string()));
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(), 50);
    }

    #[test]
    fn test_readers_do_not_wait_on_writer() {
        let store = Arc::new(RetentionStore::new(Some(5)).unwrap());
        store.append(event("a"));
        let _writer = lock(&store.capacity);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reader = store.clone();
        std::thread::spawn(move || {
            let _ = tx.send((reader.get_all().len(), reader.len()));
        });
        let seen = rx.recv_timeout(std::time::Duration::from_secs(1));
        assert_eq!(seen.ok(), Some((1, 1)));
    }
}

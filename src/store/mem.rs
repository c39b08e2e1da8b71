//! In-memory storage adapter backing the default runtime and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Adapter, StoreError};
use crate::message::topic::Topic;

#[derive(Debug, Clone)]
struct SubEntry {
    id: u32,
    topic: Topic,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u32,
    subscriptions: HashMap<u32, Vec<SubEntry>>,
    log: HashMap<u64, Vec<u8>>,
}

/// Process-local adapter. Subscription matching uses the parsed part
/// sequences, so wildcard subscriptions are honored at `get` time.
#[derive(Debug, Default)]
pub struct MemAdapter {
    inner: Mutex<Inner>,
    open: AtomicBool,
}

impl MemAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<parking_lot::MutexGuard<'_, Inner>, StoreError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.inner.lock())
    }
}

impl Adapter for MemAdapter {
    fn open(&self, _path: &str) -> Result<(), StoreError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "mem"
    }

    fn new_id(&self) -> Result<u32, StoreError> {
        let mut inner = self.guard()?;
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    fn put(&self, contract: u32, id: u32, topic: &Topic, payload: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        let entries = inner.subscriptions.entry(contract).or_default();
        entries.retain(|e| e.id != id);
        entries.push(SubEntry {
            id,
            topic: topic.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn get(&self, contract: u32, topic: &Topic) -> Result<Vec<Vec<u8>>, StoreError> {
        let inner = self.guard()?;
        let Some(entries) = inner.subscriptions.get(&contract) else {
            return Err(StoreError::NotFound);
        };
        let matched: Vec<Vec<u8>> = entries
            .iter()
            .filter(|e| e.topic.matches(topic))
            .map(|e| e.payload.clone())
            .collect();
        if matched.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(matched)
    }

    fn delete(&self, contract: u32, id: u32, _topic: &Topic) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        let emptied = match inner.subscriptions.get_mut(&contract) {
            Some(entries) => {
                entries.retain(|e| e.id != id);
                entries.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.subscriptions.remove(&contract);
        }
        Ok(())
    }

    fn append(&self, del: bool, key: u64, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if del {
            inner.log.remove(&key);
        } else {
            inner.log.insert(key, data.to_vec());
        }
        Ok(())
    }

    fn write(&self) -> Result<(), StoreError> {
        self.guard().map(|_| ())
    }

    fn recovery(&self, reset: bool) -> Result<HashMap<u64, Vec<u8>>, StoreError> {
        let mut inner = self.guard()?;
        if reset {
            Ok(std::mem::take(&mut inner.log))
        } else {
            Ok(inner.log.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(expr: &[u8], contract: u32, wildcard: bool) -> Topic {
        let mut t = crate::message::topic::parse_key(expr);
        t.parse(contract, wildcard);
        t
    }

    #[test]
    fn closed_adapter_refuses_calls() {
        let adapter = MemAdapter::new();
        assert!(!adapter.is_open());
        assert!(matches!(adapter.new_id(), Err(StoreError::Closed)));
        adapter.open("").expect("open");
        assert!(adapter.is_open());
    }

    #[test]
    fn wildcard_subscription_matches_static_publish() {
        let adapter = MemAdapter::new();
        adapter.open("").expect("open");
        let contract = 9;

        let sub = topic(b"k/unit8...", contract, true);
        adapter.put(contract, 1, &sub, b"\x00AAAA").expect("put");

        let published = topic(b"k/unit8.b.b1", contract, false);
        let records = adapter.get(contract, &published).expect("get");
        assert_eq!(records, vec![b"\x00AAAA".to_vec()]);

        let elsewhere = topic(b"k/unit9.b", contract, false);
        assert!(matches!(
            adapter.get(contract, &elsewhere),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn delete_removes_by_id() {
        let adapter = MemAdapter::new();
        adapter.open("").expect("open");
        let sub = topic(b"k/a.b", 1, true);
        adapter.put(1, 4, &sub, b"p").expect("put");
        adapter.delete(1, 4, &sub).expect("delete");
        assert!(matches!(
            adapter.get(1, &topic(b"k/a.b", 1, false)),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn recovery_reset_drains_the_log() {
        let adapter = MemAdapter::new();
        adapter.open("").expect("open");
        adapter.append(false, 10, b"entry").expect("append");
        let drained = adapter.recovery(true).expect("recovery");
        assert_eq!(drained.len(), 1);
        assert!(adapter.recovery(false).expect("recovery").is_empty());
    }
}

//! Messages, per-connection id minting and subscription bookkeeping.

pub mod topic;

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::{codec, Packet, Publish, Qos};

/// Session-scoped message id used for inflight persistence keys. Derived
/// from the connection id so `(connid, mid)` stays unique for the session.
pub type Mid = u32;

/// A routed message: id, QoS, trimmed topic and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: u16,
    pub qos: u8,
    pub topic: Bytes,
    pub payload: Bytes,
}

impl Message {
    /// On-wire byte count of the message as a PUBLISH frame; feeds the
    /// outbound byte meter.
    pub fn size(&self) -> u64 {
        codec::encode(&Packet::Publish(Publish {
            message_id: self.message_id,
            qos: Qos::try_from(self.qos).unwrap_or_default(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            forwarded: false,
        }))
        .len() as u64
    }
}

/// Per-connection arena of 16-bit message ids for QoS > 0 publishes. Ids are
/// minted on send and reclaimed when the handshake completes; the id space
/// only has to stay unique for the lifetime of one session.
#[derive(Debug, Default)]
pub struct MessageIds {
    inner: Mutex<MessageIdsInner>,
}

#[derive(Debug)]
struct MessageIdsInner {
    inflight: HashMap<u16, ()>,
    next: u16,
}

impl Default for MessageIdsInner {
    fn default() -> Self {
        Self {
            inflight: HashMap::new(),
            next: u16::MAX,
        }
    }
}

impl MessageIds {
    /// Mint a fresh non-zero id.
    pub fn next_id(&self) -> u16 {
        let mut inner = self.inner.lock();
        loop {
            let candidate = inner.next;
            inner.next = if candidate <= 1 { u16::MAX } else { candidate - 1 };
            if candidate != 0 && !inner.inflight.contains_key(&candidate) {
                inner.inflight.insert(candidate, ());
                return candidate;
            }
        }
    }

    /// Release an id after PUBACK or PUBCOMP; unknown ids are ignored.
    pub fn free_id(&self, id: u16) {
        self.inner.lock().inflight.remove(&id);
    }

    pub fn is_inflight(&self, id: u16) -> bool {
        self.inner.lock().inflight.contains_key(&id)
    }
}

/// One reference-counted subscription held by a connection.
#[derive(Debug, Clone)]
pub struct Stat {
    pub id: u32,
    pub topic: Bytes,
    pub refcount: u32,
}

/// The per-connection subscription set, keyed by the raw topic key. The
/// first increment and the last decrement are the edges that touch the
/// store and the cluster; everything in between is local refcounting.
#[derive(Debug, Default)]
pub struct Stats {
    stats: HashMap<String, Stat>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exist(&self, key: &str) -> bool {
        self.stats.contains_key(key)
    }

    /// Add one reference; returns true when this was the first.
    pub fn increment(&mut self, topic: &[u8], key: &str, id: u32) -> bool {
        match self.stats.get_mut(key) {
            Some(stat) => {
                stat.refcount += 1;
                false
            }
            None => {
                self.stats.insert(
                    key.to_owned(),
                    Stat {
                        id,
                        topic: Bytes::copy_from_slice(topic),
                        refcount: 1,
                    },
                );
                true
            }
        }
    }

    /// Drop one reference; returns `(was_last, id)`. Unknown keys return
    /// `(false, 0)`.
    pub fn decrement(&mut self, key: &str) -> (bool, u32) {
        let Some(stat) = self.stats.get_mut(key) else {
            return (false, 0);
        };
        stat.refcount -= 1;
        if stat.refcount == 0 {
            let id = stat.id;
            self.stats.remove(key);
            (true, id)
        } else {
            (false, stat.id)
        }
    }

    pub fn all(&self) -> Vec<Stat> {
        self.stats.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_until_freed() {
        let ids = MessageIds::default();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert!(ids.is_inflight(a));
        ids.free_id(a);
        assert!(!ids.is_inflight(a));
    }

    #[test]
    fn freed_id_is_reusable() {
        let ids = MessageIds::default();
        let a = ids.next_id();
        ids.free_id(a);
        let mut seen = a;
        for _ in 0..u16::MAX {
            seen = ids.next_id();
            ids.free_id(seen);
            if seen == a {
                break;
            }
        }
        assert_eq!(seen, a);
    }

    #[test]
    fn stats_edges_fire_on_first_and_last() {
        let mut stats = Stats::new();
        assert!(stats.increment(b"a.b", "key", 7));
        assert!(!stats.increment(b"a.b", "key", 9));
        assert!(stats.exist("key"));

        let (last, id) = stats.decrement("key");
        assert!(!last);
        assert_eq!(id, 7);
        let (last, id) = stats.decrement("key");
        assert!(last);
        assert_eq!(id, 7);
        assert!(!stats.exist("key"));

        let (last, id) = stats.decrement("key");
        assert!(!last);
        assert_eq!(id, 0);
    }

    #[test]
    fn refcount_matches_existence() {
        let mut stats = Stats::new();
        for _ in 0..3 {
            stats.increment(b"t", "k", 1);
        }
        assert_eq!(stats.all().len(), 1);
        assert_eq!(stats.all()[0].refcount, 3);
        for _ in 0..3 {
            stats.decrement("k");
        }
        assert!(stats.is_empty());
    }
}

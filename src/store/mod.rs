//! Storage contract consumed by the broker core.
//!
//! The core never implements the storage engine; it talks to a synchronous
//! [`Adapter`] through the [`SubscriptionStore`] and [`MessageLog`] wrappers
//! and assumes nothing about durability beyond the call's return.

pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::core::config::StoreConfig;
use crate::message::topic::Topic;
use crate::message::Mid;
use crate::protocol::{codec, Packet, PacketType, Qos};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no messages were found")]
    NotFound,
    #[error("store adapter is not open")]
    Closed,
    #[error("unknown store adapter {0}")]
    UnknownAdapter(String),
    #[error("store: {0}")]
    Adapter(String),
}

/// Contract a storage engine must fulfill. All calls are synchronous.
pub trait Adapter: Send + Sync {
    /// Open and configure the adapter.
    fn open(&self, path: &str) -> Result<(), StoreError>;
    /// Close the adapter.
    fn close(&self) -> Result<(), StoreError>;
    /// Whether the adapter is ready for use.
    fn is_open(&self) -> bool;
    /// Name of the adapter.
    fn name(&self) -> &'static str;

    /// Generate an id that can later be used to store and delete a
    /// subscription record.
    fn new_id(&self) -> Result<u32, StoreError>;
    /// Store a subscription record under `(contract, id, topic)`.
    fn put(&self, contract: u32, id: u32, topic: &Topic, payload: &[u8]) -> Result<(), StoreError>;
    /// Fetch the payloads of every record matching `(contract, topic)`.
    fn get(&self, contract: u32, topic: &Topic) -> Result<Vec<Vec<u8>>, StoreError>;
    /// Delete the record stored under `(contract, id, topic)`.
    fn delete(&self, contract: u32, id: u32, topic: &Topic) -> Result<(), StoreError>;

    /// Append an entry to the message log; `del` clears the key instead.
    fn append(&self, del: bool, key: u64, data: &[u8]) -> Result<(), StoreError>;
    /// Flush the message log.
    fn write(&self) -> Result<(), StoreError>;
    /// Load pending log entries, clearing them when `reset` is set.
    fn recovery(&self, reset: bool) -> Result<HashMap<u64, Vec<u8>>, StoreError>;
}

/// Open store handles shared by the service, sessions and the cluster plane.
#[derive(Clone)]
pub struct Store {
    adapter: Arc<dyn Adapter>,
    pub subscription: SubscriptionStore,
    pub log: MessageLog,
}

impl Store {
    /// Open the configured adapter.
    pub fn open(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let adapter: Arc<dyn Adapter> = match cfg.adapter.as_str() {
            "" | "mem" => Arc::new(mem::MemAdapter::new()),
            other => return Err(StoreError::UnknownAdapter(other.to_owned())),
        };
        adapter.open(&cfg.path)?;
        Ok(Self {
            subscription: SubscriptionStore {
                adapter: adapter.clone(),
            },
            log: MessageLog {
                adapter: adapter.clone(),
            },
            adapter,
        })
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.adapter.close()
    }

    pub fn is_open(&self) -> bool {
        self.adapter.is_open()
    }

    pub fn name(&self) -> &'static str {
        self.adapter.name()
    }
}

/// Build the log key for a session message: `(mid << 32) | contract`.
pub fn log_key(mid: Mid, contract: u32) -> u64 {
    (u64::from(mid) << 32) | u64::from(contract)
}

/// Subscription table: `(contract, id, topic) → {qos, connid}` records.
#[derive(Clone)]
pub struct SubscriptionStore {
    adapter: Arc<dyn Adapter>,
}

impl SubscriptionStore {
    pub fn new_id(&self) -> Result<u32, StoreError> {
        self.adapter.new_id()
    }

    pub fn put(
        &self,
        contract: u32,
        id: u32,
        topic: &Topic,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        self.adapter.put(contract, id, topic, payload)
    }

    /// A missing topic is an empty subscriber list, not an error.
    pub fn get(&self, contract: u32, topic: &Topic) -> Result<Vec<Vec<u8>>, StoreError> {
        match self.adapter.get(contract, topic) {
            Ok(records) => Ok(records),
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, contract: u32, id: u32, topic: &Topic) -> Result<(), StoreError> {
        self.adapter.delete(contract, id, topic)
    }
}

/// Write-ahead log of in-flight QoS handshakes. PUBLISH and PUBREL entries
/// are appended; the matching PUBACK/PUBCOMP clears them.
#[derive(Clone)]
pub struct MessageLog {
    adapter: Arc<dyn Adapter>,
}

impl MessageLog {
    /// Persist a packet received from the peer.
    pub fn persist_inbound(&self, key: u64, packet: &Packet) {
        self.persist(key, packet);
    }

    /// Persist a packet sent to the peer.
    pub fn persist_outbound(&self, key: u64, packet: &Packet) {
        self.persist(key, packet);
    }

    fn persist(&self, key: u64, packet: &Packet) {
        let result = match packet.packet_type() {
            PacketType::Puback | PacketType::Pubcomp => self.adapter.append(true, key, &[]),
            PacketType::Publish if packet.qos() != Qos::AtMostOnce => {
                self.adapter.append(false, key, &codec::encode(packet))
            }
            PacketType::Pubrel => self.adapter.append(false, key, &codec::encode(packet)),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(context = "log.persist", key, "unable to persist packet: {e}");
        }
    }

    pub fn write(&self) -> Result<(), StoreError> {
        self.adapter.write()
    }

    /// Surface pending entries; replay on reconnect is best-effort and left
    /// to the caller.
    pub fn recovery(&self, reset: bool) -> Result<HashMap<u64, Vec<u8>>, StoreError> {
        self.adapter.recovery(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Publish;
    use bytes::Bytes;

    fn open_store() -> Store {
        Store::open(&StoreConfig::default()).expect("open")
    }

    fn topic(expr: &[u8], contract: u32, wildcard: bool) -> Topic {
        let mut t = crate::message::topic::parse_key(expr);
        t.parse(contract, wildcard);
        t
    }

    #[test]
    fn unknown_adapter_is_rejected() {
        let cfg = StoreConfig {
            adapter: "bolt".into(),
            path: String::new(),
        };
        assert!(matches!(
            Store::open(&cfg),
            Err(StoreError::UnknownAdapter(_))
        ));
    }

    #[test]
    fn missing_topic_reads_as_empty() {
        let store = open_store();
        let t = topic(b"k/a.b", 1, false);
        assert!(store.subscription.get(1, &t).expect("get").is_empty());
    }

    #[test]
    fn log_key_packs_mid_and_contract() {
        let key = log_key(0xAABB_CCDD, 0x1122_3344);
        assert_eq!(key >> 32, 0xAABB_CCDD);
        assert_eq!(key & 0xFFFF_FFFF, 0x1122_3344);
    }

    #[test]
    fn handshake_entries_clear_on_completion() {
        let store = open_store();
        let key = log_key(77, 5);
        store.log.persist_outbound(
            key,
            &Packet::Publish(Publish {
                message_id: 42,
                qos: crate::protocol::Qos::ExactlyOnce,
                topic: Bytes::from_static(b"a.b"),
                payload: Bytes::from_static(b"x"),
                forwarded: false,
            }),
        );
        assert_eq!(store.log.recovery(false).expect("recovery").len(), 1);

        store.log.persist_inbound(key, &Packet::Pubcomp { message_id: 42 });
        assert!(store.log.recovery(false).expect("recovery").is_empty());
    }
}

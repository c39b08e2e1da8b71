//! Connection identity: local ids, client ids and the credential collaborator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::message::topic::Topic;
use crate::protocol::Connect;

/// Locally unique connection id; monotonic within the process and unique
/// across the cluster when paired with the node name.
pub type Lid = u32;

static NEXT_LID: OnceLock<AtomicU32> = OnceLock::new();

/// Mint the next local connection id. Seeded from the clock so id spaces of
/// restarted processes do not immediately collide in persistence keys.
pub fn new_lid() -> Lid {
    let counter = NEXT_LID.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(1);
        AtomicU32::new((seed & 0x3FFF_FFFF) | 0x1000_0000)
    });
    counter.fetch_add(1, Ordering::Relaxed)
}

/// Opaque client identity supplied at CONNECT or minted by the broker. The
/// first four bytes encode the contract id, the unit of cluster ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(Bytes);

/// Client ids shorter than this cannot carry a contract and are replaced.
pub const MIN_CLIENT_ID_LEN: usize = 4;

impl ClientId {
    pub fn new(raw: Bytes) -> Self {
        Self(raw)
    }

    /// Mint a fresh client id.
    pub fn mint() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        Self(Bytes::from(id.into_bytes()))
    }

    /// The 32-bit contract namespace encoded in the first four bytes.
    pub fn contract(&self) -> u32 {
        let mut raw = [0u8; 4];
        for (slot, byte) in raw.iter_mut().zip(self.0.iter()) {
            *slot = *byte;
        }
        u32::from_le_bytes(raw)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Topic access requested of the credential collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Credential collaborator consulted during CONNECT and on every topic
/// operation. The broker core never interprets key material itself.
pub trait Authenticator: Send + Sync {
    /// Validate CONNECT credentials; a rejection becomes
    /// CONNACK(NotAuthorized) before the session starts.
    fn validate_connect(&self, connect: &Connect) -> bool;

    /// Authorize a topic operation against its access key. Sessions that
    /// connected with the insecure flag skip this check.
    fn authorize(&self, key: &[u8], topic: &Topic, access: Access) -> bool;
}

/// Default collaborator: every well-formed request is allowed.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn validate_connect(&self, _connect: &Connect) -> bool {
        true
    }

    fn authorize(&self, _key: &[u8], _topic: &Topic, _access: Access) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lids_are_monotonic() {
        let a = new_lid();
        let b = new_lid();
        assert!(b > a);
    }

    #[test]
    fn contract_reads_first_four_bytes() {
        let id = ClientId::new(Bytes::from_static(b"UCBFDONC"));
        assert_eq!(id.contract(), u32::from_le_bytes(*b"UCBF"));
        let short = ClientId::new(Bytes::from_static(b"AB"));
        assert_eq!(short.contract(), u32::from_le_bytes([b'A', b'B', 0, 0]));
    }

    #[test]
    fn minted_ids_are_distinct_and_long_enough() {
        let a = ClientId::mint();
        let b = ClientId::mint();
        assert_ne!(a, b);
        assert!(a.as_bytes().len() >= MIN_CLIENT_ID_LEN);
    }
}

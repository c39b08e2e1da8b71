//! Process-wide cache of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::conn::Conn;
use crate::security::Lid;

/// Maps local connection ids to live sessions, phantoms included. A
/// connection is present exactly between accept and close completion.
#[derive(Default)]
pub struct ConnCache {
    conns: RwLock<HashMap<Lid, Arc<Conn>>>,
}

impl ConnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Conn>) {
        self.conns.write().insert(conn.connid(), conn);
    }

    pub fn get(&self, connid: Lid) -> Option<Arc<Conn>> {
        self.conns.read().get(&connid).cloned()
    }

    pub fn delete(&self, connid: Lid) {
        self.conns.write().remove(&connid);
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Conn>> {
        self.conns.read().values().cloned().collect()
    }
}

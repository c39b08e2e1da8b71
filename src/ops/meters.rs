//! Atomic meters published on the `/varz` endpoint.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// A monotonic or gauge-like counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn inc(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dec(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Service-wide meters, shared by every session.
#[derive(Debug, Default)]
pub struct Meter {
    pub connections: Counter,
    pub subscriptions: Counter,
    pub in_msgs: Counter,
    pub out_msgs: Counter,
    pub in_bytes: Counter,
    pub out_bytes: Counter,
}

/// Snapshot served as JSON at the configured `varz_path`.
#[derive(Debug, Serialize)]
pub struct Varz {
    pub node: String,
    pub uptime_secs: u64,
    pub connections: i64,
    pub subscriptions: i64,
    pub in_msgs: i64,
    pub out_msgs: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
}

impl Meter {
    pub fn varz(&self, node: &str, started: Instant) -> Varz {
        Varz {
            node: node.to_owned(),
            uptime_secs: started.elapsed().as_secs(),
            connections: self.connections.get(),
            subscriptions: self.subscriptions.get(),
            in_msgs: self.in_msgs.get(),
            out_msgs: self.out_msgs.get(),
            in_bytes: self.in_bytes.get(),
            out_bytes: self.out_bytes.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_increments_and_decrements() {
        let meter = Meter::default();
        meter.connections.inc(2);
        meter.connections.dec(1);
        meter.in_bytes.inc(100);
        let varz = meter.varz("n0", Instant::now());
        assert_eq!(varz.connections, 1);
        assert_eq!(varz.in_bytes, 100);
        assert_eq!(varz.node, "n0");
    }
}

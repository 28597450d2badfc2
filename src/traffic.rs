use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative byte counters for one active tunnel.
///
/// Counters are channel-centric: bytes read off the transport channel count
/// as `in`, bytes read off the local socket count as `out`. For reverse
/// tunnels this means remote-originated data is `in`, matching how the
/// server side sees the tunnel.
#[derive(Default)]
pub struct TrafficCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub fn add_in(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let counters = TrafficCounters::default();
        counters.add_in(10);
        counters.add_in(0);
        counters.add_out(3);
        counters.add_out(4);
        let snap = counters.snapshot();
        assert_eq!(snap.bytes_in, 10);
        assert_eq!(snap.bytes_out, 7);
    }
}

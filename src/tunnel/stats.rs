//! Connection statistics. Single-threaded: plain cells shared by `Rc`.

use std::cell::Cell;

/// Running average, used for the control channel's heartbeat RTT.
#[derive(Debug)]
pub struct AvgStat {
    label: &'static str,
    count: Cell<u64>,
    sum: Cell<u64>,
}

impl AvgStat {
    pub fn new(label: &'static str) -> AvgStat {
        AvgStat { label, count: Cell::new(0), sum: Cell::new(0) }
    }

    pub fn accumulate(&self, sample: u64) {
        self.count.set(self.count.get() + 1);
        self.sum.set(self.sum.get() + sample);
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn average(&self) -> Option<f64> {
        let count = self.count.get();
        (count > 0).then(|| self.sum.get() as f64 / count as f64)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Per-session byte and packet counters, fed by the data pipes and read
/// by the quota check.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub bytes_sent: Cell<u64>,
    pub bytes_received: Cell<u64>,
    pub packets_sent: Cell<u64>,
    pub packets_received: Cell<u64>,
}

impl TrafficStats {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.set(self.bytes_sent.get() + bytes as u64);
        self.packets_sent.set(self.packets_sent.get() + 1);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.set(self.bytes_received.get() + bytes as u64);
        self.packets_received.set(self.packets_received.get() + 1);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.get() + self.bytes_received.get()
    }
}

//! Engine-wide counters
//!
//! All counters are relaxed atomics; `snapshot` gives a consistent-enough
//! view for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct EngineStats {
    start_time: Instant,

    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,

    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,

    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub sessions_evicted: AtomicU64,

    pub checksum_errors: AtomicU64,
    pub parse_errors: AtomicU64,
    pub socket_errors: AtomicU64,
    pub resets_sent: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            tcp_packets: AtomicU64::new(0),
            udp_packets: AtomicU64::new(0),
            tcp_sessions_total: AtomicU64::new(0),
            tcp_sessions_active: AtomicU64::new(0),
            udp_sessions_total: AtomicU64::new(0),
            udp_sessions_active: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            resets_sent: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_session(&self) {
        self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.sessions_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub sessions_evicted: u64,
    pub checksum_errors: u64,
    pub parse_errors: u64,
    pub socket_errors: u64,
    pub resets_sent: u64,
}

impl StatsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.tcp_sessions_active + self.udp_sessions_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::new();
        stats.record_received(100);
        stats.record_received(50);
        stats.record_sent(40);
        stats.record_tcp_session();
        stats.record_udp_session();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.packets_sent, 1);
        assert_eq!(snap.active_sessions(), 2);
    }
}

//! Engine configuration

use std::time::Duration;

/// TCP-side tuning
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Receive window advertised to the device
    pub recv_window: u16,
    /// Window scale factor offered in the SYN-ACK
    pub window_scale: u8,
    /// Maximum segment size offered in the SYN-ACK
    pub mss: u16,
    /// Idle timeout before the reaper evicts the session
    pub idle_timeout: Duration,
    /// Buffered outbound bytes that force a socket flush even without PSH
    pub flush_threshold: usize,
    /// Real-socket read buffer size
    pub read_buffer: usize,
    /// Upper bound on buffered out-of-order segments per flow
    pub max_ooo_segments: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            recv_window: 65535,
            window_scale: 2,
            mss: 1360,
            idle_timeout: Duration::from_secs(300),
            flush_threshold: 64 * 1024,
            read_buffer: 8192,
            max_ooo_segments: 64,
        }
    }
}

/// UDP-side tuning
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Idle timeout, the only way UDP sessions are reclaimed
    pub idle_timeout: Duration,
    /// Datagram receive buffer size
    pub recv_buffer: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            recv_buffer: 65535,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    /// Session table capacity
    pub max_sessions: usize,
    /// Idle-reaper sweep interval
    pub cleanup_interval: Duration,
    /// Depth of the tunnel-outbound packet queue
    pub tun_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            max_sessions: 65536,
            cleanup_interval: Duration::from_secs(30),
            tun_queue_depth: 1024,
        }
    }
}

/// Fluent builder over [`EngineConfig`]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.config.tcp.mss = mss;
        self
    }

    pub fn window_scale(mut self, scale: u8) -> Self {
        self.config.tcp.window_scale = scale;
        self
    }

    pub fn tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.idle_timeout = timeout;
        self
    }

    pub fn udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp.idle_timeout = timeout;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

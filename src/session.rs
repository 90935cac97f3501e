//! Per-flow session state
//!
//! A [`Session`] is the canonical record of one intercepted flow. The
//! TCP variant carries the emulated endpoint's sequence-space state
//! machine; the UDP variant only routes datagrams. Atomic flags
//! coordinate the packet-processing path with the bridging tasks
//! without cross-session locking.

use crate::config::TcpConfig;
use crate::packet::{seq_after, seq_before, seq_before_or_eq, TcpHeader};
use crate::table::FlowKey;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// TCP connection phase as seen by the emulated remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    /// SYN seen, SYN-ACK sent, waiting for the device's ACK
    SynReceived,
    Established,
    /// Device sent FIN; the real socket may still have data coming
    FinReceived,
    /// We sent FIN after the real socket hit end-of-stream
    FinSent,
    /// Both directions finished, session ready for removal
    Closed,
    /// RST observed or synthesized
    Aborted,
}

/// What the engine must do after feeding a segment to the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAction {
    None,
    /// Send an empty ACK reflecting current rcv_nxt
    SendAck,
    /// RST arrived; tear the session down cooperatively
    Abort,
}

/// Mutable TCP flow state. Always accessed under the session's lock,
/// never across an await point.
#[derive(Debug)]
pub struct TcpFlow {
    pub phase: TcpPhase,

    /// Our initial send sequence number
    pub iss: u32,
    /// Next sequence number we will send
    pub snd_nxt: u32,
    /// Oldest unacknowledged sequence number we sent
    pub snd_una: u32,
    /// Next sequence number expected from the device
    pub rcv_nxt: u32,

    /// Device receive window after scaling
    pub peer_window: u32,
    pub peer_window_scale: u8,
    /// Device is out of receive window; senders must wait
    pub window_full: bool,
    /// MSS for segments we send toward the device
    pub send_mss: usize,

    /// Most recent timestamp value from the device, echoed in replies
    pub ts_recent: u32,
    pub ts_enabled: bool,

    /// Payload accepted from the device, awaiting flush to the socket
    pub outbound: Vec<u8>,
    /// PSH seen or flush threshold crossed
    pub flush_ready: bool,
    /// Segments received ahead of rcv_nxt, keyed by sequence number
    ooo: BTreeMap<u32, Vec<u8>>,
    max_ooo_segments: usize,

    /// Handle to the bridge writer once the real socket is open
    pub socket_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Device sent FIN
    pub device_fin: bool,
    /// We sent our FIN (after real-socket end-of-stream)
    pub fin_sent: bool,
    /// Device acknowledged our FIN
    pub fin_acked: bool,

    pub bytes_from_device: u64,
    pub bytes_to_device: u64,
}

impl TcpFlow {
    /// State right after a SYN: the SYN-ACK we are about to send
    /// consumes `iss`, and the device's SYN consumed one sequence slot.
    pub fn new(iss: u32, device_seq: u32, syn: &TcpHeader, config: &TcpConfig) -> Self {
        let peer_window_scale = syn.options.window_scale.unwrap_or(0).min(14);
        let send_mss = syn.options.mss.map(usize::from).unwrap_or(536);
        Self {
            phase: TcpPhase::SynReceived,
            iss,
            snd_nxt: iss.wrapping_add(1),
            snd_una: iss,
            rcv_nxt: device_seq.wrapping_add(1),
            // the window field of a SYN is never scaled (RFC 7323);
            // scaling starts with the first post-handshake ACK
            peer_window: syn.window as u32,
            peer_window_scale,
            window_full: false,
            send_mss,
            ts_recent: syn.options.timestamp.map(|(tsval, _)| tsval).unwrap_or(0),
            ts_enabled: syn.options.timestamp.is_some(),
            outbound: Vec::new(),
            flush_ready: false,
            ooo: BTreeMap::new(),
            max_ooo_segments: config.max_ooo_segments,
            socket_tx: None,
            device_fin: false,
            fin_sent: false,
            fin_acked: false,
            bytes_from_device: 0,
            bytes_to_device: 0,
        }
    }

    /// Feed one inbound segment through the state machine. Returns the
    /// reply obligation; the caller builds and sends actual packets.
    pub fn process(&mut self, th: &TcpHeader, payload: &[u8], flush_threshold: usize) -> TcpAction {
        if th.flags.rst {
            trace!(seq = th.seq, "reset from device");
            self.phase = TcpPhase::Aborted;
            return TcpAction::Abort;
        }

        if let Some((tsval, _)) = th.options.timestamp {
            if self.ts_enabled && seq_before_or_eq(th.seq, self.rcv_nxt) {
                self.ts_recent = tsval;
            }
        }

        let mut action = TcpAction::None;

        if th.flags.ack {
            self.process_ack(th);
        }

        if !payload.is_empty() {
            self.accept_data(th.seq, payload);
            // always ack data: new bytes confirm receipt, duplicates are
            // re-acked, and an out-of-order segment gets a duplicate ACK
            // at rcv_nxt so the device can fast-retransmit the gap
            action = TcpAction::SendAck;
            if th.flags.psh || self.outbound.len() >= flush_threshold {
                self.flush_ready = true;
            }
        }

        if th.flags.fin {
            let fin_seq = th.seq.wrapping_add(payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.device_fin = true;
                if self.phase == TcpPhase::Established || self.phase == TcpPhase::SynReceived {
                    self.phase = TcpPhase::FinReceived;
                }
                // buffered bytes must still reach the socket
                self.flush_ready = !self.outbound.is_empty() || self.flush_ready;
                action = TcpAction::SendAck;
            } else if seq_before(fin_seq, self.rcv_nxt) {
                // retransmitted FIN, re-ack it
                action = TcpAction::SendAck;
            }
        }

        self.maybe_close();
        action
    }

    fn process_ack(&mut self, th: &TcpHeader) {
        let ack = th.ack;
        if seq_after(ack, self.snd_una) && seq_before_or_eq(ack, self.snd_nxt) {
            self.snd_una = ack;
            if self.phase == TcpPhase::SynReceived && self.snd_una == self.snd_nxt {
                self.phase = TcpPhase::Established;
            }
            if self.fin_sent && self.snd_una == self.snd_nxt {
                self.fin_acked = true;
            }
        }

        self.peer_window = (th.window as u32) << self.peer_window_scale;
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        // a window smaller than in-flight data means the advertisement
        // shrank; clamp instead of treating it as protocol corruption
        self.window_full = in_flight >= self.peer_window;
    }

    /// Accept payload at `seq`, handling duplicates, partial overlap
    /// and a bounded amount of out-of-order buffering.
    fn accept_data(&mut self, seq: u32, payload: &[u8]) {
        if seq == self.rcv_nxt {
            self.push_outbound(payload);
            self.drain_ooo();
            return;
        }

        if seq_before(seq, self.rcv_nxt) {
            let end = seq.wrapping_add(payload.len() as u32);
            if seq_after(end, self.rcv_nxt) {
                // partial overlap, accept only the unseen suffix
                let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
                self.push_outbound(&payload[skip..]);
                self.drain_ooo();
            }
            // pure duplicate otherwise, caller re-acks
            return;
        }

        // ahead of rcv_nxt, hold for later
        if self.ooo.len() < self.max_ooo_segments {
            self.ooo.entry(seq).or_insert_with(|| payload.to_vec());
            trace!(seq, buffered = self.ooo.len(), "out-of-order segment held");
        }
    }

    fn push_outbound(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(bytes.len() as u32);
        self.bytes_from_device += bytes.len() as u64;
    }

    fn drain_ooo(&mut self) {
        while let Some((&seq, _)) = self.ooo.iter().next() {
            if seq_after(seq, self.rcv_nxt) {
                break;
            }
            let segment = match self.ooo.remove(&seq) {
                Some(s) => s,
                None => break,
            };
            if seq == self.rcv_nxt {
                self.push_outbound(&segment);
            } else {
                let end = seq.wrapping_add(segment.len() as u32);
                if seq_after(end, self.rcv_nxt) {
                    let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
                    self.push_outbound(&segment[skip..]);
                }
                // fully stale segments are discarded
            }
        }
    }

    fn maybe_close(&mut self) {
        if self.device_fin && self.fin_sent && self.fin_acked && self.phase != TcpPhase::Aborted {
            self.phase = TcpPhase::Closed;
        }
    }

    /// Take everything buffered for the real socket.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        self.flush_ready = false;
        std::mem::take(&mut self.outbound)
    }

    /// Claim `len` bytes of send-sequence space for a data segment
    /// toward the device. Returns the sequence number to stamp on it.
    pub fn claim_send(&mut self, len: usize) -> u32 {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        self.bytes_to_device += len as u64;
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.window_full = in_flight >= self.peer_window;
        seq
    }

    /// Claim the sequence slot for our FIN.
    pub fn claim_fin(&mut self) -> u32 {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.fin_sent = true;
        if self.phase != TcpPhase::Aborted && self.phase != TcpPhase::Closed {
            self.phase = if self.device_fin { TcpPhase::FinReceived } else { TcpPhase::FinSent };
        }
        seq
    }

    /// Bytes the device can currently accept from us.
    pub fn send_capacity(&self) -> usize {
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.peer_window.saturating_sub(in_flight) as usize
    }
}

/// Mutable UDP flow state
#[derive(Debug, Default)]
pub struct UdpFlow {
    pub socket_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub datagrams_out: u64,
    pub datagrams_in: u64,
}

/// Protocol-specific half of a session
#[derive(Debug)]
pub enum SessionKind {
    Tcp(RwLock<TcpFlow>),
    Udp(RwLock<UdpFlow>),
}

/// One intercepted flow, shared between the packet path and its
/// bridging tasks.
#[derive(Debug)]
pub struct Session {
    pub key: FlowKey,
    pub kind: SessionKind,
    /// A bridge is attached; guards against spawning a second one
    busy: AtomicBool,
    /// Cooperative teardown flag, checked by every worker pass
    aborting: AtomicBool,
    /// A checksum-mismatched packet was seen on this flow
    corrupted: AtomicBool,
    last_activity: RwLock<Instant>,
    /// Signalled when the device window reopens
    pub window_open: Notify,
}

impl Session {
    pub fn tcp(key: FlowKey, flow: TcpFlow) -> Self {
        Self {
            key,
            kind: SessionKind::Tcp(RwLock::new(flow)),
            busy: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            last_activity: RwLock::new(Instant::now()),
            window_open: Notify::new(),
        }
    }

    pub fn udp(key: FlowKey) -> Self {
        Self {
            key,
            kind: SessionKind::Udp(RwLock::new(UdpFlow::default())),
            busy: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            last_activity: RwLock::new(Instant::now()),
            window_open: Notify::new(),
        }
    }

    pub fn tcp_flow(&self) -> Option<&RwLock<TcpFlow>> {
        match &self.kind {
            SessionKind::Tcp(flow) => Some(flow),
            SessionKind::Udp(_) => None,
        }
    }

    pub fn udp_flow(&self) -> Option<&RwLock<UdpFlow>> {
        match &self.kind {
            SessionKind::Udp(flow) => Some(flow),
            SessionKind::Tcp(_) => None,
        }
    }

    /// Claim exclusive bridge ownership. Only one caller wins.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// A bridge currently owns this session's socket.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Cooperative teardown: set the flag, close the flush channel so
    /// the writer task drains out, and wake window waiters. The caller
    /// must not hold the flow lock.
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::Release);
        match &self.kind {
            SessionKind::Tcp(flow) => flow.write().socket_tx = None,
            SessionKind::Udp(flow) => flow.write().socket_tx = None,
        }
        self.window_open.notify_waiters();
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    pub fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::Release);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    /// Refresh the idle-reaper clock.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().elapsed()
    }
}

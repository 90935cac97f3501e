//! Interception engine
//!
//! One engine instance owns a session table, a capture queue handle and
//! the tunnel-outbound channel. `process_packet` is the single entry
//! point for tunnel-inbound packets; bridging tasks inject replies
//! through the same instance so every packet crosses the capture queue
//! exactly once per direction.

use crate::bridge;
use crate::capture::{CaptureQueue, Direction};
use crate::config::EngineConfig;
use crate::error::{Result, StackError};
use crate::packet::{
    build_tcp, parse_packet, ParsedPacket, TcpFlags, TcpHeader, TcpOptions, Transport,
};
use crate::session::{Session, TcpAction, TcpFlow, TcpPhase};
use crate::stats::EngineStats;
use crate::table::{FlowKey, FlowProto, SessionTable};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) table: Arc<SessionTable>,
    pub(crate) capture: CaptureQueue,
    pub(crate) stats: Arc<EngineStats>,
    tun_tx: mpsc::Sender<BytesMut>,
    running: AtomicBool,
    epoch: Instant,
}

impl Engine {
    /// Build an engine. The returned receiver yields packets to write
    /// back to the tunnel device.
    pub fn new(config: EngineConfig, capture: CaptureQueue) -> (Arc<Self>, mpsc::Receiver<BytesMut>) {
        let (tun_tx, tun_rx) = mpsc::channel(config.tun_queue_depth);
        let engine = Arc::new(Self {
            table: Arc::new(SessionTable::new(config.max_sessions)),
            config,
            capture,
            stats: Arc::new(EngineStats::new()),
            tun_tx,
            running: AtomicBool::new(true),
            epoch: Instant::now(),
        });
        (engine, tun_rx)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Spawn the idle reaper. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.cleanup_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if !engine.running.load(Ordering::Acquire) {
                    break;
                }
                let evicted = engine.table.evict_idle(&engine.config);
                if !evicted.is_empty() {
                    engine.stats.record_evicted(evicted.len());
                    for session in &evicted {
                        match session.kind {
                            crate::session::SessionKind::Tcp(_) => engine.stats.record_tcp_closed(),
                            crate::session::SessionKind::Udp(_) => engine.stats.record_udp_closed(),
                        }
                    }
                }
            }
        });
        info!("engine started");
    }

    /// Stop accepting work and abort every live session.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let drained = self.table.drain_all();
        for session in &drained {
            match session.kind {
                crate::session::SessionKind::Tcp(_) => self.stats.record_tcp_closed(),
                crate::session::SessionKind::Udp(_) => self.stats.record_udp_closed(),
            }
        }
        info!(sessions = drained.len(), "engine shut down");
    }

    /// Feed one raw tunnel-inbound IP packet through the stack.
    pub async fn process_packet(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        self.stats.record_received(data.len());
        self.capture.push(Direction::Inbound, data);

        let parsed = match parse_packet(data) {
            Ok(parsed) => parsed,
            Err(err) if err.is_malformed() => {
                debug!(%err, len = data.len(), "dropping malformed packet");
                self.stats.record_parse_error();
                self.stats.record_dropped();
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match parsed.transport.clone() {
            Transport::Tcp(th) => {
                self.stats.record_tcp();
                self.handle_tcp(&parsed, &th, data).await
            }
            Transport::Udp(_) => {
                self.stats.record_udp();
                self.handle_udp(&parsed, data).await
            }
        }
    }

    async fn handle_tcp(self: &Arc<Self>, parsed: &ParsedPacket, th: &TcpHeader, raw: &[u8]) -> Result<()> {
        let key = FlowKey {
            local: parsed.src_socket(),
            remote: parsed.dst_socket(),
            proto: FlowProto::Tcp,
        };
        let payload = parsed.payload(raw);

        if th.flags.syn && !th.flags.ack {
            return self.handle_tcp_syn(key, th).await;
        }

        let session = match self.table.get(&key) {
            Some(session) => session,
            None => return self.handle_unknown_tcp(key, th, payload.len()).await,
        };
        session.touch();
        if !parsed.checksum_ok {
            session.mark_corrupted();
            self.stats.record_checksum_error();
        }

        let flow_lock = tcp_state(&session)?;
        let (action, ack_reply, window_open) = {
            let mut flow = flow_lock.write();
            let action = flow.process(th, payload, self.config.tcp.flush_threshold);
            let ack_reply = (flow.snd_nxt, flow.rcv_nxt, self.tcp_reply_options(&flow));
            (action, ack_reply, !flow.window_full)
        };
        if window_open {
            session.window_open.notify_waiters();
        }

        match action {
            TcpAction::Abort => {
                debug!(%key, "reset from device, aborting session");
                session.abort();
                self.remove_tcp(&key);
                return Ok(());
            }
            TcpAction::SendAck => {
                let (seq, ack, options) = ack_reply;
                self.send_tcp_segment(&session, seq, ack, TcpFlags::ack_only(), options, &[])
                    .await?;
            }
            TcpAction::None => {}
        }

        let (flush, finish_without_socket) = {
            let flow = flow_lock.read();
            let flush = flow.flush_ready && !flow.outbound.is_empty();
            let finish = flow.device_fin
                && !flow.fin_sent
                && flow.outbound.is_empty()
                && flow.socket_tx.is_none()
                && !session.is_busy();
            (flush, finish)
        };

        if flush {
            self.flush_tcp(&session).await?;
        }
        self.close_socket_write_if_done(&session)?;

        if finish_without_socket {
            // no real socket was ever opened; complete the teardown ourselves
            self.send_tcp_fin(&session).await?;
        }

        if flow_lock.read().phase == TcpPhase::Closed {
            debug!(%key, "teardown complete");
            self.remove_tcp(&key);
        }
        Ok(())
    }

    /// A SYN always restarts the tuple: the old session, if any, is
    /// torn down and a fresh one answers with a SYN-ACK.
    async fn handle_tcp_syn(self: &Arc<Self>, key: FlowKey, th: &TcpHeader) -> Result<()> {
        if let Some(old) = self.table.remove(&key) {
            debug!(%key, "SYN restarts existing tuple");
            old.abort();
            self.stats.record_tcp_closed();
        }

        let iss: u32 = rand::random();
        let flow = TcpFlow::new(iss, th.seq, th, &self.config.tcp);
        let session = match self.table.create_tcp(key, flow) {
            Ok(session) => session,
            Err(StackError::SessionTableFull(max)) => {
                warn!(%key, max, "session table full, refusing connection");
                self.stats.record_dropped();
                self.stats.record_reset();
                return self
                    .send_raw_rst(key, th.seq.wrapping_add(1), 0)
                    .await;
            }
            Err(err) => return Err(err),
        };
        self.stats.record_tcp_session();
        debug!(%key, iss, device_seq = th.seq, "new TCP session");

        let options = TcpOptions {
            mss: Some(self.config.tcp.mss),
            window_scale: Some(self.config.tcp.window_scale),
            sack_permitted: false,
            timestamp: th.options.timestamp.map(|(tsval, _)| (self.now_ts(), tsval)),
        };
        self.send_tcp_segment(
            &session,
            iss,
            th.seq.wrapping_add(1),
            TcpFlags::syn_ack(),
            options,
            &[],
        )
        .await
    }

    /// Non-SYN segment for a tuple with no session. Answered so the
    /// device's stack converges instead of retransmitting.
    async fn handle_unknown_tcp(&self, key: FlowKey, th: &TcpHeader, payload_len: usize) -> Result<()> {
        if th.flags.rst {
            return Ok(());
        }
        if th.flags.fin {
            // acknowledge without creating a phantom session
            let ack = th.seq.wrapping_add(payload_len as u32).wrapping_add(1);
            let pkt = build_tcp(
                key.remote,
                key.local,
                th.ack,
                ack,
                TcpFlags::ack_only(),
                self.config.tcp.recv_window,
                TcpOptions::default(),
                &[],
            )?;
            return self.emit(pkt).await;
        }
        debug!(%key, "segment for unknown tuple, sending reset");
        self.stats.record_reset();
        self.send_raw_rst(key, th.seq.wrapping_add(payload_len as u32), th.ack)
            .await
    }

    async fn send_raw_rst(&self, key: FlowKey, ack: u32, seq: u32) -> Result<()> {
        let pkt = build_tcp(
            key.remote,
            key.local,
            seq,
            ack,
            TcpFlags::rst_ack(),
            0,
            TcpOptions::default(),
            &[],
        )?;
        self.emit(pkt).await
    }

    /// Push buffered payload to the real socket, opening it lazily.
    async fn flush_tcp(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        let tx = match self.ensure_tcp_socket(session).await? {
            Some(tx) => tx,
            None => return Ok(()), // connect failed, session already reset
        };
        let buffered = {
            let mut flow = tcp_state(session)?.write();
            flow.take_outbound()
        };
        if buffered.is_empty() {
            return Ok(());
        }
        if tx.send(buffered).await.is_err() {
            warn!(key = %session.key, "socket writer gone during flush");
            self.abort_with_rst(session).await?;
        }
        Ok(())
    }

    /// After the device's FIN, once every buffered byte has been
    /// flushed, dropping the writer handle half-closes the socket.
    fn close_socket_write_if_done(&self, session: &Arc<Session>) -> Result<()> {
        let mut flow = tcp_state(session)?.write();
        if flow.device_fin && flow.outbound.is_empty() && flow.socket_tx.is_some() {
            flow.socket_tx = None;
        }
        Ok(())
    }

    async fn ensure_tcp_socket(self: &Arc<Self>, session: &Arc<Session>) -> Result<Option<mpsc::Sender<Vec<u8>>>> {
        if let Some(tx) = tcp_state(session)?.read().socket_tx.clone() {
            return Ok(Some(tx));
        }
        if !session.try_acquire() {
            // a bridge is already being attached
            return Ok(tcp_state(session)?.read().socket_tx.clone());
        }
        match bridge::connect_tcp(self.clone(), session.clone()).await {
            Ok(tx) => {
                tcp_state(session)?.write().socket_tx = Some(tx.clone());
                Ok(Some(tx))
            }
            Err(err) => {
                warn!(key = %session.key, %err, "connect failed");
                self.stats.record_socket_error();
                session.release();
                self.abort_with_rst(session).await?;
                Ok(None)
            }
        }
    }

    async fn handle_udp(self: &Arc<Self>, parsed: &ParsedPacket, raw: &[u8]) -> Result<()> {
        let key = FlowKey {
            local: parsed.src_socket(),
            remote: parsed.dst_socket(),
            proto: FlowProto::Udp,
        };
        let session = match self.table.get(&key) {
            Some(session) => session,
            None => {
                let session = match self.table.create_udp(key) {
                    Ok(session) => session,
                    Err(StackError::SessionTableFull(max)) => {
                        warn!(%key, max, "session table full, dropping datagram");
                        self.stats.record_dropped();
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };
                self.stats.record_udp_session();
                debug!(%key, "new UDP session");
                session
            }
        };
        session.touch();
        if !parsed.checksum_ok {
            session.mark_corrupted();
            self.stats.record_checksum_error();
        }

        let tx = match self.ensure_udp_socket(&session).await? {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let payload = parsed.payload(raw).to_vec();
        if tx.send(payload).await.is_err() {
            debug!(%key, "relay task gone, removing session");
            self.remove_udp(&key);
        }
        Ok(())
    }

    async fn ensure_udp_socket(self: &Arc<Self>, session: &Arc<Session>) -> Result<Option<mpsc::Sender<Vec<u8>>>> {
        if let Some(tx) = udp_state(session)?.read().socket_tx.clone() {
            return Ok(Some(tx));
        }
        if !session.try_acquire() {
            return Ok(udp_state(session)?.read().socket_tx.clone());
        }
        match bridge::connect_udp(self.clone(), session.clone()).await {
            Ok(tx) => {
                udp_state(session)?.write().socket_tx = Some(tx.clone());
                Ok(Some(tx))
            }
            Err(err) => {
                warn!(key = %session.key, %err, "UDP bind failed");
                self.stats.record_socket_error();
                session.release();
                session.abort();
                self.remove_udp(&session.key);
                Ok(None)
            }
        }
    }

    /// Build and emit one TCP segment for `session`, device-bound.
    pub(crate) async fn send_tcp_segment(
        &self,
        session: &Arc<Session>,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        options: TcpOptions,
        payload: &[u8],
    ) -> Result<()> {
        let pkt = build_tcp(
            session.key.remote,
            session.key.local,
            seq,
            ack,
            flags,
            self.config.tcp.recv_window,
            options,
            payload,
        )?;
        self.emit(pkt).await
    }

    /// Segment `data` from the real socket into device-bound packets,
    /// respecting the device's receive window.
    pub(crate) async fn relay_to_device(&self, session: &Arc<Session>, data: &[u8]) -> Result<()> {
        let flow_lock = tcp_state(session)?;
        let mut offset = 0;
        while offset < data.len() {
            if session.is_aborting() {
                return Ok(());
            }
            if flow_lock.read().send_capacity() == 0 {
                // park until the device acks something; the timeout
                // guarantees we re-check the aborting flag
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(1),
                    session.window_open.notified(),
                )
                .await;
                continue;
            }
            let (seq, ack, chunk_len, options) = {
                let mut flow = flow_lock.write();
                let chunk_len = (data.len() - offset)
                    .min(flow.send_mss)
                    .min(flow.send_capacity().max(1));
                let seq = flow.claim_send(chunk_len);
                (seq, flow.rcv_nxt, chunk_len, self.tcp_reply_options(&flow))
            };
            let last = offset + chunk_len >= data.len();
            let flags = if last { TcpFlags::psh_ack() } else { TcpFlags::ack_only() };
            self.send_tcp_segment(session, seq, ack, flags, options, &data[offset..offset + chunk_len])
                .await?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Send our FIN after the real socket reached end-of-stream.
    pub(crate) async fn send_tcp_fin(&self, session: &Arc<Session>) -> Result<()> {
        let flow_lock = tcp_state(session)?;
        let (seq, ack, options) = {
            let mut flow = flow_lock.write();
            if flow.fin_sent {
                return Ok(());
            }
            let seq = flow.claim_fin();
            (seq, flow.rcv_nxt, self.tcp_reply_options(&flow))
        };
        debug!(key = %session.key, "end-of-stream, sending FIN");
        self.send_tcp_segment(session, seq, ack, TcpFlags::fin_ack(), options, &[])
            .await
    }

    /// Surface a real-socket failure as a reset toward the device and
    /// tear the session down.
    pub(crate) async fn abort_with_rst(&self, session: &Arc<Session>) -> Result<()> {
        let (seq, ack) = {
            let flow = tcp_state(session)?.read();
            (flow.snd_nxt, flow.rcv_nxt)
        };
        session.abort();
        self.stats.record_reset();
        self.remove_tcp(&session.key);
        let pkt = build_tcp(
            session.key.remote,
            session.key.local,
            seq,
            ack,
            TcpFlags::rst_ack(),
            0,
            TcpOptions::default(),
            &[],
        )?;
        self.emit(pkt).await
    }

    pub(crate) fn remove_tcp(&self, key: &FlowKey) {
        if let Some(session) = self.table.remove(key) {
            session.abort();
            self.stats.record_tcp_closed();
        }
    }

    pub(crate) fn remove_udp(&self, key: &FlowKey) {
        if self.table.remove(key).is_some() {
            self.stats.record_udp_closed();
        }
    }

    /// Write a device-bound packet to the tunnel queue and the capture
    /// queue.
    pub(crate) async fn emit(&self, pkt: Vec<u8>) -> Result<()> {
        self.stats.record_sent(pkt.len());
        self.capture.push(Direction::Outbound, &pkt);
        self.tun_tx
            .send(BytesMut::from(&pkt[..]))
            .await
            .map_err(|_| StackError::ChannelClosed)
    }

    fn tcp_reply_options(&self, flow: &TcpFlow) -> TcpOptions {
        if flow.ts_enabled {
            TcpOptions {
                timestamp: Some((self.now_ts(), flow.ts_recent)),
                ..Default::default()
            }
        } else {
            TcpOptions::default()
        }
    }

    fn now_ts(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

fn tcp_state(session: &Session) -> Result<&RwLock<TcpFlow>> {
    session
        .tcp_flow()
        .ok_or_else(|| StackError::Internal("TCP key mapped to non-TCP session".to_string()))
}

fn udp_state(session: &Session) -> Result<&RwLock<crate::session::UdpFlow>> {
    session
        .udp_flow()
        .ok_or_else(|| StackError::Internal("UDP key mapped to non-UDP session".to_string()))
}

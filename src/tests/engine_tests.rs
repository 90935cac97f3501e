//! End-to-end tests driving the engine with device-side packets and
//! real loopback sockets on the remote side.

use crate::capture::testing::MemorySink;
use crate::capture::{capture_channel, CaptureConsumer, Direction};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::packet::{build_tcp, build_udp, parse_packet, TcpFlags, TcpHeader, TcpOptions, Transport};
use crate::table::{FlowKey, FlowProto};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

const DEVICE: &str = "10.0.0.2:40000";

struct Harness {
    engine: Arc<Engine>,
    tun_rx: mpsc::Receiver<BytesMut>,
    consumer: CaptureConsumer,
    local: SocketAddr,
}

fn harness() -> Harness {
    let (queue, consumer) = capture_channel();
    let (engine, tun_rx) = Engine::new(EngineConfig::default(), queue);
    Harness {
        engine,
        tun_rx,
        consumer,
        local: DEVICE.parse().unwrap(),
    }
}

impl Harness {
    async fn inject_tcp(
        &self,
        remote: SocketAddr,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) {
        let pkt = build_tcp(
            self.local,
            remote,
            seq,
            ack,
            flags,
            65535,
            TcpOptions::default(),
            payload,
        )
        .unwrap();
        self.engine.process_packet(&pkt).await.unwrap();
    }

    async fn next_tcp(&mut self) -> TcpHeader {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.tun_rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("tunnel channel closed");
        let parsed = parse_packet(&raw).unwrap();
        match parsed.transport {
            Transport::Tcp(th) => th,
            other => panic!("expected TCP reply, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn syn_creates_session_and_emits_synack() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    let syn = build_tcp(
        h.local,
        remote,
        100,
        0,
        TcpFlags::syn_only(),
        65535,
        TcpOptions { mss: Some(1460), window_scale: Some(3), ..Default::default() },
        &[],
    )
    .unwrap();
    h.engine.process_packet(&syn).await.unwrap();

    assert_eq!(h.engine.table().len(), 1);
    let th = h.next_tcp().await;
    assert!(th.flags.syn && th.flags.ack);
    assert_eq!(th.ack, 101);
    assert!(th.options.mss.is_some());
    assert!(th.options.window_scale.is_some());
}

#[tokio::test]
async fn repeated_syn_restarts_the_tuple() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let first = h.next_tcp().await;
    h.inject_tcp(remote, 500, 0, TcpFlags::syn_only(), &[]).await;
    let second = h.next_tcp().await;

    assert_eq!(h.engine.table().len(), 1);
    assert_eq!(first.ack, 101);
    assert_eq!(second.ack, 501);
}

#[tokio::test]
async fn ack_for_unknown_tuple_gets_reset() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 2000, 3000, TcpFlags::ack_only(), b"stray").await;

    assert_eq!(h.engine.table().len(), 0);
    let th = h.next_tcp().await;
    assert!(th.flags.rst);
    assert_eq!(th.seq, 3000);
    assert_eq!(th.ack, 2005);
    assert_eq!(h.engine.stats().snapshot().resets_sent, 1);
}

#[tokio::test]
async fn fin_for_unknown_tuple_is_acked_without_a_session() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 2000, 3000, TcpFlags::fin_ack(), &[]).await;

    assert_eq!(h.engine.table().len(), 0);
    let th = h.next_tcp().await;
    assert!(th.flags.ack && !th.flags.rst && !th.flags.fin);
    assert_eq!(th.ack, 2001);
}

#[tokio::test]
async fn rst_for_unknown_tuple_is_ignored() {
    let h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 2000, 0, TcpFlags::rst_only(), &[]).await;
    assert_eq!(h.engine.stats().snapshot().packets_sent, 0);
}

#[tokio::test]
async fn rst_on_live_session_aborts_and_removes_it() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let s0 = h.next_tcp().await.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;

    let key = FlowKey { local: h.local, remote, proto: FlowProto::Tcp };
    let session = h.engine.table().get(&key).unwrap();
    assert!(!session.is_aborting());

    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::rst_only(), &[]).await;
    assert!(session.is_aborting());
    assert_eq!(h.engine.table().len(), 0);
    // a reset is never answered
    assert!(h.tun_rx.try_recv().is_err());
}

#[tokio::test]
async fn table_full_syn_is_refused_with_a_counted_reset() {
    let (queue, _consumer) = capture_channel();
    let mut config = EngineConfig::default();
    config.max_sessions = 1;
    let (engine, mut tun_rx) = Engine::new(config, queue);
    let local: SocketAddr = DEVICE.parse().unwrap();
    let first: SocketAddr = "1.2.3.4:443".parse().unwrap();
    let second: SocketAddr = "5.6.7.8:443".parse().unwrap();

    let syn = |remote| build_tcp(local, remote, 100, 0, TcpFlags::syn_only(), 65535, TcpOptions::default(), &[]).unwrap();
    engine.process_packet(&syn(first)).await.unwrap();
    let _synack = tun_rx.recv().await.unwrap();
    engine.process_packet(&syn(second)).await.unwrap();

    assert_eq!(engine.table().len(), 1);
    let raw = tun_rx.recv().await.unwrap();
    let parsed = parse_packet(&raw).unwrap();
    match parsed.transport {
        Transport::Tcp(th) => assert!(th.flags.rst),
        other => panic!("expected TCP reset, got {:?}", other),
    }
    assert_eq!(engine.stats().snapshot().resets_sent, 1);
}

#[tokio::test]
async fn malformed_packet_dropped_silently() {
    let h = harness();
    h.engine.process_packet(&[0x45, 0x00]).await.unwrap();
    h.engine.process_packet(&[]).await.unwrap();
    let snap = h.engine.stats().snapshot();
    assert_eq!(snap.parse_errors, 2);
    assert_eq!(snap.packets_dropped, 2);
    assert_eq!(h.engine.table().len(), 0);
}

#[tokio::test]
async fn full_lifecycle_handshake_data_teardown() {
    let mut h = harness();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    // remote peer: accept, verify the 50 bytes, close on device EOF
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 50];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xAB; 50]);
        // wait for the device-side FIN to propagate as EOF
        let n = stream.read(&mut [0u8; 16]).await.unwrap();
        assert_eq!(n, 0);
    });

    // handshake
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let synack = h.next_tcp().await;
    assert_eq!(synack.ack, 101);
    let s0 = synack.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;

    // 50 bytes with PSH opens the real socket and flushes
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::psh_ack(), &[0xAB; 50]).await;
    let ack = h.next_tcp().await;
    assert!(ack.flags.ack && !ack.flags.fin);
    assert_eq!(ack.ack, 151);

    // device closes; engine acks the FIN, then relays EOF as its own FIN
    h.inject_tcp(remote, 151, s0.wrapping_add(1), TcpFlags::fin_ack(), &[]).await;
    let fin_ack = h.next_tcp().await;
    assert_eq!(fin_ack.ack, 152);
    assert!(!fin_ack.flags.fin);

    let our_fin = h.next_tcp().await;
    assert!(our_fin.flags.fin && our_fin.flags.ack);
    assert_eq!(our_fin.seq, s0.wrapping_add(1));
    assert_eq!(our_fin.ack, 152);

    // final ACK completes the teardown
    h.inject_tcp(remote, 152, s0.wrapping_add(2), TcpFlags::ack_only(), &[]).await;
    assert_eq!(h.engine.table().len(), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn fin_before_any_data_closes_without_a_socket() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let s0 = h.next_tcp().await.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;

    // device closes immediately; no payload ever opened a real socket
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::fin_ack(), &[]).await;
    let ack = h.next_tcp().await;
    assert_eq!(ack.ack, 102);
    let our_fin = h.next_tcp().await;
    assert!(our_fin.flags.fin && our_fin.flags.ack);
    assert_eq!(our_fin.seq, s0.wrapping_add(1));

    h.inject_tcp(remote, 102, s0.wrapping_add(2), TcpFlags::ack_only(), &[]).await;
    assert_eq!(h.engine.table().len(), 0);
}

#[tokio::test]
async fn server_data_is_relayed_to_device() {
    let mut h = harness();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong!").await.unwrap();
    });

    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let s0 = h.next_tcp().await.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::psh_ack(), b"ping").await;
    let ack = h.next_tcp().await;
    assert_eq!(ack.ack, 105);

    // the server's reply comes back as a data-bearing segment
    let raw = tokio::time::timeout(Duration::from_secs(2), h.tun_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let parsed = parse_packet(&raw).unwrap();
    let th = match &parsed.transport {
        Transport::Tcp(th) => th.clone(),
        other => panic!("expected TCP, got {:?}", other),
    };
    assert!(th.flags.psh && th.flags.ack);
    assert_eq!(th.seq, s0.wrapping_add(1));
    assert_eq!(parsed.payload(&raw), b"pong!");
    server.await.unwrap();
}

#[tokio::test]
async fn connect_failure_resets_the_device_flow() {
    let mut h = harness();
    // grab a port that is certainly closed
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    drop(listener);

    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let s0 = h.next_tcp().await.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::psh_ack(), b"data").await;

    // ACK for the accepted payload, then the reset from the failed connect
    let ack = h.next_tcp().await;
    assert_eq!(ack.ack, 105);
    let rst = h.next_tcp().await;
    assert!(rst.flags.rst);
    assert_eq!(h.engine.table().len(), 0);
    assert_eq!(h.engine.stats().snapshot().socket_errors, 1);
}

#[tokio::test]
async fn checksum_mismatch_is_flagged_but_processed() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let s0 = h.next_tcp().await.seq;
    h.inject_tcp(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), &[]).await;

    // corrupt the TCP checksum field directly so the payload is intact
    let mut pkt = build_tcp(
        h.local,
        remote,
        101,
        s0.wrapping_add(1),
        TcpFlags::ack_only(),
        65535,
        TcpOptions::default(),
        b"data!",
    )
    .unwrap();
    pkt[36] ^= 0xFF; // 20-byte IP header + checksum at segment offset 16
    h.engine.process_packet(&pkt).await.unwrap();

    let ack = h.next_tcp().await;
    assert_eq!(ack.ack, 106); // the 5 bytes were still accepted
    let key = FlowKey { local: h.local, remote, proto: FlowProto::Tcp };
    let session = h.engine.table().get(&key).unwrap();
    assert!(session.is_corrupted());
    assert_eq!(h.engine.stats().snapshot().checksum_errors, 1);
}

#[tokio::test]
async fn udp_round_trip_through_real_socket() {
    let mut h = harness();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = server.local_addr().unwrap();

    let echo = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", peer).await.unwrap();
    });

    let query = build_udp(h.local, remote, b"ping").unwrap();
    h.engine.process_packet(&query).await.unwrap();
    assert_eq!(h.engine.table().len(), 1);

    let raw = tokio::time::timeout(Duration::from_secs(2), h.tun_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let parsed = parse_packet(&raw).unwrap();
    assert_eq!(parsed.src_socket(), remote);
    assert_eq!(parsed.dst_socket(), h.local);
    assert_eq!(parsed.payload(&raw), b"pong");
    echo.await.unwrap();
}

#[tokio::test]
async fn every_packet_captured_once_in_order() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();

    let syn = build_tcp(h.local, remote, 100, 0, TcpFlags::syn_only(), 65535, TcpOptions::default(), &[]).unwrap();
    h.engine.process_packet(&syn).await.unwrap();
    let synack = tokio::time::timeout(Duration::from_secs(2), h.tun_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let stray = build_tcp(h.local, remote, 9, 9, TcpFlags::rst_only(), 0, TcpOptions::default(), &[]).unwrap();
    h.engine.process_packet(&stray).await.unwrap();

    let mut sink = MemorySink::new();
    h.consumer.drain_into(&mut sink);
    let inbound = sink.in_direction(Direction::Inbound);
    assert_eq!(inbound, vec![syn.clone(), stray]);
    let outbound = sink.in_direction(Direction::Outbound);
    assert_eq!(outbound, vec![synack.to_vec()]);
}

#[tokio::test]
async fn idle_reaper_evicts_stale_udp_sessions() {
    let (queue, _consumer) = capture_channel();
    let mut config = EngineConfig::default();
    config.udp.idle_timeout = Duration::from_millis(30);
    config.cleanup_interval = Duration::from_millis(20);
    let (engine, _tun_rx) = Engine::new(config, queue);
    engine.start();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = server.local_addr().unwrap();
    let query = build_udp(DEVICE.parse().unwrap(), remote, b"x").unwrap();
    engine.process_packet(&query).await.unwrap();
    assert_eq!(engine.table().len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.table().len(), 0);
    assert_eq!(engine.stats().snapshot().sessions_evicted, 1);
}

#[tokio::test]
async fn shutdown_aborts_all_sessions() {
    let mut h = harness();
    let remote: SocketAddr = "1.2.3.4:443".parse().unwrap();
    h.inject_tcp(remote, 100, 0, TcpFlags::syn_only(), &[]).await;
    let _ = h.next_tcp().await;
    assert_eq!(h.engine.table().len(), 1);
    h.engine.shutdown();
    assert_eq!(h.engine.table().len(), 0);
    assert_eq!(h.engine.stats().snapshot().active_sessions(), 0);
}

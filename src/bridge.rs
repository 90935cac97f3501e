//! Bridging tasks
//!
//! Each session with a real socket gets its own tasks: for TCP a
//! writer draining the flush channel and a reader turning socket bytes
//! into device-bound segments, for UDP a single relay loop. All
//! teardown is cooperative through the session's aborting flag.

use crate::engine::Engine;
use crate::error::{Result, StackError};
use crate::packet::build_udp;
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Open the real TCP connection for `session` and spawn its reader and
/// writer tasks. The caller already holds the session's busy flag.
pub(crate) async fn connect_tcp(engine: Arc<Engine>, session: Arc<Session>) -> Result<mpsc::Sender<Vec<u8>>> {
    let stream = TcpStream::connect(session.key.remote)
        .await
        .map_err(|err| StackError::SocketFailure(err.to_string()))?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(key = %session.key, %err, "set_nodelay failed");
    }
    debug!(key = %session.key, "real socket connected");

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::spawn(tcp_writer(engine.clone(), session.clone(), write_half, rx));
    tokio::spawn(tcp_reader(engine, session, read_half));
    Ok(tx)
}

/// Drain flushed device payload into the real socket. Channel closure
/// means the device finished sending; half-close our side so the peer
/// sees end-of-stream.
async fn tcp_writer(
    engine: Arc<Engine>,
    session: Arc<Session>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(buf) = rx.recv().await {
        if session.is_aborting() {
            return;
        }
        if let Err(err) = write_half.write_all(&buf).await {
            warn!(key = %session.key, %err, "socket write failed");
            engine.stats.record_socket_error();
            if let Err(err) = engine.abort_with_rst(&session).await {
                debug!(key = %session.key, %err, "reset after write failure not delivered");
            }
            return;
        }
    }
    if !session.is_aborting() {
        let _ = write_half.shutdown().await;
        debug!(key = %session.key, "socket write side closed");
    }
}

/// Turn bytes read from the real socket into device-bound segments.
/// End-of-stream starts our side of the FIN teardown.
async fn tcp_reader(engine: Arc<Engine>, session: Arc<Session>, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; engine.config.tcp.read_buffer];
    loop {
        if session.is_aborting() {
            break;
        }
        // bounded wait so an aborted session is noticed even while the
        // remote socket stays silent
        let read = tokio::select! {
            read = read_half.read(&mut buf) => read,
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => continue,
        };
        match read {
            Ok(0) => {
                if let Err(err) = engine.send_tcp_fin(&session).await {
                    debug!(key = %session.key, %err, "FIN not delivered");
                }
                break;
            }
            Ok(n) => {
                if let Err(err) = engine.relay_to_device(&session, &buf[..n]).await {
                    debug!(key = %session.key, %err, "relay to device failed");
                    break;
                }
            }
            Err(err) => {
                if !session.is_aborting() {
                    warn!(key = %session.key, %err, "socket read failed");
                    engine.stats.record_socket_error();
                    if let Err(err) = engine.abort_with_rst(&session).await {
                        debug!(key = %session.key, %err, "reset after read failure not delivered");
                    }
                }
                break;
            }
        }
    }
    session.release();
}

/// Bind and connect the real UDP socket for `session` and spawn its
/// relay task. The caller already holds the session's busy flag.
pub(crate) async fn connect_udp(engine: Arc<Engine>, session: Arc<Session>) -> Result<mpsc::Sender<Vec<u8>>> {
    let bind: SocketAddr = match session.key.remote {
        SocketAddr::V4(_) => "0.0.0.0:0"
            .parse()
            .map_err(|_| StackError::Internal("bad bind address".to_string()))?,
        SocketAddr::V6(_) => "[::]:0"
            .parse()
            .map_err(|_| StackError::Internal("bad bind address".to_string()))?,
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|err| StackError::SocketFailure(err.to_string()))?;
    socket
        .connect(session.key.remote)
        .await
        .map_err(|err| StackError::SocketFailure(err.to_string()))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(udp_relay(engine, session, socket, rx));
    Ok(tx)
}

/// Single loop moving datagrams both ways for one UDP session.
async fn udp_relay(
    engine: Arc<Engine>,
    session: Arc<Session>,
    socket: UdpSocket,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut buf = vec![0u8; engine.config.udp.recv_buffer];
    loop {
        if session.is_aborting() {
            break;
        }
        tokio::select! {
            outbound = rx.recv() => {
                let Some(data) = outbound else { break };
                match socket.send(&data).await {
                    Ok(_) => {
                        if let Some(flow) = session.udp_flow() {
                            flow.write().datagrams_out += 1;
                        }
                    }
                    Err(err) => {
                        warn!(key = %session.key, %err, "datagram send failed");
                        engine.stats.record_socket_error();
                        session.abort();
                        engine.remove_udp(&session.key);
                        break;
                    }
                }
            }
            inbound = socket.recv(&mut buf) => {
                match inbound {
                    Ok(n) => {
                        session.touch();
                        if let Some(flow) = session.udp_flow() {
                            flow.write().datagrams_in += 1;
                        }
                        let reply = match build_udp(session.key.remote, session.key.local, &buf[..n]) {
                            Ok(pkt) => pkt,
                            Err(err) => {
                                debug!(key = %session.key, %err, "reply build failed");
                                continue;
                            }
                        };
                        if engine.emit(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if !session.is_aborting() {
                            warn!(key = %session.key, %err, "datagram receive failed");
                            engine.stats.record_socket_error();
                            session.abort();
                            engine.remove_udp(&session.key);
                        }
                        break;
                    }
                }
            }
        }
    }
    session.release();
}

//! tapstack - user-space TCP/IP interception engine
//!
//! Intercepts raw IP packets from a tunnel device, emulates the remote
//! endpoint of every TCP flow (handshake, sequence tracking, teardown),
//! routes UDP symmetrically, bridges payload to real outbound sockets,
//! and exports a copy of every packet in both directions to a capture
//! sink.
//!
//! ```no_run
//! use tapstack::{capture_channel, Engine, EngineConfig};
//!
//! # async fn run(packet: Vec<u8>) -> tapstack::Result<()> {
//! let (queue, _consumer) = capture_channel();
//! let (engine, mut tun_rx) = Engine::new(EngineConfig::default(), queue);
//! engine.start();
//!
//! engine.process_packet(&packet).await?;
//! if let Some(reply) = tun_rx.recv().await {
//!     // write `reply` back to the tunnel device
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod packet;
pub mod session;
pub mod stats;
pub mod table;

pub use capture::{capture_channel, CaptureConsumer, CapturedPacket, CaptureQueue, CaptureSink, Direction};
pub use config::{EngineBuilder, EngineConfig, TcpConfig, UdpConfig};
pub use engine::Engine;
pub use error::{Result, StackError};
pub use packet::{parse_packet, IpHeader, ParsedPacket, TcpFlags, TcpHeader, TcpOptions, Transport};
pub use session::{Session, TcpPhase};
pub use stats::{EngineStats, StatsSnapshot};
pub use table::{FlowKey, FlowProto, SessionTable};

#[cfg(test)]
mod tests;

//! Capture queue
//!
//! Every packet crossing the tunnel boundary, in either direction, is
//! copied into an unbounded channel drained by a single consumer task.
//! Producers never block on the consumer; a slow sink only grows the
//! queue in memory.

use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::debug;

/// Which way the packet crossed the tunnel boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to engine
    Inbound,
    /// Engine to device
    Outbound,
}

/// An owned copy of one packet as it crossed the tunnel
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub direction: Direction,
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

/// Destination for drained packets. Implemented by the external
/// capture writer; this crate only guarantees delivery.
pub trait CaptureSink: Send {
    fn deliver(&mut self, packet: CapturedPacket);
}

/// Producer half, cheap to clone into every worker task.
#[derive(Debug, Clone)]
pub struct CaptureQueue {
    tx: mpsc::UnboundedSender<CapturedPacket>,
}

impl CaptureQueue {
    /// Copy `data` into the queue. Send failure means the consumer is
    /// gone, which only happens during teardown; the packet is dropped.
    pub fn push(&self, direction: Direction, data: &[u8]) {
        let packet = CapturedPacket {
            direction,
            timestamp: SystemTime::now(),
            data: data.to_vec(),
        };
        if self.tx.send(packet).is_err() {
            debug!("capture consumer gone, packet not recorded");
        }
    }
}

/// Consumer half, owned by exactly one drain task.
pub struct CaptureConsumer {
    rx: mpsc::UnboundedReceiver<CapturedPacket>,
}

impl CaptureConsumer {
    /// Drain packets into `sink` until every producer handle is dropped.
    pub async fn run<S: CaptureSink>(mut self, mut sink: S) {
        while let Some(packet) = self.rx.recv().await {
            sink.deliver(packet);
        }
        debug!("capture queue drained, consumer exiting");
    }

    /// Non-blocking drain, for tests and synchronous shutdown paths.
    pub fn drain_into<S: CaptureSink>(&mut self, sink: &mut S) -> usize {
        let mut count = 0;
        while let Ok(packet) = self.rx.try_recv() {
            sink.deliver(packet);
            count += 1;
        }
        count
    }
}

/// Build a connected producer/consumer pair.
pub fn capture_channel() -> (CaptureQueue, CaptureConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CaptureQueue { tx }, CaptureConsumer { rx })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that keeps everything in memory for assertions.
    #[derive(Clone, Default)]
    pub struct MemorySink {
        pub packets: Arc<Mutex<Vec<CapturedPacket>>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn in_direction(&self, direction: Direction) -> Vec<Vec<u8>> {
            self.packets
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.direction == direction)
                .map(|p| p.data.clone())
                .collect()
        }
    }

    impl CaptureSink for MemorySink {
        fn deliver(&mut self, packet: CapturedPacket) {
            self.packets.lock().unwrap().push(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;

    #[test]
    fn push_copies_and_preserves_order() {
        let (queue, mut consumer) = capture_channel();
        let mut original = vec![1u8, 2, 3];
        queue.push(Direction::Inbound, &original);
        original[0] = 99; // queue holds its own copy
        queue.push(Direction::Outbound, &[4, 5]);
        queue.push(Direction::Inbound, &[6]);

        let mut sink = MemorySink::new();
        assert_eq!(consumer.drain_into(&mut sink), 3);
        let inbound = sink.in_direction(Direction::Inbound);
        assert_eq!(inbound, vec![vec![1, 2, 3], vec![6]]);
        let outbound = sink.in_direction(Direction::Outbound);
        assert_eq!(outbound, vec![vec![4, 5]]);
    }

    #[tokio::test]
    async fn consumer_parks_until_producers_drop() {
        let (queue, consumer) = capture_channel();
        let sink = MemorySink::new();
        let packets = sink.packets.clone();

        let handle = tokio::spawn(consumer.run(sink));
        queue.push(Direction::Inbound, &[7, 7]);
        drop(queue);
        handle.await.unwrap();

        assert_eq!(packets.lock().unwrap().len(), 1);
    }

    #[test]
    fn push_after_consumer_drop_does_not_panic() {
        let (queue, consumer) = capture_channel();
        drop(consumer);
        queue.push(Direction::Inbound, &[1]);
    }
}

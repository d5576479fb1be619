// net_queue.rs -- thread-safe packet queueing between receive threads and
// the single-threaded pump
//
// Each socket gets a background receive thread; all of them feed one bounded
// queue that the owning process drains once per tick. When the queue is full
// new packets are dropped, never blocking the producer.

use crate::netadr::NetAdr;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

/// Identifies which socket a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockId(pub u32);

/// A received datagram with source address and arrival timestamp.
#[derive(Clone)]
pub struct QueuedPacket {
    pub sock: SockId,
    pub from: NetAdr,
    pub data: Vec<u8>,
    /// sys_milliseconds at receive time
    pub timestamp: u64,
}

impl QueuedPacket {
    pub fn new(sock: SockId, from: NetAdr, data: Vec<u8>, timestamp: u64) -> Self {
        Self {
            sock,
            from,
            data,
            timestamp,
        }
    }
}

/// Default queue capacity - handles typical burst traffic without excessive
/// memory use.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub struct PacketQueue {
    sender: Sender<QueuedPacket>,
    receiver: Receiver<QueuedPacket>,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Clone of the producer handle for a receive thread.
    pub fn sender(&self) -> PacketQueueSender {
        PacketQueueSender {
            sender: self.sender.clone(),
        }
    }

    /// Non-blocking dequeue.
    pub fn try_recv(&self) -> Option<QueuedPacket> {
        self.receiver.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[derive(Clone)]
pub struct PacketQueueSender {
    sender: Sender<QueuedPacket>,
}

impl PacketQueueSender {
    /// Returns false if the packet was dropped (queue full or closed).
    pub fn try_send(&self, packet: QueuedPacket) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(id: u8) -> QueuedPacket {
        QueuedPacket::new(SockId(7), NetAdr::new([127, 0, 0, 1], 27010), vec![id], 1000)
    }

    #[test]
    fn queue_basic_operations() {
        let queue = PacketQueue::new(10);
        let sender = queue.sender();

        assert!(queue.is_empty());
        assert!(sender.try_send(make_packet(1)));
        assert_eq!(queue.len(), 1);

        let packet = queue.try_recv().unwrap();
        assert_eq!(packet.data, vec![1]);
        assert_eq!(packet.sock, SockId(7));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn queue_full_drops_packets() {
        let queue = PacketQueue::new(2);
        let sender = queue.sender();

        assert!(sender.try_send(make_packet(1)));
        assert!(sender.try_send(make_packet(2)));
        assert!(!sender.try_send(make_packet(3)));

        assert_eq!(queue.try_recv().unwrap().data, vec![1]);
        assert_eq!(queue.try_recv().unwrap().data, vec![2]);
    }
}

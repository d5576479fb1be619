// net_io.rs -- background receive threads
//
// One thread per socket. Each thread blocks on recv_from with a short
// timeout, tags packets with its socket id, and pushes them into the shared
// bounded queue; the pump thread drains them once per tick. Threads carry
// their own shutdown flag because sockets open and close independently
// while a client migrates between roles.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use drift_common::chan::MAX_DATAGRAM;
use drift_common::common::{con_printf, sys_milliseconds};
use drift_common::net_queue::{PacketQueueSender, QueuedPacket, SockId};
use drift_common::netadr::NetAdr;

/// recv timeout; bounds shutdown latency.
const IO_POLL_TIMEOUT_MS: u64 = 10;

/// Per-iteration packet cap so one busy socket cannot starve shutdown
/// checks.
const MAX_PACKETS_PER_ITERATION: usize = 32;

/// Handle to one receive thread. Dropping it stops and joins the thread.
pub struct IoThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub fn spawn_io_thread(sock: SockId, socket: Arc<UdpSocket>, sender: PacketQueueSender) -> IoThread {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let handle = thread::Builder::new()
        .name(format!("net-io-{}", sock.0))
        .spawn(move || io_loop(sock, socket, sender, flag))
        .ok();
    if handle.is_none() {
        con_printf("[net] failed to spawn receive thread\n");
    }

    IoThread {
        shutdown,
        handle,
    }
}

fn io_loop(sock: SockId, socket: Arc<UdpSocket>, sender: PacketQueueSender, shutdown: Arc<AtomicBool>) {
    if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(IO_POLL_TIMEOUT_MS))) {
        con_printf(&format!("[net] set_read_timeout: {}\n", e));
        return;
    }

    let mut buf = [0u8; MAX_DATAGRAM];

    while !shutdown.load(Ordering::Relaxed) {
        let mut packets_this_iteration = 0;

        loop {
            match socket.recv_from(&mut buf) {
                Ok((size, from_addr)) => {
                    if size == 0 || size > MAX_DATAGRAM {
                        continue;
                    }
                    // IPv6 peers are not representable; drop silently
                    let Some(from) = NetAdr::from_socket_addr(&from_addr) else {
                        continue;
                    };
                    let packet =
                        QueuedPacket::new(sock, from, buf[..size].to_vec(), sys_milliseconds());
                    // queue full: drop, the channel layer absorbs loss
                    let _ = sender.try_send(packet);

                    packets_this_iteration += 1;
                    if packets_this_iteration >= MAX_PACKETS_PER_ITERATION {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => {
                    if !shutdown.load(Ordering::Relaxed) {
                        con_printf(&format!("[net] recv error: {}\n", e));
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net_udp::{local_port, open_udp_socket, send_packet};
    use drift_common::net_queue::PacketQueue;

    #[test]
    fn receive_thread_delivers_to_queue() {
        let queue = PacketQueue::default();
        let socket = Arc::new(open_udp_socket(0).unwrap());
        let port = local_port(&socket);
        let _io = spawn_io_thread(SockId(1), Arc::clone(&socket), queue.sender());

        let sender = open_udp_socket(0).unwrap();
        send_packet(&sender, b"hello", &NetAdr::new([127, 0, 0, 1], port));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(packet) = queue.try_recv() {
                assert_eq!(packet.data, b"hello");
                assert_eq!(packet.sock, SockId(1));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "packet never arrived");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

// net_udp.rs -- UDP socket creation and raw sends
//
// Sockets are opened through socket2 so we can request low-delay ToS.
// Receives happen on the background thread (net_io.rs) via a read timeout;
// sends stay synchronous on the pump thread since they are fast and we want
// immediate error feedback.

use std::io;
use std::net::UdpSocket;

use drift_common::common::con_printf;
use drift_common::netadr::NetAdr;
use socket2::{Domain, Protocol, Socket, Type};

/// Hint routers to prioritize this traffic.
const IPTOS_LOWDELAY: u32 = 0x10;

/// Bind a UDP socket on 0.0.0.0. Port 0 asks the OS for a dynamic port;
/// query the result with `local_port`.
pub fn open_udp_socket(port: u16) -> Result<UdpSocket, String> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| format!("udp socket: {}", e))?;

    if let Err(e) = socket.set_tos(IPTOS_LOWDELAY) {
        // some platforms refuse; not fatal
        con_printf(&format!("[net] warning: set_tos: {}\n", e));
    }

    let addr: std::net::SocketAddrV4 = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| format!("udp bind address: {}", e))?;
    socket
        .bind(&socket2::SockAddr::from(addr))
        .map_err(|e| format!("udp bind {}: {}", port, e))?;

    Ok(socket.into())
}

pub fn local_port(socket: &UdpSocket) -> u16 {
    socket.local_addr().map(|a| a.port()).unwrap_or(0)
}

/// Fire-and-forget datagram send. Errors are logged, never propagated; the
/// channel layer recovers from loss.
pub fn send_packet(socket: &UdpSocket, data: &[u8], to: &NetAdr) {
    if let Err(e) = socket.send_to(data, to.to_socket_addr()) {
        if e.kind() != io::ErrorKind::WouldBlock {
            con_printf(&format!("[net] send to {} failed: {}\n", to, e));
        }
    }
}

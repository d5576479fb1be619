// drift-net -- the transport runtime
//
// UDP sockets with background receive threads feeding one packet queue, a
// connection table with an out-of-band handshake, per-connection channels,
// and a status-event stream routed to components by the application.

pub mod net_io;
pub mod net_udp;
pub mod transport;

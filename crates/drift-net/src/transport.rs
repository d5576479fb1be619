// transport.rs -- connection-oriented datagram transport
//
// The runtime behind every component: listen sockets accept connections,
// outbound connections dial them, and both sides get a NetChan carrying
// reliable and unreliable messages. Connection establishment and teardown
// ride out-of-band datagrams (leading 0xFFFFFFFF word, like the channel's
// sequence space never produces). Status changes surface as ConnEvents the
// application drains once per tick and routes to exactly one component.
//
// Ownership model: a connection handle belongs to the component that
// initiated or accepted it; close() is idempotent and is the only way an
// entry leaves the table after a terminal state.

use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::Arc;

use drift_common::chan::NetChan;
use drift_common::common::{con_dprintf, sys_milliseconds};
use drift_common::net_queue::{PacketQueue, SockId};
use drift_common::netadr::NetAdr;

use crate::net_io::{spawn_io_thread, IoThread};
use crate::net_udp::{local_port, open_udp_socket, send_packet};

/// Transport-level handshake version, independent of the app protocols.
pub const TRANSPORT_PROTOCOL: u32 = 1;

/// Connect request cadence and give-up point for outbound dials.
pub const CONNECT_RETRY_MS: u64 = 500;
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

const OOB_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const OOB_CONNECT: u8 = 1;
const OOB_ACCEPT: u8 = 2;
const OOB_REJECT: u8 = 3;
const OOB_CLOSE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u32);

impl ConnId {
    pub fn from_raw(v: u32) -> Self {
        Self(v)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenId(u32);

impl ListenId {
    pub fn from_raw(v: u32) -> Self {
        Self(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Placeholder for "did not exist yet" in events.
    None,
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

/// One connection status change, delivered through the event queue.
#[derive(Debug, Clone)]
pub struct ConnEvent {
    pub conn: ConnId,
    /// Set when the connection arrived through a listen socket.
    pub listen: Option<ListenId>,
    pub old_state: ConnState,
    pub new_state: ConnState,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote: NetAdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Reliable,
    Unreliable,
}

struct SocketEntry {
    socket: Arc<UdpSocket>,
    _io: IoThread,
}

struct Listen {
    sock: SockId,
    port: u16,
    conns: Vec<ConnId>,
}

struct Conn {
    sock: SockId,
    listen: Option<ListenId>,
    remote: NetAdr,
    state: ConnState,
    chan: NetChan,
    inbox: VecDeque<Vec<u8>>,
    nonce: u32,
    connect_started: u64,
    last_connect_send: u64,
}

enum OobMsg {
    Connect { protocol: u32, nonce: u32 },
    Accept { nonce: u32 },
    Reject { reason: String },
    Close { reason: String },
}

pub struct Transport {
    queue: PacketQueue,
    sockets: HashMap<SockId, SocketEntry>,
    listens: HashMap<ListenId, Listen>,
    conns: HashMap<ConnId, Conn>,
    by_addr: HashMap<(SockId, NetAdr), ConnId>,
    events: VecDeque<ConnEvent>,
    next_id: u32,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            queue: PacketQueue::default(),
            sockets: HashMap::new(),
            listens: HashMap::new(),
            conns: HashMap::new(),
            by_addr: HashMap::new(),
            events: VecDeque::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Open a listen socket. Port 0 binds a dynamic port.
    pub fn listen(&mut self, port: u16) -> Result<ListenId, String> {
        let socket = Arc::new(open_udp_socket(port)?);
        let actual_port = local_port(&socket);

        let sock = SockId(self.alloc_id());
        let id = ListenId(self.alloc_id());
        let io = spawn_io_thread(sock, Arc::clone(&socket), self.queue.sender());

        self.sockets.insert(sock, SocketEntry { socket, _io: io });
        self.listens.insert(
            id,
            Listen {
                sock,
                port: actual_port,
                conns: Vec::new(),
            },
        );
        Ok(id)
    }

    pub fn listen_port(&self, listen: ListenId) -> Option<u16> {
        self.listens.get(&listen).map(|l| l.port)
    }

    /// Dial a remote listen socket. The connection starts in Connecting and
    /// resolves through the event queue.
    pub fn connect(&mut self, addr: NetAdr) -> Result<ConnId, String> {
        let socket = Arc::new(open_udp_socket(0)?);
        let sock = SockId(self.alloc_id());
        let id = ConnId(self.alloc_id());
        let io = spawn_io_thread(sock, Arc::clone(&socket), self.queue.sender());

        let now = sys_milliseconds();
        let nonce = rand::random::<u32>();
        send_packet(&socket, &oob_connect(nonce), &addr);

        self.sockets.insert(sock, SocketEntry { socket, _io: io });
        self.conns.insert(
            id,
            Conn {
                sock,
                listen: None,
                remote: addr,
                state: ConnState::Connecting,
                chan: NetChan::new(addr, now),
                inbox: VecDeque::new(),
                nonce,
                connect_started: now,
                last_connect_send: now,
            },
        );
        self.by_addr.insert((sock, addr), id);
        Ok(id)
    }

    /// Accept a connection announced by a Connecting event.
    pub fn accept(&mut self, conn: ConnId) -> bool {
        let Some(c) = self.conns.get_mut(&conn) else {
            return false;
        };
        if c.state != ConnState::Connecting || c.listen.is_none() {
            return false;
        }
        let Some(entry) = self.sockets.get(&c.sock) else {
            return false;
        };
        send_packet(&entry.socket, &oob_accept(c.nonce), &c.remote);
        c.state = ConnState::Connected;
        c.chan.last_received = sys_milliseconds();
        let listen = c.listen;
        self.events.push_back(ConnEvent {
            conn,
            listen,
            old_state: ConnState::Connecting,
            new_state: ConnState::Connected,
            reason: String::new(),
        });
        true
    }

    /// Close a connection and forget it. Safe to call on unknown or already
    /// closed handles. Pending-accept connections are rejected with the
    /// reason; live ones get a close notification.
    pub fn close(&mut self, conn: ConnId, reason: &str) {
        let Some(c) = self.conns.remove(&conn) else {
            return;
        };
        self.by_addr.remove(&(c.sock, c.remote));

        if let Some(entry) = self.sockets.get(&c.sock) {
            match c.state {
                ConnState::Connecting if c.listen.is_some() => {
                    send_packet(&entry.socket, &oob_reason(OOB_REJECT, reason), &c.remote);
                }
                ConnState::Connecting | ConnState::Connected => {
                    send_packet(&entry.socket, &oob_reason(OOB_CLOSE, reason), &c.remote);
                }
                _ => {}
            }
        }

        if let Some(listen) = c.listen {
            if let Some(l) = self.listens.get_mut(&listen) {
                l.conns.retain(|&id| id != conn);
            }
        } else {
            // outbound connections own their socket
            self.sockets.remove(&c.sock);
        }
    }

    /// Close a listen socket and every connection accepted from it.
    pub fn close_listen(&mut self, listen: ListenId, reason: &str) {
        let Some(l) = self.listens.remove(&listen) else {
            return;
        };
        for conn in l.conns {
            if let Some(c) = self.conns.remove(&conn) {
                self.by_addr.remove(&(c.sock, c.remote));
                if let Some(entry) = self.sockets.get(&c.sock) {
                    let op = if c.state == ConnState::Connecting {
                        OOB_REJECT
                    } else {
                        OOB_CLOSE
                    };
                    if matches!(c.state, ConnState::Connecting | ConnState::Connected) {
                        send_packet(&entry.socket, &oob_reason(op, reason), &c.remote);
                    }
                }
            }
        }
        self.sockets.remove(&l.sock);
    }

    pub fn conn_state(&self, conn: ConnId) -> Option<ConnState> {
        self.conns.get(&conn).map(|c| c.state)
    }

    pub fn conn_info(&self, conn: ConnId) -> Option<ConnInfo> {
        self.conns.get(&conn).map(|c| ConnInfo { remote: c.remote })
    }

    /// Queue a message. Returns false unless the connection is live.
    pub fn send(&mut self, conn: ConnId, msg: &[u8], mode: SendMode) -> bool {
        let Some(c) = self.conns.get_mut(&conn) else {
            return false;
        };
        if c.state != ConnState::Connected {
            return false;
        }
        match mode {
            SendMode::Reliable => c.chan.send_reliable(msg),
            SendMode::Unreliable => c.chan.send_unreliable(msg),
        }
    }

    /// Drain the received messages of one connection, in arrival order.
    pub fn poll(&mut self, conn: ConnId) -> Vec<Vec<u8>> {
        match self.conns.get_mut(&conn) {
            Some(c) => c.inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Drain every connection accepted from a listen socket.
    pub fn poll_group(&mut self, listen: ListenId) -> Vec<(ConnId, Vec<u8>)> {
        let Some(l) = self.listens.get(&listen) else {
            return Vec::new();
        };
        let ids = l.conns.clone();
        let mut out = Vec::new();
        for id in ids {
            if let Some(c) = self.conns.get_mut(&id) {
                for msg in c.inbox.drain(..) {
                    out.push((id, msg));
                }
            }
        }
        out
    }

    pub fn next_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    /// Ingest received datagrams and run connection timers. Call once per
    /// tick before pumping components.
    pub fn update(&mut self) {
        let now = sys_milliseconds();

        while let Some(packet) = self.queue.try_recv() {
            self.handle_packet(packet.sock, packet.from, &packet.data, now);
        }

        self.run_timers(now);
    }

    /// Transmit everything the channels owe the wire. Call once per tick
    /// after components have queued their sends.
    pub fn flush(&mut self) {
        let now = sys_milliseconds();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            let Some(c) = self.conns.get_mut(&id) else {
                continue;
            };
            if c.state != ConnState::Connected || !c.chan.needs_transmit(now) {
                continue;
            }
            let dgrams = c.chan.transmit(now);
            let sock = c.sock;
            let remote = c.remote;
            if let Some(entry) = self.sockets.get(&sock) {
                for dgram in &dgrams {
                    send_packet(&entry.socket, dgram, &remote);
                }
            }
        }
    }

    // ============================================================
    // internals
    // ============================================================

    fn push_event(
        &mut self,
        conn: ConnId,
        listen: Option<ListenId>,
        old_state: ConnState,
        new_state: ConnState,
        reason: &str,
    ) {
        self.events.push_back(ConnEvent {
            conn,
            listen,
            old_state,
            new_state,
            reason: reason.to_string(),
        });
    }

    fn listen_id_for_sock(&self, sock: SockId) -> Option<ListenId> {
        self.listens
            .iter()
            .find(|(_, l)| l.sock == sock)
            .map(|(&id, _)| id)
    }

    fn handle_packet(&mut self, sock: SockId, from: NetAdr, data: &[u8], now: u64) {
        if !self.sockets.contains_key(&sock) {
            return;
        }

        if let Some(oob) = parse_oob(data) {
            self.handle_oob(sock, from, oob, now);
            return;
        }

        let Some(&conn) = self.by_addr.get(&(sock, from)) else {
            return;
        };
        let Some(c) = self.conns.get_mut(&conn) else {
            return;
        };

        match c.state {
            ConnState::Connecting if c.listen.is_none() => {
                // channel traffic from the server implies our accept was
                // lost in transit; promote and process normally
                c.state = ConnState::Connected;
                if let Some(inc) = c.chan.process(data, now) {
                    c.inbox.extend(inc.reliable);
                    c.inbox.extend(inc.unreliable);
                }
                self.push_event(conn, None, ConnState::Connecting, ConnState::Connected, "");
            }
            ConnState::Connected => {
                if let Some(inc) = c.chan.process(data, now) {
                    c.inbox.extend(inc.reliable);
                    c.inbox.extend(inc.unreliable);
                }
            }
            _ => {}
        }
    }

    fn handle_oob(&mut self, sock: SockId, from: NetAdr, oob: OobMsg, now: u64) {
        let existing = self.by_addr.get(&(sock, from)).copied();

        match oob {
            OobMsg::Connect { protocol, nonce } => {
                let Some(listen) = self.listen_id_for_sock(sock) else {
                    return;
                };
                if protocol != TRANSPORT_PROTOCOL {
                    return;
                }

                if let Some(conn) = existing {
                    let Some(c) = self.conns.get_mut(&conn) else {
                        return;
                    };
                    if c.nonce == nonce {
                        if c.state == ConnState::Connected {
                            // our accept was lost; repeat it
                            if let Some(entry) = self.sockets.get(&c.sock) {
                                send_packet(&entry.socket, &oob_accept(nonce), &from);
                            }
                        }
                        return;
                    }
                    // same address, new nonce: the peer restarted
                    let old_state = c.state;
                    let listen_of_old = c.listen;
                    self.close_silent(conn);
                    if old_state == ConnState::Connected {
                        self.push_event(
                            conn,
                            listen_of_old,
                            old_state,
                            ConnState::ClosedByPeer,
                            "peer restarted",
                        );
                    }
                }

                let id = ConnId(self.alloc_id());
                self.conns.insert(
                    id,
                    Conn {
                        sock,
                        listen: Some(listen),
                        remote: from,
                        state: ConnState::Connecting,
                        chan: NetChan::new(from, now),
                        inbox: VecDeque::new(),
                        nonce,
                        connect_started: now,
                        last_connect_send: now,
                    },
                );
                self.by_addr.insert((sock, from), id);
                if let Some(l) = self.listens.get_mut(&listen) {
                    l.conns.push(id);
                }
                self.push_event(id, Some(listen), ConnState::None, ConnState::Connecting, "");
            }

            OobMsg::Accept { nonce } => {
                let Some(conn) = existing else {
                    return;
                };
                let Some(c) = self.conns.get_mut(&conn) else {
                    return;
                };
                if c.listen.is_some() || c.state != ConnState::Connecting || c.nonce != nonce {
                    return;
                }
                c.state = ConnState::Connected;
                c.chan.last_received = now;
                self.push_event(conn, None, ConnState::Connecting, ConnState::Connected, "");
            }

            OobMsg::Reject { reason } => {
                let Some(conn) = existing else {
                    return;
                };
                let Some(c) = self.conns.get_mut(&conn) else {
                    return;
                };
                if c.listen.is_some() || c.state != ConnState::Connecting {
                    return;
                }
                c.state = ConnState::ProblemDetectedLocally;
                let listen = c.listen;
                self.push_event(
                    conn,
                    listen,
                    ConnState::Connecting,
                    ConnState::ProblemDetectedLocally,
                    &reason,
                );
            }

            OobMsg::Close { reason } => {
                let Some(conn) = existing else {
                    return;
                };
                let Some(c) = self.conns.get_mut(&conn) else {
                    return;
                };
                if !matches!(c.state, ConnState::Connecting | ConnState::Connected) {
                    return;
                }
                let old = c.state;
                c.state = ConnState::ClosedByPeer;
                let listen = c.listen;
                self.push_event(conn, listen, old, ConnState::ClosedByPeer, &reason);
            }
        }
    }

    /// Remove a connection without notifying the peer.
    fn close_silent(&mut self, conn: ConnId) {
        if let Some(c) = self.conns.remove(&conn) {
            self.by_addr.remove(&(c.sock, c.remote));
            if let Some(listen) = c.listen {
                if let Some(l) = self.listens.get_mut(&listen) {
                    l.conns.retain(|&id| id != conn);
                }
            } else {
                self.sockets.remove(&c.sock);
            }
        }
    }

    fn run_timers(&mut self, now: u64) {
        enum Action {
            ResendConnect(ConnId),
            ConnectFailed(ConnId),
            DropStale(ConnId),
            TimedOut(ConnId, Option<ListenId>),
        }

        let mut actions = Vec::new();
        for (&id, c) in &self.conns {
            match c.state {
                ConnState::Connecting if c.listen.is_none() => {
                    if now.saturating_sub(c.connect_started) > CONNECT_TIMEOUT_MS {
                        actions.push(Action::ConnectFailed(id));
                    } else if now.saturating_sub(c.last_connect_send) >= CONNECT_RETRY_MS {
                        actions.push(Action::ResendConnect(id));
                    }
                }
                ConnState::Connecting => {
                    // inbound, never accepted by the owning component
                    if now.saturating_sub(c.connect_started) > CONNECT_TIMEOUT_MS {
                        actions.push(Action::DropStale(id));
                    }
                }
                ConnState::Connected => {
                    if c.chan.timed_out(now) {
                        actions.push(Action::TimedOut(id, c.listen));
                    }
                }
                _ => {}
            }
        }

        for action in actions {
            match action {
                Action::ResendConnect(id) => {
                    let (sock, remote, nonce) = {
                        let c = &self.conns[&id];
                        (c.sock, c.remote, c.nonce)
                    };
                    if let Some(entry) = self.sockets.get(&sock) {
                        send_packet(&entry.socket, &oob_connect(nonce), &remote);
                    }
                    if let Some(c) = self.conns.get_mut(&id) {
                        c.last_connect_send = now;
                    }
                }
                Action::ConnectFailed(id) => {
                    if let Some(c) = self.conns.get_mut(&id) {
                        c.state = ConnState::ProblemDetectedLocally;
                    }
                    self.push_event(
                        id,
                        None,
                        ConnState::Connecting,
                        ConnState::ProblemDetectedLocally,
                        "connect timeout",
                    );
                }
                Action::DropStale(id) => {
                    con_dprintf("[net] dropping unaccepted connection\n");
                    self.close_silent(id);
                }
                Action::TimedOut(id, listen) => {
                    if let Some(c) = self.conns.get_mut(&id) {
                        c.state = ConnState::ProblemDetectedLocally;
                    }
                    self.push_event(
                        id,
                        listen,
                        ConnState::Connected,
                        ConnState::ProblemDetectedLocally,
                        "timeout",
                    );
                }
            }
        }
    }
}

// ============================================================
// Out-of-band datagrams
// ============================================================

fn oob_connect(nonce: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&OOB_MARKER);
    out.push(OOB_CONNECT);
    out.extend_from_slice(&TRANSPORT_PROTOCOL.to_le_bytes());
    out.extend_from_slice(&nonce.to_le_bytes());
    out
}

fn oob_accept(nonce: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(&OOB_MARKER);
    out.push(OOB_ACCEPT);
    out.extend_from_slice(&nonce.to_le_bytes());
    out
}

fn oob_reason(op: u8, reason: &str) -> Vec<u8> {
    let bytes = reason.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(6 + len);
    out.extend_from_slice(&OOB_MARKER);
    out.push(op);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
    out
}

fn parse_oob(data: &[u8]) -> Option<OobMsg> {
    if data.len() < 5 || data[..4] != OOB_MARKER {
        return None;
    }
    let op = data[4];
    let rest = &data[5..];
    match op {
        OOB_CONNECT => {
            if rest.len() < 8 {
                return None;
            }
            Some(OobMsg::Connect {
                protocol: u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
                nonce: u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
            })
        }
        OOB_ACCEPT => {
            if rest.len() < 4 {
                return None;
            }
            Some(OobMsg::Accept {
                nonce: u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
            })
        }
        OOB_REJECT | OOB_CLOSE => {
            let len = *rest.first()? as usize;
            if rest.len() < 1 + len {
                return None;
            }
            let reason = String::from_utf8_lossy(&rest[1..1 + len]).into_owned();
            if op == OOB_REJECT {
                Some(OobMsg::Reject { reason })
            } else {
                Some(OobMsg::Close { reason })
            }
        }
        _ => None,
    }
}

// ============================================================
// Event router
// ============================================================

/// Resolves each status event to exactly one application component: the
/// listen socket registration wins, then the connection registration.
pub struct Router<T> {
    by_listen: HashMap<ListenId, T>,
    by_conn: HashMap<ConnId, T>,
}

impl<T: Copy> Router<T> {
    pub fn new() -> Self {
        Self {
            by_listen: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    pub fn register_listen(&mut self, listen: ListenId, tag: T) {
        self.by_listen.insert(listen, tag);
    }

    pub fn register_conn(&mut self, conn: ConnId, tag: T) {
        self.by_conn.insert(conn, tag);
    }

    pub fn unregister_listen(&mut self, listen: ListenId) {
        self.by_listen.remove(&listen);
    }

    pub fn unregister_conn(&mut self, conn: ConnId) {
        self.by_conn.remove(&conn);
    }

    pub fn route(&self, event: &ConnEvent) -> Option<T> {
        if let Some(listen) = event.listen {
            if let Some(&tag) = self.by_listen.get(&listen) {
                return Some(tag);
            }
        }
        self.by_conn.get(&event.conn).copied()
    }
}

impl<T: Copy> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pump(ts: &mut [&mut Transport]) {
        for t in ts.iter_mut() {
            t.update();
        }
        for t in ts.iter_mut() {
            t.flush();
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    fn wait_for<F: FnMut(&mut Transport, &mut Transport) -> bool>(
        a: &mut Transport,
        b: &mut Transport,
        mut done: F,
    ) {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            pump(&mut [&mut *a, &mut *b]);
            if done(a, b) {
                return;
            }
            assert!(Instant::now() < deadline, "condition never met");
        }
    }

    #[test]
    fn handshake_and_message_exchange() {
        let mut server = Transport::new();
        let mut client = Transport::new();

        let listen = server.listen(0).unwrap();
        let port = server.listen_port(listen).unwrap();
        let conn = client.connect(NetAdr::new([127, 0, 0, 1], port)).unwrap();

        // server accepts the inbound connection
        let mut server_conn = None;
        wait_for(&mut server, &mut client, |s, _| {
            while let Some(ev) = s.next_event() {
                if ev.new_state == ConnState::Connecting {
                    assert_eq!(ev.listen, Some(listen));
                    s.accept(ev.conn);
                    server_conn = Some(ev.conn);
                }
            }
            server_conn.is_some()
        });
        let server_conn = server_conn.unwrap();

        // client observes Connected
        let mut connected = false;
        wait_for(&mut server, &mut client, |_, c| {
            while let Some(ev) = c.next_event() {
                if ev.conn == conn && ev.new_state == ConnState::Connected {
                    connected = true;
                }
            }
            connected
        });

        // reliable server -> client, unreliable client -> server
        assert!(server.send(server_conn, b"welcome", SendMode::Reliable));
        assert!(client.send(conn, b"input", SendMode::Unreliable));

        let mut got_welcome = false;
        let mut got_input = false;
        wait_for(&mut server, &mut client, |s, c| {
            for msg in c.poll(conn) {
                if msg == b"welcome" {
                    got_welcome = true;
                }
            }
            for (from, msg) in s.poll_group(listen) {
                if msg == b"input" {
                    assert_eq!(from, server_conn);
                    got_input = true;
                }
            }
            got_welcome && got_input
        });

        assert_eq!(
            server.conn_info(server_conn).unwrap().remote.ip,
            [127, 0, 0, 1]
        );
    }

    #[test]
    fn reject_surfaces_problem_with_reason() {
        let mut server = Transport::new();
        let mut client = Transport::new();

        let listen = server.listen(0).unwrap();
        let port = server.listen_port(listen).unwrap();
        let conn = client.connect(NetAdr::new([127, 0, 0, 1], port)).unwrap();

        let mut rejected = None;
        wait_for(&mut server, &mut client, |s, c| {
            while let Some(ev) = s.next_event() {
                if ev.new_state == ConnState::Connecting {
                    s.close(ev.conn, "Server full");
                }
            }
            while let Some(ev) = c.next_event() {
                if ev.conn == conn && ev.new_state == ConnState::ProblemDetectedLocally {
                    rejected = Some(ev.reason.clone());
                }
            }
            rejected.is_some()
        });
        assert_eq!(rejected.unwrap(), "Server full");
    }

    #[test]
    fn close_notifies_peer() {
        let mut server = Transport::new();
        let mut client = Transport::new();

        let listen = server.listen(0).unwrap();
        let port = server.listen_port(listen).unwrap();
        let conn = client.connect(NetAdr::new([127, 0, 0, 1], port)).unwrap();

        let mut server_conn = None;
        wait_for(&mut server, &mut client, |s, _| {
            while let Some(ev) = s.next_event() {
                if ev.new_state == ConnState::Connecting {
                    s.accept(ev.conn);
                    server_conn = Some(ev.conn);
                }
            }
            server_conn.is_some()
        });

        // once connected, the client hangs up
        let mut hung_up = false;
        wait_for(&mut server, &mut client, |_, c| {
            while let Some(ev) = c.next_event() {
                if ev.conn == conn && ev.new_state == ConnState::Connected {
                    c.close(conn, "bye");
                    hung_up = true;
                }
            }
            hung_up
        });

        // server hears the close
        let server_conn = server_conn.unwrap();
        let mut saw_close = false;
        wait_for(&mut server, &mut client, |s, _| {
            while let Some(ev) = s.next_event() {
                if ev.conn == server_conn && ev.new_state == ConnState::ClosedByPeer {
                    saw_close = true;
                }
            }
            saw_close
        });
        assert!(saw_close);
    }

    #[test]
    fn router_prefers_listen_over_conn() {
        let mut router: Router<u8> = Router::new();
        let listen = ListenId::from_raw(10);
        let conn = ConnId::from_raw(20);
        router.register_listen(listen, 1);
        router.register_conn(conn, 2);

        let ev = ConnEvent {
            conn,
            listen: Some(listen),
            old_state: ConnState::None,
            new_state: ConnState::Connecting,
            reason: String::new(),
        };
        assert_eq!(router.route(&ev), Some(1));

        let ev = ConnEvent {
            conn,
            listen: None,
            old_state: ConnState::Connecting,
            new_state: ConnState::Connected,
            reason: String::new(),
        };
        assert_eq!(router.route(&ev), Some(2));

        router.unregister_conn(conn);
        assert_eq!(router.route(&ev), None);
    }
}

// lobby.rs -- the session directory service
//
// Thin shell around SessionTable: accepts every lobby connection, decodes
// inbound messages, applies the table rules, and answers list requests.
// Everything unauthorized or malformed is dropped without a response; the
// server never retries anything, it only expires.

use drift_common::common::{con_dprintf, con_printf};
use drift_common::lobby_proto::{
    AnnounceMsg, HeartbeatMsg, ListReqMsg, ListRespMsg, LOBBY_ANNOUNCE, LOBBY_CLAIM,
    LOBBY_HEARTBEAT, LOBBY_HELLO, LOBBY_LIST_REQ,
};
use drift_net::transport::{ConnEvent, ConnId, ConnState, ListenId, SendMode, Transport};

use crate::session::SessionTable;

#[derive(Default)]
pub struct LobbyServer {
    listen: Option<ListenId>,
    pub table: SessionTable,
}

impl LobbyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, transport: &mut Transport, port: u16) -> Result<ListenId, String> {
        let listen = transport.listen(port)?;
        self.listen = Some(listen);
        con_printf(&format!("[lobby] listening on udp port {}\n", port));
        Ok(listen)
    }

    pub fn stop(&mut self, transport: &mut Transport) {
        if let Some(listen) = self.listen.take() {
            transport.close_listen(listen, "lobby stop");
        }
    }

    pub fn listen_socket(&self) -> Option<ListenId> {
        self.listen
    }

    pub fn on_conn_status(&mut self, transport: &mut Transport, event: &ConnEvent, now: u64) {
        match event.new_state {
            ConnState::Connecting => {
                // accept quickly; authorization happens per message
                transport.accept(event.conn);
            }
            ConnState::ClosedByPeer | ConnState::ProblemDetectedLocally => {
                self.table.conn_lost(event.conn, now);
                transport.close(event.conn, "cleanup");
            }
            _ => {}
        }
    }

    /// Drain and handle every pending message, then run cleanup.
    pub fn pump(&mut self, transport: &mut Transport, now: u64) {
        self.table.sweep(now);

        let Some(listen) = self.listen else {
            return;
        };
        for (conn, msg) in transport.poll_group(listen) {
            self.handle_message(transport, conn, &msg, now);
        }
    }

    fn handle_message(&mut self, transport: &mut Transport, from: ConnId, data: &[u8], now: u64) {
        let Some(&kind) = data.first() else {
            return;
        };

        match kind {
            LOBBY_HELLO => {
                // informational; role is not used for authorization
            }
            LOBBY_ANNOUNCE | LOBBY_CLAIM => {
                let Some(msg) = AnnounceMsg::decode(data) else {
                    return;
                };
                let Some(info) = transport.conn_info(from) else {
                    return;
                };
                let ip = info.remote.ipv4_host_order();
                let verb = if msg.claim { "claim" } else { "announce" };
                if self.table.announce(from, ip, &msg, now) {
                    con_printf(&format!(
                        "[lobby] {} key={:#x} \"{}\" {}:{}\n",
                        verb, msg.session_key, msg.name, info.remote, msg.game_port
                    ));
                } else {
                    con_dprintf(&format!("[lobby] rejected {} key={:#x}\n", verb, msg.session_key));
                }
            }
            LOBBY_HEARTBEAT => {
                let Some(msg) = HeartbeatMsg::decode(data) else {
                    return;
                };
                // silently dropped unless it comes from the owner
                self.table.heartbeat(from, &msg, now);
            }
            LOBBY_LIST_REQ => {
                if ListReqMsg::decode(data).is_none() {
                    return;
                }
                self.send_list(transport, from, now);
            }
            _ => {}
        }
    }

    fn send_list(&mut self, transport: &mut Transport, to: ConnId, now: u64) {
        // expire before answering so browsers never see dead entries
        self.table.sweep(now);
        let resp = ListRespMsg {
            entries: self.table.entries(),
        };
        transport.send(to, &resp.encode(), SendMode::Reliable);
    }
}

// lobby_client.rs -- directory access for hosts and browsers
//
// One connection to the lobby server, in one of two roles. A Browser asks
// for the session table and exposes the latest response as a one-shot list.
// An Announcer carries a prepared Announce payload, fires it as soon as the
// connection comes up, and afterwards heartbeats at whatever cadence the
// caller drives. The same payload doubles as the Claim during migration.

use drift_common::common::{con_dprintf, con_printf};
use drift_common::lobby_proto::{
    AnnounceMsg, HeartbeatMsg, HelloMsg, ListReqMsg, ListRespMsg, SessionEntry, LOBBY_LIST_RESP,
    ROLE_ANNOUNCER, ROLE_BROWSER,
};
use drift_common::netadr::NetAdr;
use drift_net::transport::{ConnEvent, ConnId, ConnState, SendMode, Transport};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Browser,
    Announcer,
}

#[derive(Default)]
pub struct LobbyClient {
    role: Option<Role>,
    conn: Option<ConnId>,
    connected: bool,

    has_list: bool,
    latest_list: Vec<SessionEntry>,

    announce: Option<AnnounceMsg>,
    session_key: u64,
    /// A claim requested before the connection came up fires on Connected.
    pending_claim: bool,
}

impl LobbyClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(
        &mut self,
        transport: &mut Transport,
        addr: NetAdr,
        role: Role,
    ) -> Result<ConnId, String> {
        let conn = transport.connect(addr)?;
        self.role = Some(role);
        self.conn = Some(conn);
        self.connected = false;
        self.has_list = false;
        self.latest_list.clear();
        Ok(conn)
    }

    pub fn disconnect(&mut self, transport: &mut Transport, reason: &str) {
        if let Some(conn) = self.conn.take() {
            transport.close(conn, reason);
        }
        self.connected = false;
        self.has_list = false;
        self.latest_list.clear();
        self.pending_claim = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn on_conn_status(&mut self, transport: &mut Transport, event: &ConnEvent) {
        if Some(event.conn) != self.conn {
            return;
        }

        match event.new_state {
            ConnState::Connected => {
                self.connected = true;

                let hello = HelloMsg {
                    role: match self.role {
                        Some(Role::Announcer) => ROLE_ANNOUNCER,
                        _ => ROLE_BROWSER,
                    },
                };
                transport.send(event.conn, &hello.encode(), SendMode::Reliable);

                if self.pending_claim {
                    self.pending_claim = false;
                    self.send_claim_now(transport);
                } else if self.role == Some(Role::Announcer) && self.announce.is_some() {
                    self.send_announce_now(transport);
                }
            }
            ConnState::ClosedByPeer | ConnState::ProblemDetectedLocally => {
                con_printf(&format!("[lobby-client] lost lobby ({})\n", event.reason));
                self.connected = false;
                self.has_list = false;
                self.latest_list.clear();
                if let Some(conn) = self.conn.take() {
                    transport.close(conn, "cleanup");
                }
            }
            _ => {}
        }
    }

    pub fn pump(&mut self, transport: &mut Transport) {
        let Some(conn) = self.conn else {
            return;
        };
        for msg in transport.poll(conn) {
            self.handle_message(&msg);
        }
    }

    pub fn handle_message(&mut self, data: &[u8]) {
        if data.first() != Some(&LOBBY_LIST_RESP) {
            // only browsers receive anything, and only list responses
            return;
        }
        let Some(resp) = ListRespMsg::decode(data) else {
            return;
        };
        self.latest_list = resp.entries;
        self.has_list = true;
    }

    // ============================================================
    // browser flow
    // ============================================================

    pub fn request_list(&mut self, transport: &mut Transport) {
        if !self.connected {
            return;
        }
        if let Some(conn) = self.conn {
            transport.send(conn, &ListReqMsg.encode(), SendMode::Reliable);
        }
    }

    /// Destructive read of the most recent list response.
    pub fn pop_latest_list(&mut self) -> Option<Vec<SessionEntry>> {
        if !self.has_list {
            return None;
        }
        self.has_list = false;
        Some(std::mem::take(&mut self.latest_list))
    }

    // ============================================================
    // announcer flow
    // ============================================================

    fn gen_session_key() -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let key: u64 = rng.gen();
            if key != 0 {
                return key;
            }
        }
    }

    pub fn session_key(&self) -> u64 {
        self.session_key
    }

    /// For migration: preserve the session key of the run being taken over.
    /// Zero falls back to a fresh random key.
    pub fn set_session_key(&mut self, key: u64) {
        self.session_key = if key != 0 { key } else { Self::gen_session_key() };
        if let Some(a) = self.announce.as_mut() {
            a.session_key = self.session_key;
        }
    }

    /// Prepare the announce payload, generating a session key on first use.
    pub fn set_announce_info(&mut self, game_port: u16, max_players: u8, world_seed: u32, name: &str) {
        if self.session_key == 0 {
            self.session_key = Self::gen_session_key();
        }
        let key = self.session_key;
        self.set_announce_info_keyed(key, game_port, max_players, world_seed, name);
    }

    pub fn set_announce_info_keyed(
        &mut self,
        session_key: u64,
        game_port: u16,
        max_players: u8,
        world_seed: u32,
        name: &str,
    ) {
        self.session_key = if session_key != 0 {
            session_key
        } else {
            Self::gen_session_key()
        };
        self.announce = Some(AnnounceMsg {
            claim: false,
            session_key: self.session_key,
            game_port,
            max_players: if max_players == 0 { 3 } else { max_players },
            world_seed,
            name: name.to_string(),
        });
    }

    pub fn send_announce_now(&mut self, transport: &mut Transport) {
        let (Some(conn), Some(a)) = (self.conn, self.announce.as_mut()) else {
            return;
        };
        if !self.connected {
            return;
        }
        a.claim = false;
        transport.send(conn, &a.encode(), SendMode::Reliable);
        con_dprintf(&format!("[lobby-client] announce key={:#x}\n", a.session_key));
    }

    /// Same payload as the announce, sent as a Claim to take over a
    /// migrating session. Queued until Connected when the lobby connection
    /// is still coming up.
    pub fn send_claim_now(&mut self, transport: &mut Transport) {
        if self.announce.is_none() {
            return;
        }
        if !self.connected {
            self.pending_claim = true;
            return;
        }
        let (Some(conn), Some(a)) = (self.conn, self.announce.as_mut()) else {
            return;
        };
        a.claim = true;
        transport.send(conn, &a.encode(), SendMode::Reliable);
        a.claim = false;
        con_dprintf(&format!("[lobby-client] claim key={:#x}\n", a.session_key));
    }

    /// Liveness plus player count, unreliable. The count is clamped here and
    /// re-clamped by the server against the session's max.
    pub fn send_heartbeat(&mut self, transport: &mut Transport, cur_players: u16) {
        if !self.connected || self.session_key == 0 {
            return;
        }
        let Some(conn) = self.conn else {
            return;
        };
        let hb = HeartbeatMsg {
            session_key: self.session_key,
            cur_players: cur_players.max(1),
        };
        transport.send(conn, &hb.encode(), SendMode::Unreliable);
    }
}

// game_client.rs -- the joining side of a session
//
// One connection to the host. Snapshots land in a single-slot mailbox with
// a destructive read, inputs go out unreliably and only once the game has
// started, and host loss surfaces as a one-shot flag for the migration
// coordinator to consume.

use drift_common::common::{con_dprintf, con_printf};
use drift_common::game_proto::{
    GameHelloMsg, InputMsg, SnapMsg, StartGameMsg, WelcomeMsg, GAME_SNAP, GAME_START,
    GAME_WELCOME, MAX_PLAYERS, UNASSIGNED_ID,
};
use drift_common::netadr::NetAdr;
use drift_net::transport::{ConnEvent, ConnId, ConnState, SendMode, Transport};

#[derive(Default)]
pub struct GameClient {
    conn: Option<ConnId>,
    connected: bool,

    my_id: u8,
    client_tick: u32,
    world_seed: u32,
    game_started: bool,

    has_snap: bool,
    latest: SnapMsg,

    host_disconnected: bool,
}

impl GameClient {
    pub fn new() -> Self {
        Self {
            my_id: UNASSIGNED_ID,
            ..Self::default()
        }
    }

    pub fn connect(&mut self, transport: &mut Transport, addr: NetAdr) -> Result<ConnId, String> {
        let conn = transport.connect(addr)?;
        self.conn = Some(conn);
        self.connected = false;
        self.my_id = UNASSIGNED_ID;
        self.game_started = false;
        self.has_snap = false;
        self.host_disconnected = false;
        Ok(conn)
    }

    pub fn disconnect(&mut self, transport: &mut Transport, reason: &str) {
        if let Some(conn) = self.conn.take() {
            transport.close(conn, reason);
        }
        self.connected = false;
        self.my_id = UNASSIGNED_ID;
        self.has_snap = false;
        self.game_started = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn my_id(&self) -> u8 {
        self.my_id
    }

    pub fn world_seed(&self) -> u32 {
        self.world_seed
    }

    pub fn game_started(&self) -> bool {
        self.game_started
    }

    /// One-shot host-loss flag; the migration coordinator reads and clears
    /// it.
    pub fn host_disconnected(&self) -> bool {
        self.host_disconnected
    }

    pub fn clear_host_disconnected(&mut self) {
        self.host_disconnected = false;
    }

    pub fn on_conn_status(&mut self, transport: &mut Transport, event: &ConnEvent) {
        if Some(event.conn) != self.conn {
            return;
        }

        match event.new_state {
            ConnState::Connected => {
                self.connected = true;
                transport.send(event.conn, &GameHelloMsg.encode(), SendMode::Reliable);
                con_printf("[client] connected\n");
            }
            ConnState::ClosedByPeer | ConnState::ProblemDetectedLocally => {
                con_printf(&format!("[client] disconnected ({})\n", event.reason));
                self.host_disconnected = true;
                self.connected = false;
                self.my_id = UNASSIGNED_ID;
                self.has_snap = false;
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
        let Some(&kind) = data.first() else {
            return;
        };

        match kind {
            GAME_WELCOME => {
                let Some(w) = WelcomeMsg::decode(data) else {
                    return;
                };
                self.my_id = w.your_id;
                self.world_seed = w.world_seed;
                con_printf(&format!(
                    "[client] welcome: id={} seed={:#x}\n",
                    w.your_id, w.world_seed
                ));
            }
            GAME_SNAP => {
                let Some(snap) = SnapMsg::decode(data) else {
                    return;
                };
                // latest wins; the previous one is overwritten unread
                self.latest = snap;
                self.has_snap = true;
            }
            GAME_START => {
                let Some(start) = StartGameMsg::decode(data) else {
                    return;
                };
                // the seed may differ from Welcome's after a migration
                self.world_seed = start.world_seed;
                self.game_started = true;
                con_printf(&format!("[client] game started (seed={:#x})\n", start.world_seed));
            }
            _ => {
                con_dprintf("[client] unknown message dropped\n");
            }
        }
    }

    /// Unreliable by design: the next input supersedes a lost one. Gated on
    /// a live, started session with an assigned seat.
    pub fn send_input(&mut self, transport: &mut Transport, move_x: i8, move_y: i8) {
        if !self.connected || !self.game_started {
            return;
        }
        if self.my_id as usize >= MAX_PLAYERS {
            return;
        }
        let Some(conn) = self.conn else {
            return;
        };

        self.client_tick += 1;
        let input = InputMsg {
            client_tick: self.client_tick,
            player_id: self.my_id,
            move_x: move_x.clamp(-1, 1),
            move_y: move_y.clamp(-1, 1),
        };
        transport.send(conn, &input.encode(), SendMode::Unreliable);
    }

    /// Destructive read of the latest snapshot.
    pub fn pop_latest_snap(&mut self) -> Option<SnapMsg> {
        if !self.has_snap {
            return None;
        }
        self.has_snap = false;
        Some(self.latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::game_proto::PlayerState;

    fn snap(tick: u32) -> SnapMsg {
        let mut players = [PlayerState::default(); MAX_PLAYERS];
        for (i, p) in players.iter_mut().enumerate() {
            p.id = i as u8;
            p.x = 200.0 + 90.0 * i as f32;
            p.y = 200.0;
        }
        SnapMsg {
            server_tick: tick,
            count: MAX_PLAYERS as u8,
            players,
        }
    }

    #[test]
    fn welcome_assigns_seat_and_seed() {
        let mut c = GameClient::new();
        assert_eq!(c.my_id(), UNASSIGNED_ID);

        let w = WelcomeMsg {
            your_id: 1,
            world_seed: 0xC0FFEE,
        };
        c.handle_message(&w.encode());
        assert_eq!(c.my_id(), 1);
        assert_eq!(c.world_seed(), 0xC0FFEE);
    }

    #[test]
    fn pop_latest_snap_is_one_shot() {
        let mut c = GameClient::new();
        c.handle_message(&snap(7).encode());

        let got = c.pop_latest_snap().unwrap();
        assert_eq!(got.server_tick, 7);
        assert_eq!(got.players[1].x, 290.0);
        assert!(c.pop_latest_snap().is_none());
    }

    #[test]
    fn newer_snap_overwrites_older() {
        let mut c = GameClient::new();
        c.handle_message(&snap(1).encode());
        c.handle_message(&snap(2).encode());
        assert_eq!(c.pop_latest_snap().unwrap().server_tick, 2);
    }

    #[test]
    fn start_game_updates_seed() {
        let mut c = GameClient::new();
        c.handle_message(&WelcomeMsg { your_id: 2, world_seed: 1 }.encode());
        assert!(!c.game_started());

        c.handle_message(&StartGameMsg { world_seed: 99 }.encode());
        assert!(c.game_started());
        assert_eq!(c.world_seed(), 99, "migrated hosts may rebroadcast a new seed");
    }

    #[test]
    fn input_gated_until_started() {
        let mut c = GameClient::new();
        let mut transport = Transport::new();

        // not connected, not started, no seat: nothing ticks
        c.send_input(&mut transport, 1, 0);
        assert_eq!(c.client_tick, 0);

        c.conn = Some(ConnId::from_raw(5));
        c.connected = true;
        c.my_id = 1;
        c.send_input(&mut transport, 1, 0);
        assert_eq!(c.client_tick, 0, "no input before start");

        c.game_started = true;
        c.send_input(&mut transport, 1, 0);
        assert_eq!(c.client_tick, 1);

        // unassigned sentinel blocks sending
        c.my_id = UNASSIGNED_ID;
        c.send_input(&mut transport, 1, 0);
        assert_eq!(c.client_tick, 1);
    }

    #[test]
    fn short_messages_ignored() {
        let mut c = GameClient::new();
        c.handle_message(&[GAME_SNAP, 1, 2]);
        assert!(c.pop_latest_snap().is_none());
        c.handle_message(&[]);
    }
}

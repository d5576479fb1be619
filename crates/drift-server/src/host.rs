// host.rs -- the authoritative game host
//
// Owns the seats, the simulation, and the snapshot cadence. Seat 0 is the
// host itself; inbound connections get the lowest free seat for the life of
// the connection. Inputs are stored against the connection-to-seat map and
// the payload's player id is ignored.

use std::collections::HashMap;

use drift_common::common::{con_dprintf, con_printf};
use drift_common::game_proto::{
    InputMsg, PlayerState, SnapMsg, StartGameMsg, WelcomeMsg, GAME_HELLO, GAME_INPUT, MAX_PLAYERS,
    UNASSIGNED_ID,
};
use drift_net::transport::{ConnEvent, ConnId, ConnState, ListenId, SendMode, Transport};

/// Movement speed in world units per second.
pub const SPEED: f32 = 240.0;
/// Playfield bounds.
pub const WORLD_W: f32 = 1280.0;
pub const WORLD_H: f32 = 720.0;
/// Snapshot broadcast interval: 20 Hz.
pub const SNAP_INTERVAL: f32 = 1.0 / 20.0;

/// Spawn row: seat i starts at (200 + 90*i, 200).
const SPAWN_X: f32 = 200.0;
const SPAWN_STEP: f32 = 90.0;
const SPAWN_Y: f32 = 200.0;

pub struct GameHost {
    listen: Option<ListenId>,
    port: u16,
    world_seed: u32,

    clients: Vec<ConnId>,
    conn_to_seat: HashMap<ConnId, u8>,

    state: [PlayerState; MAX_PLAYERS],
    input_x: [i8; MAX_PLAYERS],
    input_y: [i8; MAX_PLAYERS],

    server_tick: u32,
    snap_accum: f32,
    game_started: bool,
}

impl Default for GameHost {
    fn default() -> Self {
        let mut state = [PlayerState::default(); MAX_PLAYERS];
        for (i, p) in state.iter_mut().enumerate() {
            p.id = i as u8;
            p.x = SPAWN_X + SPAWN_STEP * i as f32;
            p.y = SPAWN_Y;
        }
        Self {
            listen: None,
            port: 0,
            world_seed: 0,
            clients: Vec::new(),
            conn_to_seat: HashMap::new(),
            state,
            input_x: [0; MAX_PLAYERS],
            input_y: [0; MAX_PLAYERS],
            server_tick: 0,
            snap_accum: 0.0,
            game_started: false,
        }
    }
}

impl GameHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the listen socket. Port 0 lets the OS pick; the assigned port is
    /// available through `port()` afterwards.
    pub fn start(
        &mut self,
        transport: &mut Transport,
        port: u16,
        world_seed: u32,
    ) -> Result<ListenId, String> {
        let listen = transport.listen(port)?;
        self.listen = Some(listen);
        self.port = transport.listen_port(listen).unwrap_or(port);
        self.world_seed = world_seed;
        con_printf(&format!(
            "[host] listening on port {} (seed={:#x})\n",
            self.port, world_seed
        ));
        Ok(listen)
    }

    pub fn stop(&mut self, transport: &mut Transport) {
        if let Some(listen) = self.listen.take() {
            transport.close_listen(listen, "host stop");
        }
        self.clients.clear();
        self.conn_to_seat.clear();
    }

    pub fn listen_socket(&self) -> Option<ListenId> {
        self.listen
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn world_seed(&self) -> u32 {
        self.world_seed
    }

    pub fn game_started(&self) -> bool {
        self.game_started
    }

    pub fn server_tick(&self) -> u32 {
        self.server_tick
    }

    /// Host plus connected clients.
    pub fn cur_players(&self) -> u8 {
        1 + self.clients.len() as u8
    }

    pub fn states(&self) -> &[PlayerState; MAX_PLAYERS] {
        &self.state
    }

    /// Lowest free client seat in 1..MAX_PLAYERS; seat 0 is never handed
    /// out.
    fn pick_free_client_slot(&self) -> u8 {
        for seat in 1..MAX_PLAYERS as u8 {
            if !self.conn_to_seat.values().any(|&s| s == seat) {
                return seat;
            }
        }
        UNASSIGNED_ID
    }

    pub fn on_conn_status(&mut self, transport: &mut Transport, event: &ConnEvent) {
        match event.new_state {
            ConnState::Connecting => {
                if self.clients.len() >= MAX_PLAYERS - 1 {
                    transport.close(event.conn, "Server full");
                    return;
                }
                transport.accept(event.conn);
            }
            ConnState::Connected => {
                let seat = self.pick_free_client_slot();
                if seat == UNASSIGNED_ID {
                    transport.close(event.conn, "No slot");
                    return;
                }
                self.clients.push(event.conn);
                self.conn_to_seat.insert(event.conn, seat);

                let welcome = WelcomeMsg {
                    your_id: seat,
                    world_seed: self.world_seed,
                };
                transport.send(event.conn, &welcome.encode(), SendMode::Reliable);
                // immediate state so the new client sees something right away
                self.send_snap(transport, event.conn, true);
                // late joiners of a running game come in hot
                if self.game_started {
                    self.send_start(transport, event.conn);
                }
                con_printf(&format!("[host] client connected -> id={}\n", seat));
            }
            ConnState::ClosedByPeer | ConnState::ProblemDetectedLocally => {
                if let Some(seat) = self.conn_to_seat.remove(&event.conn) {
                    let seat = seat as usize;
                    self.input_x[seat] = 0;
                    self.input_y[seat] = 0;
                    con_printf("[host] client disconnected\n");
                }
                self.clients.retain(|&c| c != event.conn);
                transport.close(event.conn, "cleanup");
            }
            _ => {}
        }
    }

    pub fn pump(&mut self, transport: &mut Transport) {
        let Some(listen) = self.listen else {
            return;
        };
        for (conn, msg) in transport.poll_group(listen) {
            self.handle_message(conn, &msg);
        }
    }

    fn handle_message(&mut self, from: ConnId, data: &[u8]) {
        let Some(&kind) = data.first() else {
            return;
        };

        match kind {
            GAME_HELLO => {
                // nothing required; Welcome already went out on Connected
            }
            GAME_INPUT => {
                // exact size enforced by the decoder
                let Some(input) = InputMsg::decode(data) else {
                    return;
                };
                // the seat map is the sole authority, never input.player_id
                let Some(&seat) = self.conn_to_seat.get(&from) else {
                    return;
                };
                let seat = seat as usize;
                self.input_x[seat] = input.move_x.clamp(-1, 1);
                self.input_y[seat] = input.move_y.clamp(-1, 1);
            }
            _ => {
                con_dprintf("[host] unknown message dropped\n");
            }
        }
    }

    /// One simulation step. Host input drives seat 0; every seat integrates
    /// its stored input, then snapshots go out on the fixed cadence.
    pub fn update_sim(&mut self, transport: &mut Transport, dt: f32, host_mx: i8, host_my: i8) {
        self.input_x[0] = host_mx.clamp(-1, 1);
        self.input_y[0] = host_my.clamp(-1, 1);

        advance(&mut self.state, &self.input_x, &self.input_y, dt);
        self.server_tick += 1;

        self.snap_accum += dt;
        if self.snap_accum >= SNAP_INTERVAL {
            self.snap_accum -= SNAP_INTERVAL;
            self.broadcast_snap(transport);
        }
    }

    /// Idempotent: the first call flips the flag and reliably broadcasts
    /// StartGame to everyone connected.
    pub fn start_game(&mut self, transport: &mut Transport) {
        if self.game_started {
            return;
        }
        self.game_started = true;
        for conn in self.clients.clone() {
            self.send_start(transport, conn);
        }
        con_printf(&format!(
            "[host] start game broadcast (seed={:#x})\n",
            self.world_seed
        ));
    }

    /// Adopt a snapshot from a previous host after migration. Seat ids in
    /// the snapshot are preserved; only new joiners get fresh seat mappings.
    pub fn restore_state(&mut self, players: &[PlayerState; MAX_PLAYERS], server_tick: u32) {
        self.state = *players;
        self.server_tick = server_tick;
    }

    fn snapshot(&self) -> SnapMsg {
        SnapMsg {
            server_tick: self.server_tick,
            count: MAX_PLAYERS as u8,
            players: self.state,
        }
    }

    fn send_snap(&self, transport: &mut Transport, to: ConnId, reliable: bool) {
        let mode = if reliable {
            SendMode::Reliable
        } else {
            SendMode::Unreliable
        };
        transport.send(to, &self.snapshot().encode(), mode);
    }

    fn send_start(&self, transport: &mut Transport, to: ConnId) {
        let msg = StartGameMsg {
            world_seed: self.world_seed,
        };
        transport.send(to, &msg.encode(), SendMode::Reliable);
    }

    /// Drops are fine: the next snapshot supersedes this one.
    fn broadcast_snap(&self, transport: &mut Transport) {
        for &conn in &self.clients {
            self.send_snap(transport, conn, false);
        }
    }
}

/// Integrate one step of movement and clamp to the playfield.
fn advance(
    state: &mut [PlayerState; MAX_PLAYERS],
    input_x: &[i8; MAX_PLAYERS],
    input_y: &[i8; MAX_PLAYERS],
    dt: f32,
) {
    for i in 0..MAX_PLAYERS {
        state[i].x += input_x[i] as f32 * SPEED * dt;
        state[i].y += input_y[i] as f32 * SPEED * dt;
        state[i].x = state[i].x.clamp(0.0, WORLD_W);
        state[i].y = state[i].y.clamp(0.0, WORLD_H);
    }
}

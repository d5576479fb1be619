// client_app.rs -- the joining player's process
//
// Browses the directory, joins a session, plays, and survives host loss:
// on a disconnect the migration coordinator decides whether this process
// becomes the new host (claim + state restore) or chases the winner of the
// race. The phases mirror the session's life from this player's side.

use std::thread;
use std::time::Duration;

use drift_client::game_client::GameClient;
use drift_client::lobby_client::{LobbyClient, Role};
use drift_client::migrate::{Migration, MigrationAction, SavedSession};
use drift_common::common::{con_dprintf, con_printf, sys_milliseconds};
use drift_common::game_proto::{SnapMsg, MAX_PLAYERS};
use drift_common::lobby_proto::{SessionEntry, SessionState};
use drift_common::netadr::NetAdr;
use drift_net::transport::{Router, Transport};
use drift_server::host::GameHost;

use crate::Args;

/// List refresh cadence while browsing: 2 Hz.
const LIST_INTERVAL_S: f32 = 0.5;
/// Heartbeat cadence once this process hosts a migrated session.
const HEARTBEAT_INTERVAL_S: f32 = 1.0;
/// Backoff between lobby reconnect attempts.
const LOBBY_RECONNECT_MS: u64 = 3000;
/// In-game progress report cadence.
const REPORT_INTERVAL_MS: u64 = 5000;

#[derive(Clone, Copy)]
enum Route {
    Lobby,
    Game,
    Host,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Watching the directory, picking a session.
    Browse,
    /// Connected to a host, waiting for StartGame.
    WaitingForStart,
    /// Playing as a regular client.
    InGame,
    /// Host lost; the migration coordinator is running.
    Migrating,
    /// Won the migration race; this process is the authoritative host now.
    Hosting,
}

pub fn run(args: &Args) -> i32 {
    let Some(lobby_addr_str) = args.lobby_addr.as_deref() else {
        con_printf("client mode requires --lobby <ip:port>\n");
        return 6;
    };
    let Some(lobby_addr) = NetAdr::parse(lobby_addr_str) else {
        con_printf(&format!("[client] bad lobby address \"{}\"\n", lobby_addr_str));
        return 7;
    };

    let mut transport = Transport::new();
    let mut router: Router<Route> = Router::new();

    let mut lobby = LobbyClient::new();
    match lobby.connect(&mut transport, lobby_addr, Role::Browser) {
        Ok(conn) => router.register_conn(conn, Route::Lobby),
        Err(e) => {
            con_printf(&format!("[client] lobby connect failed: {}\n", e));
            return 7;
        }
    }

    let mut game = GameClient::new();
    let mut host = GameHost::new();
    let mut migration: Option<Migration> = None;

    let mut phase = Phase::Browse;
    let mut joined_key = 0u64;
    let mut joined_name = String::new();
    let mut last_snap: Option<SnapMsg> = None;
    let mut printed_table = String::new();

    let mut last = sys_milliseconds();
    let mut list_accum = LIST_INTERVAL_S; // request right away
    let mut hb_accum = 0.0f32;
    let mut reconnect_at = 0u64;
    let mut last_report = 0u64;

    loop {
        let now = sys_milliseconds();
        let dt = now.saturating_sub(last) as f32 / 1000.0;
        last = now;

        transport.update();
        while let Some(event) = transport.next_event() {
            match router.route(&event) {
                Some(Route::Lobby) => lobby.on_conn_status(&mut transport, &event),
                Some(Route::Game) => game.on_conn_status(&mut transport, &event),
                Some(Route::Host) => host.on_conn_status(&mut transport, &event),
                None => {}
            }
        }

        lobby.pump(&mut transport);
        game.pump(&mut transport);

        match phase {
            Phase::Browse | Phase::WaitingForStart => {
                // keep the directory fresh
                list_accum += dt;
                if lobby.is_connected() && list_accum >= LIST_INTERVAL_S {
                    list_accum = 0.0;
                    lobby.request_list(&mut transport);
                }

                if let Some(list) = lobby.pop_latest_list() {
                    let table = format_table(&list);
                    if table != printed_table {
                        con_printf(&table);
                        printed_table = table;
                    }

                    if phase == Phase::Browse && !args.browse_only {
                        if let Some(idx) = pick_join_index(&list, args.pick) {
                            let entry = &list[idx];
                            let addr =
                                NetAdr::from_host_order(entry.ipv4_host_order, entry.game_port);
                            match game.connect(&mut transport, addr) {
                                Ok(conn) => {
                                    router.register_conn(conn, Route::Game);
                                    // the key is our ticket through a migration
                                    joined_key = entry.session_key;
                                    joined_name = entry.name.clone();
                                    con_printf(&format!(
                                        "[client] joining \"{}\" at {}\n",
                                        entry.name, addr
                                    ));
                                    phase = Phase::WaitingForStart;
                                }
                                Err(e) => {
                                    con_printf(&format!("[client] join failed: {}\n", e));
                                }
                            }
                        }
                    }
                }

                if phase == Phase::WaitingForStart {
                    if game.host_disconnected() {
                        // host died before the game began; back to browsing
                        game.clear_host_disconnected();
                        game.disconnect(&mut transport, "host lost");
                        joined_key = 0;
                        joined_name.clear();
                        phase = Phase::Browse;
                    } else if game.game_started() {
                        con_printf("[client] entering game\n");
                        // the lobby has done its job for now
                        lobby.disconnect(&mut transport, "in game");
                        phase = Phase::InGame;
                    }
                }
            }

            Phase::InGame => {
                game.send_input(&mut transport, 0, 0);
                if let Some(snap) = game.pop_latest_snap() {
                    last_snap = Some(snap);
                }

                if now.saturating_sub(last_report) >= REPORT_INTERVAL_MS {
                    last_report = now;
                    if let Some(snap) = &last_snap {
                        let me = snap
                            .players
                            .iter()
                            .find(|p| p.id == game.my_id())
                            .map(|p| format!("({:.0}, {:.0})", p.x, p.y))
                            .unwrap_or_else(|| "?".to_string());
                        con_printf(&format!(
                            "[client] tick {}  me {}\n",
                            snap.server_tick, me
                        ));
                    }
                }

                if game.host_disconnected() {
                    game.clear_host_disconnected();
                    con_printf("[client] host disconnected, attempting migration\n");

                    // the lobby connection was dropped at game start
                    if lobby.conn().is_none() {
                        if let Ok(conn) = lobby.connect(&mut transport, lobby_addr, Role::Browser) {
                            router.register_conn(conn, Route::Lobby);
                        }
                    }

                    let saved = SavedSession {
                        session_key: joined_key,
                        name: joined_name.clone(),
                        world_seed: game.world_seed(),
                        players: last_snap.map(|s| s.players).unwrap_or_default(),
                        server_tick: last_snap.map(|s| s.server_tick).unwrap_or(0),
                    };
                    migration = Some(Migration::begin(saved, now));
                    phase = Phase::Migrating;
                }
            }

            Phase::Migrating => {
                let Some(m) = migration.as_mut() else {
                    phase = Phase::Browse;
                    continue;
                };

                match m.tick(now) {
                    MigrationAction::AttemptHost => {
                        match host.start(&mut transport, 0, m.saved.world_seed) {
                            Ok(listen) => {
                                router.register_listen(listen, Route::Host);
                                con_printf(&format!(
                                    "[migrate] became host on port {}\n",
                                    host.port()
                                ));

                                // claim the session under its old key
                                lobby.set_session_key(m.saved.session_key);
                                lobby.set_announce_info_keyed(
                                    m.saved.session_key,
                                    host.port(),
                                    MAX_PLAYERS as u8,
                                    m.saved.world_seed,
                                    &m.saved.name,
                                );
                                lobby.send_claim_now(&mut transport);

                                // carry the world forward from the last snapshot
                                host.restore_state(&m.saved.players, m.saved.server_tick);
                                // the session was running; rejoiners come in hot
                                host.start_game(&mut transport);

                                game.disconnect(&mut transport, "hosting now");
                                m.host_attempt_succeeded();
                                migration = None;
                                hb_accum = 0.0;
                                phase = Phase::Hosting;
                            }
                            Err(e) => {
                                con_dprintf(&format!("[migrate] host attempt failed: {}\n", e));
                                con_printf("[migrate] could not host, looking for the new one\n");
                                m.host_attempt_failed(now);
                            }
                        }
                    }
                    MigrationAction::PollList => {
                        lobby.request_list(&mut transport);
                    }
                    MigrationAction::Fail => {
                        con_printf(
                            "[migrate] migration failed: no player could become the new host\n",
                        );
                        game.disconnect(&mut transport, "migration failed");
                        // the old lobby connection may be stale; start fresh
                        lobby.disconnect(&mut transport, "migration failed");
                        if let Ok(conn) = lobby.connect(&mut transport, lobby_addr, Role::Browser) {
                            router.register_conn(conn, Route::Lobby);
                        }
                        migration = None;
                        joined_key = 0;
                        joined_name.clear();
                        last_snap = None;
                        printed_table.clear();
                        list_accum = LIST_INTERVAL_S;
                        phase = Phase::Browse;
                    }
                    MigrationAction::None => {}
                    MigrationAction::Join(_) => {}
                }

                // a fresh list may reveal the race winner
                if let Some(list) = lobby.pop_latest_list() {
                    if let Some(m) = migration.as_mut() {
                        if let MigrationAction::Join(entry) = m.on_list(&list) {
                            let addr =
                                NetAdr::from_host_order(entry.ipv4_host_order, entry.game_port);
                            con_printf(&format!("[migrate] found new host at {}\n", addr));
                            match game.connect(&mut transport, addr) {
                                Ok(conn) => {
                                    router.register_conn(conn, Route::Game);
                                    m.joined();
                                    migration = None;
                                    last_report = now;
                                    phase = Phase::InGame;
                                }
                                Err(e) => {
                                    con_dprintf(&format!("[migrate] rejoin failed: {}\n", e));
                                }
                            }
                        }
                    }
                }
            }

            Phase::Hosting => {
                host.pump(&mut transport);
                host.update_sim(&mut transport, dt, 0, 0);

                if lobby.is_connected() {
                    hb_accum += dt;
                    if hb_accum >= HEARTBEAT_INTERVAL_S {
                        hb_accum = 0.0;
                        lobby.send_heartbeat(&mut transport, host.cur_players() as u16);
                    }
                } else if lobby.conn().is_none() && now >= reconnect_at {
                    reconnect_at = now + LOBBY_RECONNECT_MS;
                    if let Ok(conn) = lobby.connect(&mut transport, lobby_addr, Role::Announcer) {
                        router.register_conn(conn, Route::Lobby);
                    }
                }

                if now.saturating_sub(last_report) >= REPORT_INTERVAL_MS {
                    last_report = now;
                    con_printf(&format!(
                        "[client] hosting: tick {}  players {}/{}\n",
                        host.server_tick(),
                        host.cur_players(),
                        MAX_PLAYERS
                    ));
                }
            }
        }

        transport.flush();
        thread::sleep(Duration::from_millis(10));
    }
}

fn format_table(list: &[SessionEntry]) -> String {
    let mut out = format!("--- sessions ({}) ---\n", list.len());
    if list.is_empty() {
        out.push_str("  (none yet; start a host)\n");
    }
    for (i, e) in list.iter().enumerate() {
        let state = match e.state {
            SessionState::Open => "open",
            SessionState::Full => "full",
            SessionState::Migrating => "migrating",
        };
        let addr = NetAdr::from_host_order(e.ipv4_host_order, e.game_port);
        out.push_str(&format!(
            "  [{}] {:<20} {}/{}  {:<9} {}\n",
            i, e.name, e.cur_players, e.max_players, state, addr
        ));
    }
    out
}

/// The explicit --pick index if it is joinable, otherwise the first open
/// session with a free seat.
fn pick_join_index(list: &[SessionEntry], pick: Option<usize>) -> Option<usize> {
    let joinable =
        |e: &SessionEntry| e.state == SessionState::Open && e.cur_players < e.max_players;
    match pick {
        Some(idx) => list.get(idx).filter(|e| joinable(e)).map(|_| idx),
        None => list.iter().position(joinable),
    }
}

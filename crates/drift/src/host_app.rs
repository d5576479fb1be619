// host_app.rs -- the game host process
//
// Runs the authoritative simulation, announces to the directory when
// --lobby was given, and takes operator commands from stdin. The start
// button of the windowed build is the "start" command here.

use std::thread;
use std::time::Duration;

use drift_client::lobby_client::{LobbyClient, Role};
use drift_common::common::{con_printf, sys_milliseconds};
use drift_common::game_proto::MAX_PLAYERS;
use drift_common::netadr::NetAdr;
use drift_net::transport::{Router, Transport};
use drift_server::host::GameHost;

use crate::console_in;
use crate::Args;

/// Heartbeat cadence to the directory.
const HEARTBEAT_INTERVAL_S: f32 = 1.0;
/// Backoff between lobby reconnect attempts after a drop.
const LOBBY_RECONNECT_MS: u64 = 3000;

#[derive(Clone, Copy)]
enum Route {
    Host,
    Lobby,
}

pub fn run(args: &Args) -> i32 {
    let mut transport = Transport::new();
    let mut router: Router<Route> = Router::new();

    let seed = args.seed.unwrap_or_else(rand::random::<u32>);

    let mut host = GameHost::new();
    let listen = match host.start(&mut transport, args.game_port, seed) {
        Ok(listen) => listen,
        Err(e) => {
            con_printf(&format!("[host] start failed: {}\n", e));
            return 4;
        }
    };
    router.register_listen(listen, Route::Host);

    // optional: announce to the directory
    let mut lobby = LobbyClient::new();
    let lobby_addr = match &args.lobby_addr {
        Some(s) => match NetAdr::parse(s) {
            Some(addr) => Some(addr),
            None => {
                con_printf(&format!("[host] bad lobby address \"{}\"\n", s));
                return 1;
            }
        },
        None => None,
    };
    if let Some(addr) = lobby_addr {
        match lobby.connect(&mut transport, addr, Role::Announcer) {
            Ok(conn) => router.register_conn(conn, Route::Lobby),
            Err(e) => {
                con_printf(&format!("[host] lobby connect failed: {}\n", e));
                return 7;
            }
        }
        lobby.set_announce_info(host.port(), MAX_PLAYERS as u8, seed, &args.name);
    }

    let console = console_in::spawn();
    con_printf("[host] commands: start | status | quit\n");

    let mut last = sys_milliseconds();
    let mut hb_accum = 0.0f32;
    let mut reconnect_at = 0u64;

    loop {
        let now = sys_milliseconds();
        let dt = now.saturating_sub(last) as f32 / 1000.0;
        last = now;

        transport.update();
        while let Some(event) = transport.next_event() {
            match router.route(&event) {
                Some(Route::Host) => host.on_conn_status(&mut transport, &event),
                Some(Route::Lobby) => lobby.on_conn_status(&mut transport, &event),
                None => {}
            }
        }

        host.pump(&mut transport);
        lobby.pump(&mut transport);

        host.update_sim(&mut transport, dt, 0, 0);

        if let Some(addr) = lobby_addr {
            if lobby.is_connected() {
                hb_accum += dt;
                if hb_accum >= HEARTBEAT_INTERVAL_S {
                    hb_accum = 0.0;
                    lobby.send_heartbeat(&mut transport, host.cur_players() as u16);
                }
            } else if lobby.conn().is_none() && now >= reconnect_at {
                // the directory dropped us; silence means restart the
                // announcement ourselves
                reconnect_at = now + LOBBY_RECONNECT_MS;
                if let Ok(conn) = lobby.connect(&mut transport, addr, Role::Announcer) {
                    router.register_conn(conn, Route::Lobby);
                }
            }
        }

        while let Some(cmd) = console.try_recv() {
            match cmd.as_str() {
                "start" => host.start_game(&mut transport),
                "status" => print_status(&host),
                "quit" => {
                    host.stop(&mut transport);
                    lobby.disconnect(&mut transport, "bye");
                    return 0;
                }
                other => con_printf(&format!("unknown command \"{}\"\n", other)),
            }
        }

        transport.flush();
        thread::sleep(Duration::from_millis(10));
    }
}

fn print_status(host: &GameHost) {
    con_printf(&format!(
        "tick {}  players {}/{}  started {}\n",
        host.server_tick(),
        host.cur_players(),
        MAX_PLAYERS,
        if host.game_started() { "yes" } else { "no" }
    ));
    for p in host.states() {
        con_printf(&format!("  seat {}: ({:.0}, {:.0})\n", p.id, p.x, p.y));
    }
}

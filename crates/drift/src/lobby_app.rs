// lobby_app.rs -- the session directory process
//
// Pump callbacks, pump the lobby, flush, sleep. Runs until killed; per the
// directory's contract it never retries anything, it only expires entries.

use std::thread;
use std::time::Duration;

use drift_common::common::{con_printf, sys_milliseconds};
use drift_net::transport::{Router, Transport};
use drift_server::lobby::LobbyServer;

use crate::Args;

#[derive(Clone, Copy)]
enum Route {
    Lobby,
}

pub fn run(args: &Args) -> i32 {
    let mut transport = Transport::new();
    let mut lobby = LobbyServer::new();

    let listen = match lobby.start(&mut transport, args.lobby_port) {
        Ok(listen) => listen,
        Err(e) => {
            con_printf(&format!("[lobby] start failed: {}\n", e));
            return 2;
        }
    };

    let mut router: Router<Route> = Router::new();
    router.register_listen(listen, Route::Lobby);

    loop {
        let now = sys_milliseconds();

        transport.update();
        while let Some(event) = transport.next_event() {
            match router.route(&event) {
                Some(Route::Lobby) => lobby.on_conn_status(&mut transport, &event, now),
                None => {}
            }
        }

        lobby.pump(&mut transport, now);
        transport.flush();

        thread::sleep(Duration::from_millis(10));
    }
}

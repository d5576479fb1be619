// main.rs -- entry point and command line surface
//
// One binary, three modes:
//
//   drift --lobby-server 27010
//   drift --host 27020 --lobby 127.0.0.1:27010 --name "Run #1"
//   drift --client --lobby 127.0.0.1:27010
//
// Exit codes: 0 normal, 1 bad arguments / runtime init, 2 lobby server
// start failure, 4 game host start failure, 5 lobby announce failure,
// 6 client missing --lobby, 7 lobby connect failure.

mod client_app;
mod console_in;
mod host_app;
mod lobby_app;

use drift_common::common::{con_printf, set_developer};

pub struct Args {
    pub lobby_server: bool,
    pub lobby_port: u16,
    pub host: bool,
    pub game_port: u16,
    pub client: bool,
    pub browse_only: bool,
    pub pick: Option<usize>,
    pub lobby_addr: Option<String>,
    pub name: String,
    pub seed: Option<u32>,
    pub developer: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            lobby_server: false,
            lobby_port: 27010,
            host: false,
            game_port: 27020,
            client: false,
            browse_only: false,
            pick: None,
            lobby_addr: None,
            name: "drift session".to_string(),
            seed: None,
            developer: false,
        }
    }
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut i = 0;

    fn value<'a>(argv: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
        *i += 1;
        argv.get(*i)
            .map(|s| s.as_str())
            .ok_or_else(|| format!("{} requires a value", flag))
    }

    while i < argv.len() {
        match argv[i].as_str() {
            "--lobby-server" => {
                args.lobby_server = true;
                let v = value(argv, &mut i, "--lobby-server")?;
                args.lobby_port = v.parse().map_err(|_| format!("bad port \"{}\"", v))?;
            }
            "--host" => {
                args.host = true;
                let v = value(argv, &mut i, "--host")?;
                args.game_port = v.parse().map_err(|_| format!("bad port \"{}\"", v))?;
            }
            "--client" => args.client = true,
            "--browse" => args.browse_only = true,
            "--pick" => {
                let v = value(argv, &mut i, "--pick")?;
                args.pick = Some(v.parse().map_err(|_| format!("bad index \"{}\"", v))?);
            }
            "--lobby" => {
                let v = value(argv, &mut i, "--lobby")?;
                args.lobby_addr = Some(v.to_string());
            }
            "--name" => {
                let v = value(argv, &mut i, "--name")?;
                args.name = v.to_string();
            }
            "--seed" => {
                let v = value(argv, &mut i, "--seed")?;
                args.seed = Some(v.parse().map_err(|_| format!("bad seed \"{}\"", v))?);
            }
            "--developer" => args.developer = true,
            other => return Err(format!("unknown argument \"{}\"", other)),
        }
        i += 1;
    }
    Ok(args)
}

fn usage() {
    con_printf(
        "usage:\n\
         \x20 drift --lobby-server <port>\n\
         \x20 drift --host <port> [--lobby <ip:port>] [--name <label>] [--seed <u32>]\n\
         \x20 drift --client --lobby <ip:port> [--browse] [--pick <index>]\n\
         \x20 common: [--developer]\n",
    );
}

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("drift: {}", e);
            usage();
            std::process::exit(1);
        }
    };
    set_developer(args.developer);

    let code = if args.lobby_server {
        lobby_app::run(&args)
    } else if args.host {
        host_app::run(&args)
    } else if args.client {
        client_app::run(&args)
    } else {
        usage();
        0
    };
    std::process::exit(code);
}

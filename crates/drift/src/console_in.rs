// console_in.rs -- background stdin reader for operator commands
//
// Hosts take "start", "status", and "quit" from standard input. A reader
// thread feeds lines through a channel so the main loop never blocks.

use std::io::BufRead;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};

pub struct ConsoleInput {
    rx: Receiver<String>,
}

pub fn spawn() -> ConsoleInput {
    let (tx, rx) = unbounded();
    let _ = thread::Builder::new()
        .name("console-in".to_string())
        .spawn(move || read_loop(tx));
    ConsoleInput { rx }
}

fn read_loop(tx: Sender<String>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if tx.send(trimmed.to_string()).is_err() {
            break;
        }
    }
}

impl ConsoleInput {
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

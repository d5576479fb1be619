// migrate.rs -- host-migration coordinator
//
// Drives the recovery dance after a client observes host loss: wait out a
// random stagger so the survivors don't all claim at once, try to become
// the host on a dynamic port, and if that fails poll the directory for
// whoever won the race. The struct only makes timing decisions and returns
// actions; the client app executes them against the transport and reports
// back, which keeps every branch of the dance testable.
//
//   Stagger -> AttemptHost -+- success -> Done (claim + restore by caller)
//                           `- failure -> Reconnect: poll every 500 ms,
//                              join the new host if the key reappears,
//                              give up after 10 polls

use drift_common::game_proto::{PlayerState, MAX_PLAYERS};
use drift_common::lobby_proto::{SessionEntry, SessionState};
use rand::Rng;

/// Random claim stagger upper bound.
pub const STAGGER_MAX_MS: u64 = 1000;
/// Directory poll cadence while looking for the new host.
pub const POLL_INTERVAL_MS: u64 = 500;
/// Polls before migration is declared failed (~5 s).
pub const MAX_POLL_ATTEMPTS: u32 = 10;

/// Everything preserved from the session at the moment the host vanished.
/// The session key was recorded from the SessionEntry this client joined.
#[derive(Debug, Clone, Default)]
pub struct SavedSession {
    pub session_key: u64,
    pub name: String,
    pub world_seed: u32,
    pub players: [PlayerState; MAX_PLAYERS],
    pub server_tick: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting out the random delay before attempting to host.
    Stagger { until: u64 },
    /// AttemptHost was handed to the caller; waiting for the verdict.
    AwaitHostResult,
    /// Hosting failed; polling the directory for the race winner.
    Reconnect { attempts: u32, next_poll: u64 },
    Done,
    Failed,
}

/// What the client app should do right now.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationAction {
    None,
    /// Try to open a game host on a dynamic port, then report the result.
    AttemptHost,
    /// Ask the lobby for a fresh session list.
    PollList,
    /// The session reappeared under a new host; connect to it.
    Join(SessionEntry),
    /// Out of attempts; clear migration state and return to browsing.
    Fail,
}

pub struct Migration {
    phase: Phase,
    pub saved: SavedSession,
}

impl Migration {
    /// Start a migration with a uniformly random stagger in [0, 1000] ms.
    pub fn begin(saved: SavedSession, now: u64) -> Self {
        let delay = rand::thread_rng().gen_range(0..=STAGGER_MAX_MS);
        Self::begin_with_delay(saved, now, delay)
    }

    pub fn begin_with_delay(saved: SavedSession, now: u64, delay_ms: u64) -> Self {
        Self {
            phase: Phase::Stagger {
                until: now + delay_ms,
            },
            saved,
        }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.phase, Phase::Done | Phase::Failed)
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Advance the clock-driven parts of the dance.
    pub fn tick(&mut self, now: u64) -> MigrationAction {
        match self.phase {
            Phase::Stagger { until } if now >= until => {
                self.phase = Phase::AwaitHostResult;
                MigrationAction::AttemptHost
            }
            Phase::Reconnect { attempts, next_poll } if now >= next_poll => {
                if attempts >= MAX_POLL_ATTEMPTS {
                    self.phase = Phase::Failed;
                    return MigrationAction::Fail;
                }
                self.phase = Phase::Reconnect {
                    attempts: attempts + 1,
                    next_poll: now + POLL_INTERVAL_MS,
                };
                MigrationAction::PollList
            }
            _ => MigrationAction::None,
        }
    }

    /// The caller opened a listen socket and claimed the session.
    pub fn host_attempt_succeeded(&mut self) {
        self.phase = Phase::Done;
    }

    /// Couldn't bind or listen; fall back to hunting for the new host.
    /// The first poll goes out immediately.
    pub fn host_attempt_failed(&mut self, now: u64) {
        self.phase = Phase::Reconnect {
            attempts: 0,
            next_poll: now,
        };
    }

    /// Feed a fresh session list while reconnecting.
    pub fn on_list(&mut self, list: &[SessionEntry]) -> MigrationAction {
        if !matches!(self.phase, Phase::Reconnect { .. }) {
            return MigrationAction::None;
        }
        for entry in list {
            if entry.session_key != self.saved.session_key {
                continue;
            }
            match entry.state {
                // claimed by someone else; rejoin as a regular client
                SessionState::Open | SessionState::Full => {
                    return MigrationAction::Join(entry.clone());
                }
                // still waiting for a claimer, keep polling
                SessionState::Migrating => return MigrationAction::None,
            }
        }
        MigrationAction::None
    }

    /// The caller reconnected to the new host.
    pub fn joined(&mut self) {
        self.phase = Phase::Done;
    }
}

// session.rs -- the directory's session table and state machine
//
// Pure bookkeeping, no transport. The lobby shell (lobby.rs) feeds decoded
// messages and connection events in here; everything that makes the
// directory trustworthy lives in this file.
//
// State machine:
//   Announce(new key)            -> Open
//   Heartbeat(cur == max)        -> Full, (cur < max) -> Open
//   owner lost / active TTL      -> Migrating (owner cleared)
//   Claim while Migrating        -> Open under the claimer, first one wins
//   grace TTL while Migrating    -> deleted

use std::collections::HashMap;

use drift_common::lobby_proto::{
    AnnounceMsg, HeartbeatMsg, SessionEntry, SessionState, MAX_LIST_ENTRIES,
};
use drift_net::transport::ConnId;

/// No heartbeat for this long means the host is gone.
pub const ACTIVE_TTL_MS: u64 = 12_000;
/// How long a migrating session waits for a claim before deletion.
pub const GRACE_TTL_MS: u64 = 25_000;

pub const DEFAULT_MAX_PLAYERS: u8 = 3;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_key: u64,
    /// The lobby connection allowed to heartbeat this session. None while
    /// migrating.
    pub owner_conn: Option<ConnId>,
    pub ipv4_host_order: u32,
    pub game_port: u16,
    pub cur_players: u8,
    pub max_players: u8,
    pub world_seed: u32,
    pub name: String,
    pub state: SessionState,
    pub last_seen: u64,
    pub migrating_since: Option<u64>,
}

impl Session {
    fn entry(&self) -> SessionEntry {
        SessionEntry {
            session_key: self.session_key,
            ipv4_host_order: self.ipv4_host_order,
            game_port: self.game_port,
            cur_players: self.cur_players,
            max_players: self.max_players,
            world_seed: self.world_seed,
            state: self.state,
            name: self.name.clone(),
        }
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<u64, Session>,
    /// owner lobby connection -> session key, kept in lockstep with
    /// Session::owner_conn
    conn_to_session: HashMap<ConnId, u64>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<&Session> {
        self.sessions.get(&key)
    }

    /// Create-or-update for Announce, takeover for Claim. The address comes
    /// from the connection's observed remote, never from the payload.
    /// Returns false when the message was dropped.
    pub fn announce(
        &mut self,
        from: ConnId,
        ipv4_host_order: u32,
        msg: &AnnounceMsg,
        now: u64,
    ) -> bool {
        if msg.session_key == 0 {
            return false;
        }
        if ipv4_host_order == 0 {
            // not representable in the directory
            return false;
        }

        let existing = self.sessions.get(&msg.session_key);

        // claims are only honored for a session waiting out its grace
        // period; the first valid claim flips it back to Open
        if msg.claim {
            match existing {
                None => return false,
                Some(s) if s.state != SessionState::Migrating => return false,
                Some(_) => {}
            }
        }

        let cur_players = existing.map(|s| s.cur_players).unwrap_or(1);

        // the previous owner (if any, and different) loses its mapping
        if let Some(old_owner) = existing.and_then(|s| s.owner_conn) {
            if old_owner != from {
                self.conn_to_session.remove(&old_owner);
            }
        }

        let max_players = if msg.max_players == 0 {
            DEFAULT_MAX_PLAYERS
        } else {
            msg.max_players
        };
        let cur_players = cur_players.clamp(1, max_players);
        let state = if cur_players >= max_players {
            SessionState::Full
        } else {
            SessionState::Open
        };

        self.sessions.insert(
            msg.session_key,
            Session {
                session_key: msg.session_key,
                owner_conn: Some(from),
                ipv4_host_order,
                game_port: msg.game_port,
                cur_players,
                max_players,
                world_seed: msg.world_seed,
                name: msg.name.clone(),
                state,
                last_seen: now,
                migrating_since: None,
            },
        );
        self.conn_to_session.insert(from, msg.session_key);
        true
    }

    /// Accepted only from the current owner of a non-migrating session.
    pub fn heartbeat(&mut self, from: ConnId, msg: &HeartbeatMsg, now: u64) -> bool {
        if msg.session_key == 0 {
            return false;
        }
        let Some(s) = self.sessions.get_mut(&msg.session_key) else {
            return false;
        };
        if s.owner_conn != Some(from) {
            return false;
        }
        if s.state == SessionState::Migrating {
            return false;
        }

        s.cur_players = (msg.cur_players.clamp(1, s.max_players as u16)) as u8;
        s.last_seen = now;
        s.state = if s.cur_players >= s.max_players {
            SessionState::Full
        } else {
            SessionState::Open
        };
        true
    }

    /// The owner's lobby connection went away; its session (if any) starts
    /// the migration grace period.
    pub fn conn_lost(&mut self, conn: ConnId, now: u64) {
        let Some(key) = self.conn_to_session.remove(&conn) else {
            return;
        };
        // only migrate if the session is still owned by this connection; a
        // re-announce from a new connection may have taken over already
        let owned = self
            .sessions
            .get(&key)
            .map(|s| s.owner_conn == Some(conn))
            .unwrap_or(false);
        if owned {
            self.mark_migrating(key, now);
        }
    }

    fn mark_migrating(&mut self, key: u64, now: u64) {
        if let Some(s) = self.sessions.get_mut(&key) {
            if let Some(owner) = s.owner_conn.take() {
                self.conn_to_session.remove(&owner);
            }
            s.state = SessionState::Migrating;
            s.migrating_since = Some(now);
        }
    }

    /// TTL and grace cleanup. Runs before answering every list request and
    /// once per server tick.
    pub fn sweep(&mut self, now: u64) {
        // phase 1: decide, phase 2: apply
        let mut to_migrate = Vec::new();
        let mut to_delete = Vec::new();

        for (&key, s) in &self.sessions {
            if s.state != SessionState::Migrating {
                if now.saturating_sub(s.last_seen) > ACTIVE_TTL_MS {
                    to_migrate.push(key);
                }
            } else if let Some(since) = s.migrating_since {
                if now.saturating_sub(since) > GRACE_TTL_MS {
                    to_delete.push(key);
                }
            }
        }

        for key in to_migrate {
            self.mark_migrating(key, now);
        }
        for key in to_delete {
            self.sessions.remove(&key);
        }
    }

    /// Directory snapshot for a list response, capped at the wire limit.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.sessions
            .values()
            .take(MAX_LIST_ENTRIES)
            .map(Session::entry)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(v: u32) -> ConnId {
        ConnId::from_raw(v)
    }

    fn announce(key: u64) -> AnnounceMsg {
        AnnounceMsg {
            claim: false,
            session_key: key,
            game_port: 27020,
            max_players: 3,
            world_seed: 0xC0FFEE,
            name: "Run #1".to_string(),
        }
    }

    fn claim(key: u64) -> AnnounceMsg {
        AnnounceMsg {
            claim: true,
            ..announce(key)
        }
    }

    fn heartbeat(key: u64, cur: u16) -> HeartbeatMsg {
        HeartbeatMsg {
            session_key: key,
            cur_players: cur,
        }
    }

    /// table invariants, checkable after every event
    fn check_invariants(t: &SessionTable) {
        for (key, s) in &t.sessions {
            assert_ne!(s.session_key, 0);
            assert_eq!(*key, s.session_key);
            assert!(s.cur_players >= 1 && s.cur_players <= s.max_players);
            if s.state != SessionState::Migrating {
                assert_eq!(s.state == SessionState::Full, s.cur_players == s.max_players);
                assert!(s.migrating_since.is_none());
            } else {
                assert!(s.owner_conn.is_none());
                assert!(s.migrating_since.is_some());
            }
            if let Some(owner) = s.owner_conn {
                assert_eq!(t.conn_to_session.get(&owner), Some(key));
            }
        }
        for (conn, key) in &t.conn_to_session {
            assert_eq!(t.sessions[key].owner_conn, Some(*conn));
        }
    }

    #[test]
    fn announce_creates_open_session() {
        let mut t = SessionTable::new();
        assert!(t.announce(conn(1), 0x7F00_0001, &announce(0xAAAA), 0));
        check_invariants(&t);

        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.state, SessionState::Open);
        assert_eq!(s.cur_players, 1);
        assert_eq!(s.owner_conn, Some(conn(1)));
        assert_eq!(s.ipv4_host_order, 0x7F00_0001);
    }

    #[test]
    fn zero_key_and_zero_ip_dropped() {
        let mut t = SessionTable::new();
        assert!(!t.announce(conn(1), 0x7F00_0001, &announce(0), 0));
        assert!(!t.announce(conn(1), 0, &announce(0xAAAA), 0));
        assert!(t.is_empty());
    }

    #[test]
    fn reannounce_updates_but_keeps_player_count() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);
        t.heartbeat(conn(1), &heartbeat(0xAAAA, 2), 100);

        let mut msg = announce(0xAAAA);
        msg.game_port = 28000;
        msg.world_seed = 42;
        assert!(t.announce(conn(1), 2, &msg, 200));
        check_invariants(&t);

        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.cur_players, 2, "player count survives re-announce");
        assert_eq!(s.game_port, 28000);
        assert_eq!(s.world_seed, 42);
        assert_eq!(s.last_seen, 200);
    }

    #[test]
    fn heartbeat_drives_open_full_transitions() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        t.heartbeat(conn(1), &heartbeat(0xAAAA, 3), 10);
        assert_eq!(t.get(0xAAAA).unwrap().state, SessionState::Full);
        check_invariants(&t);

        t.heartbeat(conn(1), &heartbeat(0xAAAA, 2), 20);
        assert_eq!(t.get(0xAAAA).unwrap().state, SessionState::Open);
        check_invariants(&t);
    }

    #[test]
    fn heartbeat_clamps_player_count() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        t.heartbeat(conn(1), &heartbeat(0xAAAA, 0), 10);
        assert_eq!(t.get(0xAAAA).unwrap().cur_players, 1);

        t.heartbeat(conn(1), &heartbeat(0xAAAA, 999), 20);
        assert_eq!(t.get(0xAAAA).unwrap().cur_players, 3);
        check_invariants(&t);
    }

    #[test]
    fn heartbeat_from_non_owner_silently_dropped() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        assert!(!t.heartbeat(conn(2), &heartbeat(0xAAAA, 3), 10));
        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.cur_players, 1);
        assert_eq!(s.last_seen, 0);
    }

    #[test]
    fn owner_disconnect_starts_migration() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        t.conn_lost(conn(1), 500);
        check_invariants(&t);

        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.state, SessionState::Migrating);
        assert_eq!(s.owner_conn, None);
        assert_eq!(s.migrating_since, Some(500));

        // heartbeats from the dead owner's conn are now meaningless
        assert!(!t.heartbeat(conn(1), &heartbeat(0xAAAA, 2), 600));
    }

    #[test]
    fn disconnect_of_stale_owner_does_not_migrate() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);
        // same key re-announced from a fresh connection takes over
        t.announce(conn(2), 1, &announce(0xAAAA), 100);
        check_invariants(&t);

        t.conn_lost(conn(1), 200);
        assert_eq!(t.get(0xAAAA).unwrap().state, SessionState::Open);
        assert_eq!(t.get(0xAAAA).unwrap().owner_conn, Some(conn(2)));
    }

    #[test]
    fn active_ttl_boundary() {
        // last heartbeat at t=0 with a 12s active TTL; still Open at
        // 12.000s, Migrating at 12.001s
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        t.sweep(12_000);
        assert_eq!(t.get(0xAAAA).unwrap().state, SessionState::Open);

        t.sweep(12_001);
        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.state, SessionState::Migrating);
        assert_eq!(s.migrating_since, Some(12_001));
        check_invariants(&t);
    }

    #[test]
    fn claim_race_first_wins() {
        // session 0xBEEF migrating at t=0; A claims at 200ms,
        // B claims at 400ms
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xBEEF), 0);
        t.conn_lost(conn(1), 0);

        assert!(t.announce(conn(10), 0x0A00_0001, &claim(0xBEEF), 200));
        let s = t.get(0xBEEF).unwrap();
        assert_eq!(s.state, SessionState::Open);
        assert_eq!(s.owner_conn, Some(conn(10)));

        assert!(!t.announce(conn(11), 0x0A00_0002, &claim(0xBEEF), 400));
        let s = t.get(0xBEEF).unwrap();
        assert_eq!(s.owner_conn, Some(conn(10)), "loser changes nothing");
        assert_eq!(s.ipv4_host_order, 0x0A00_0001);
        check_invariants(&t);
    }

    #[test]
    fn claim_rejected_unless_migrating() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);

        // open session cannot be hijacked
        assert!(!t.announce(conn(2), 2, &claim(0xAAAA), 10));
        assert_eq!(t.get(0xAAAA).unwrap().owner_conn, Some(conn(1)));

        // unknown key cannot be claimed
        assert!(!t.announce(conn(2), 2, &claim(0xBEEF), 10));
        assert!(t.get(0xBEEF).is_none());
    }

    #[test]
    fn announce_while_migrating_takes_over() {
        // first-come semantics identical to Claim while Migrating
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xAAAA), 0);
        t.conn_lost(conn(1), 0);

        assert!(t.announce(conn(2), 2, &announce(0xAAAA), 100));
        let s = t.get(0xAAAA).unwrap();
        assert_eq!(s.state, SessionState::Open);
        assert_eq!(s.owner_conn, Some(conn(2)));
        assert_eq!(s.migrating_since, None);
        check_invariants(&t);
    }

    #[test]
    fn grace_expiry_deletes_session() {
        // migrating at t=0 with no claim; deleted once the 25s grace lapses
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xBEEF), 0);
        t.conn_lost(conn(1), 0);

        t.sweep(25_000);
        assert!(t.get(0xBEEF).is_some());

        t.sweep(25_001);
        assert!(t.get(0xBEEF).is_none());
        assert!(t.entries().is_empty());
    }

    #[test]
    fn claim_after_grace_expiry_fails() {
        let mut t = SessionTable::new();
        t.announce(conn(1), 1, &announce(0xBEEF), 0);
        t.conn_lost(conn(1), 0);
        t.sweep(25_001);

        assert!(!t.announce(conn(2), 2, &claim(0xBEEF), 25_100));
        assert!(t.is_empty());
    }

    #[test]
    fn list_capped_at_limit() {
        let mut t = SessionTable::new();
        for i in 0..(MAX_LIST_ENTRIES as u64 + 50) {
            t.announce(conn(i as u32 + 1), 1, &announce(i + 1), 0);
        }
        assert_eq!(t.len(), MAX_LIST_ENTRIES + 50);
        assert_eq!(t.entries().len(), MAX_LIST_ENTRIES);
    }

    #[test]
    fn max_players_zero_defaults() {
        let mut t = SessionTable::new();
        let mut msg = announce(0xAAAA);
        msg.max_players = 0;
        t.announce(conn(1), 1, &msg, 0);
        assert_eq!(t.get(0xAAAA).unwrap().max_players, DEFAULT_MAX_PLAYERS);
    }
}

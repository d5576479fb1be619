// lobby_proto.rs -- directory wire messages
//
// All integers little-endian, structures packed, sizes fixed. Undersized or
// version-mismatched messages decode to None and are dropped without a
// response.

use crate::buf::{
    msg_read_name32, msg_read_u16, msg_read_u32, msg_read_u64, msg_read_u8, msg_write_name32,
    msg_write_u16, msg_write_u32, msg_write_u64, msg_write_u8, MsgBuf,
};

pub const LOBBY_PROTOCOL: u32 = 1;

/// Hard cap on entries in a single list response.
pub const MAX_LIST_ENTRIES: usize = 512;

// message type ids
pub const LOBBY_HELLO: u8 = 1;
pub const LOBBY_ANNOUNCE: u8 = 2;
pub const LOBBY_HEARTBEAT: u8 = 3;
pub const LOBBY_LIST_REQ: u8 = 4;
pub const LOBBY_LIST_RESP: u8 = 5;
pub const LOBBY_CLAIM: u8 = 6;

// wire sizes
pub const HELLO_SIZE: usize = 6;
pub const ANNOUNCE_SIZE: usize = 53;
pub const HEARTBEAT_SIZE: usize = 13;
pub const LIST_REQ_SIZE: usize = 5;
pub const LIST_RESP_HDR_SIZE: usize = 5;
pub const SESSION_ENTRY_SIZE: usize = 56;

pub const ROLE_BROWSER: u8 = 0;
pub const ROLE_ANNOUNCER: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open = 1,
    Full = 2,
    Migrating = 3,
}

impl SessionState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(SessionState::Open),
            2 => Some(SessionState::Full),
            3 => Some(SessionState::Migrating),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Informational greeting; the server ignores it.
#[derive(Debug, Clone, Copy)]
pub struct HelloMsg {
    pub role: u8,
}

impl HelloMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(HELLO_SIZE);
        msg_write_u8(&mut sb, LOBBY_HELLO);
        msg_write_u32(&mut sb, LOBBY_PROTOCOL);
        msg_write_u8(&mut sb, self.role);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HELLO_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != LOBBY_HELLO {
            return None;
        }
        if msg_read_u32(&mut sb)? != LOBBY_PROTOCOL {
            return None;
        }
        Some(Self {
            role: msg_read_u8(&mut sb)?,
        })
    }
}

/// Announce creates or updates a session; Claim carries the same payload
/// and takes over a migrating one.
#[derive(Debug, Clone)]
pub struct AnnounceMsg {
    pub claim: bool,
    pub session_key: u64,
    pub game_port: u16,
    pub max_players: u8,
    pub world_seed: u32,
    pub name: String,
}

impl AnnounceMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(ANNOUNCE_SIZE);
        msg_write_u8(&mut sb, if self.claim { LOBBY_CLAIM } else { LOBBY_ANNOUNCE });
        msg_write_u32(&mut sb, LOBBY_PROTOCOL);
        msg_write_u64(&mut sb, self.session_key);
        msg_write_u16(&mut sb, self.game_port);
        msg_write_u8(&mut sb, self.max_players);
        msg_write_u8(&mut sb, 0); // reserved0
        msg_write_u32(&mut sb, self.world_seed);
        msg_write_name32(&mut sb, &self.name);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < ANNOUNCE_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        let ty = msg_read_u8(&mut sb)?;
        if ty != LOBBY_ANNOUNCE && ty != LOBBY_CLAIM {
            return None;
        }
        if msg_read_u32(&mut sb)? != LOBBY_PROTOCOL {
            return None;
        }
        let session_key = msg_read_u64(&mut sb)?;
        let game_port = msg_read_u16(&mut sb)?;
        let max_players = msg_read_u8(&mut sb)?;
        let _reserved = msg_read_u8(&mut sb)?;
        let world_seed = msg_read_u32(&mut sb)?;
        let name = msg_read_name32(&mut sb)?;
        Some(Self {
            claim: ty == LOBBY_CLAIM,
            session_key,
            game_port,
            max_players,
            world_seed,
            name,
        })
    }
}

/// Liveness plus the current player count. No protocol field on the wire.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMsg {
    pub session_key: u64,
    pub cur_players: u16,
}

impl HeartbeatMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(HEARTBEAT_SIZE);
        msg_write_u8(&mut sb, LOBBY_HEARTBEAT);
        msg_write_u64(&mut sb, self.session_key);
        msg_write_u16(&mut sb, self.cur_players);
        msg_write_u16(&mut sb, 0); // reserved0
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEARTBEAT_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != LOBBY_HEARTBEAT {
            return None;
        }
        let session_key = msg_read_u64(&mut sb)?;
        let cur_players = msg_read_u16(&mut sb)?;
        Some(Self {
            session_key,
            cur_players,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListReqMsg;

impl ListReqMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(LIST_REQ_SIZE);
        msg_write_u8(&mut sb, LOBBY_LIST_REQ);
        msg_write_u32(&mut sb, LOBBY_PROTOCOL);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < LIST_REQ_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != LOBBY_LIST_REQ {
            return None;
        }
        if msg_read_u32(&mut sb)? != LOBBY_PROTOCOL {
            return None;
        }
        Some(Self)
    }
}

/// One row of the directory as served to browsers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub session_key: u64,
    pub ipv4_host_order: u32,
    pub game_port: u16,
    pub cur_players: u8,
    pub max_players: u8,
    pub world_seed: u32,
    pub state: SessionState,
    pub name: String,
}

impl SessionEntry {
    fn write(&self, sb: &mut MsgBuf) {
        msg_write_u64(sb, self.session_key);
        msg_write_u32(sb, self.ipv4_host_order);
        msg_write_u16(sb, self.game_port);
        msg_write_u8(sb, self.cur_players);
        msg_write_u8(sb, self.max_players);
        msg_write_u32(sb, self.world_seed);
        msg_write_u8(sb, self.state.as_u8());
        msg_write_u8(sb, 0); // reserved1
        msg_write_u8(sb, 0);
        msg_write_u8(sb, 0);
        msg_write_name32(sb, &self.name);
    }

    fn read(sb: &mut MsgBuf) -> Option<Self> {
        let session_key = msg_read_u64(sb)?;
        let ipv4_host_order = msg_read_u32(sb)?;
        let game_port = msg_read_u16(sb)?;
        let cur_players = msg_read_u8(sb)?;
        let max_players = msg_read_u8(sb)?;
        let world_seed = msg_read_u32(sb)?;
        let state = SessionState::from_u8(msg_read_u8(sb)?)?;
        let _r1 = msg_read_u8(sb)?;
        let _r2 = msg_read_u8(sb)?;
        let _r3 = msg_read_u8(sb)?;
        let name = msg_read_name32(sb)?;
        Some(Self {
            session_key,
            ipv4_host_order,
            game_port,
            cur_players,
            max_players,
            world_seed,
            state,
            name,
        })
    }
}

/// Header plus `count` packed entries. A zero-entry response is valid.
#[derive(Debug, Clone, Default)]
pub struct ListRespMsg {
    pub entries: Vec<SessionEntry>,
}

impl ListRespMsg {
    pub fn encode(&self) -> Vec<u8> {
        let count = self.entries.len().min(MAX_LIST_ENTRIES);
        let mut sb = MsgBuf::new(LIST_RESP_HDR_SIZE + count * SESSION_ENTRY_SIZE);
        msg_write_u8(&mut sb, LOBBY_LIST_RESP);
        msg_write_u16(&mut sb, count as u16);
        msg_write_u16(&mut sb, 0); // reserved0
        for entry in self.entries.iter().take(count) {
            entry.write(&mut sb);
        }
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < LIST_RESP_HDR_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != LOBBY_LIST_RESP {
            return None;
        }
        let count = msg_read_u16(&mut sb)? as usize;
        let _reserved = msg_read_u16(&mut sb)?;
        if count > MAX_LIST_ENTRIES {
            return None;
        }
        if data.len() < LIST_RESP_HDR_SIZE + count * SESSION_ENTRY_SIZE {
            return None;
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(SessionEntry::read(&mut sb)?);
        }
        Some(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> SessionEntry {
        SessionEntry {
            session_key: 0xAAAA,
            ipv4_host_order: 0x7F00_0001,
            game_port: 27020,
            cur_players: 1,
            max_players: 3,
            world_seed: 0xC0FFEE,
            state: SessionState::Open,
            name: "Run #1".to_string(),
        }
    }

    #[test]
    fn hello_roundtrip() {
        let bytes = HelloMsg { role: ROLE_ANNOUNCER }.encode();
        assert_eq!(bytes.len(), HELLO_SIZE);
        assert_eq!(bytes[0], LOBBY_HELLO);
        assert_eq!(HelloMsg::decode(&bytes).unwrap().role, ROLE_ANNOUNCER);
    }

    #[test]
    fn announce_layout() {
        let msg = AnnounceMsg {
            claim: false,
            session_key: 0xAAAA,
            game_port: 27020,
            max_players: 3,
            world_seed: 0xC0FFEE,
            name: "Run #1".to_string(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), ANNOUNCE_SIZE);
        assert_eq!(bytes[0], LOBBY_ANNOUNCE);
        // protocol, little-endian
        assert_eq!(&bytes[1..5], &[1, 0, 0, 0]);
        // session key
        assert_eq!(&bytes[5..13], &[0xAA, 0xAA, 0, 0, 0, 0, 0, 0]);
        // game port 27020 = 0x699C
        assert_eq!(&bytes[13..15], &[0x9C, 0x69]);
        assert_eq!(bytes[15], 3);
        // world seed 0x00C0FFEE
        assert_eq!(&bytes[17..21], &[0xEE, 0xFF, 0xC0, 0x00]);
        assert_eq!(&bytes[21..27], b"Run #1");

        let back = AnnounceMsg::decode(&bytes).unwrap();
        assert!(!back.claim);
        assert_eq!(back.session_key, 0xAAAA);
        assert_eq!(back.name, "Run #1");
    }

    #[test]
    fn claim_shares_announce_payload() {
        let mut msg = AnnounceMsg {
            claim: true,
            session_key: 0xBEEF,
            game_port: 1,
            max_players: 3,
            world_seed: 0,
            name: String::new(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], LOBBY_CLAIM);
        assert!(AnnounceMsg::decode(&bytes).unwrap().claim);

        msg.claim = false;
        assert_eq!(msg.encode().len(), bytes.len());
    }

    #[test]
    fn heartbeat_roundtrip() {
        let bytes = HeartbeatMsg {
            session_key: 0xBEEF,
            cur_players: 2,
        }
        .encode();
        assert_eq!(bytes.len(), HEARTBEAT_SIZE);
        let back = HeartbeatMsg::decode(&bytes).unwrap();
        assert_eq!(back.session_key, 0xBEEF);
        assert_eq!(back.cur_players, 2);
    }

    #[test]
    fn list_resp_roundtrip_and_empty() {
        let resp = ListRespMsg {
            entries: vec![sample_entry()],
        };
        let bytes = resp.encode();
        assert_eq!(bytes.len(), LIST_RESP_HDR_SIZE + SESSION_ENTRY_SIZE);
        let back = ListRespMsg::decode(&bytes).unwrap();
        assert_eq!(back.entries, vec![sample_entry()]);

        // header only
        let empty = ListRespMsg::default().encode();
        assert_eq!(empty.len(), LIST_RESP_HDR_SIZE);
        assert!(ListRespMsg::decode(&empty).unwrap().entries.is_empty());
    }

    #[test]
    fn list_resp_caps_entries() {
        let resp = ListRespMsg {
            entries: vec![sample_entry(); MAX_LIST_ENTRIES + 40],
        };
        let bytes = resp.encode();
        let back = ListRespMsg::decode(&bytes).unwrap();
        assert_eq!(back.entries.len(), MAX_LIST_ENTRIES);
    }

    #[test]
    fn short_messages_rejected() {
        let bytes = AnnounceMsg {
            claim: false,
            session_key: 1,
            game_port: 1,
            max_players: 3,
            world_seed: 0,
            name: String::new(),
        }
        .encode();
        assert!(AnnounceMsg::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(HeartbeatMsg::decode(&[LOBBY_HEARTBEAT]).is_none());
        assert!(ListRespMsg::decode(&[LOBBY_LIST_RESP, 5, 0, 0, 0]).is_none());
    }

    #[test]
    fn protocol_mismatch_rejected() {
        let mut bytes = ListReqMsg.encode();
        bytes[1] = 9;
        assert!(ListReqMsg::decode(&bytes).is_none());
    }
}

// game_proto.rs -- host/client wire messages
//
// Same conventions as the lobby protocol: little-endian, packed, fixed
// sizes. Input is the one message whose size must match exactly; the host
// drops anything else.

use crate::buf::{
    msg_read_f32, msg_read_i8, msg_read_u32, msg_read_u8, msg_write_f32, msg_write_i8,
    msg_write_u32, msg_write_u8, MsgBuf,
};

pub const GAME_PROTOCOL: u32 = 1;

/// Seats per session, host included.
pub const MAX_PLAYERS: usize = 3;

/// Sentinel for "no seat assigned".
pub const UNASSIGNED_ID: u8 = 255;

// message type ids
pub const GAME_HELLO: u8 = 1;
pub const GAME_WELCOME: u8 = 2;
pub const GAME_INPUT: u8 = 3;
pub const GAME_SNAP: u8 = 4;
pub const GAME_START: u8 = 5;

// wire sizes
pub const GAME_HELLO_SIZE: usize = 5;
pub const WELCOME_SIZE: usize = 6;
pub const INPUT_SIZE: usize = 8;
pub const PLAYER_STATE_SIZE: usize = 9;
pub const SNAP_SIZE: usize = 6 + MAX_PLAYERS * PLAYER_STATE_SIZE;
pub const START_SIZE: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct GameHelloMsg;

impl GameHelloMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(GAME_HELLO_SIZE);
        msg_write_u8(&mut sb, GAME_HELLO);
        msg_write_u32(&mut sb, GAME_PROTOCOL);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < GAME_HELLO_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != GAME_HELLO {
            return None;
        }
        if msg_read_u32(&mut sb)? != GAME_PROTOCOL {
            return None;
        }
        Some(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WelcomeMsg {
    pub your_id: u8,
    pub world_seed: u32,
}

impl WelcomeMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(WELCOME_SIZE);
        msg_write_u8(&mut sb, GAME_WELCOME);
        msg_write_u8(&mut sb, self.your_id);
        msg_write_u32(&mut sb, self.world_seed);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < WELCOME_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != GAME_WELCOME {
            return None;
        }
        Some(Self {
            your_id: msg_read_u8(&mut sb)?,
            world_seed: msg_read_u32(&mut sb)?,
        })
    }
}

/// Client movement command. The host trusts its connection-to-seat map, not
/// the player_id carried here.
#[derive(Debug, Clone, Copy)]
pub struct InputMsg {
    pub client_tick: u32,
    pub player_id: u8,
    pub move_x: i8,
    pub move_y: i8,
}

impl InputMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(INPUT_SIZE);
        msg_write_u8(&mut sb, GAME_INPUT);
        msg_write_u32(&mut sb, self.client_tick);
        msg_write_u8(&mut sb, self.player_id);
        msg_write_i8(&mut sb, self.move_x);
        msg_write_i8(&mut sb, self.move_y);
        sb.bytes().to_vec()
    }

    /// Exact-size match required.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != INPUT_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != GAME_INPUT {
            return None;
        }
        Some(Self {
            client_tick: msg_read_u32(&mut sb)?,
            player_id: msg_read_u8(&mut sb)?,
            move_x: msg_read_i8(&mut sb)?,
            move_y: msg_read_i8(&mut sb)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub id: u8,
    pub x: f32,
    pub y: f32,
}

/// Authoritative state broadcast. Always carries MAX_PLAYERS packed states;
/// `count` says how many are meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapMsg {
    pub server_tick: u32,
    pub count: u8,
    pub players: [PlayerState; MAX_PLAYERS],
}

impl SnapMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(SNAP_SIZE);
        msg_write_u8(&mut sb, GAME_SNAP);
        msg_write_u32(&mut sb, self.server_tick);
        msg_write_u8(&mut sb, self.count);
        for p in &self.players {
            msg_write_u8(&mut sb, p.id);
            msg_write_f32(&mut sb, p.x);
            msg_write_f32(&mut sb, p.y);
        }
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < SNAP_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != GAME_SNAP {
            return None;
        }
        let server_tick = msg_read_u32(&mut sb)?;
        let count = msg_read_u8(&mut sb)?;
        let mut players = [PlayerState::default(); MAX_PLAYERS];
        for p in players.iter_mut() {
            p.id = msg_read_u8(&mut sb)?;
            p.x = msg_read_f32(&mut sb)?;
            p.y = msg_read_f32(&mut sb)?;
        }
        Some(Self {
            server_tick,
            count,
            players,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StartGameMsg {
    pub world_seed: u32,
}

impl StartGameMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut sb = MsgBuf::new(START_SIZE);
        msg_write_u8(&mut sb, GAME_START);
        msg_write_u32(&mut sb, self.world_seed);
        sb.bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < START_SIZE {
            return None;
        }
        let mut sb = MsgBuf::from_slice(data);
        if msg_read_u8(&mut sb)? != GAME_START {
            return None;
        }
        Some(Self {
            world_seed: msg_read_u32(&mut sb)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_layout() {
        let bytes = WelcomeMsg {
            your_id: 1,
            world_seed: 0xC0FFEE,
        }
        .encode();
        assert_eq!(bytes.len(), WELCOME_SIZE);
        assert_eq!(bytes[0], GAME_WELCOME);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..6], &[0xEE, 0xFF, 0xC0, 0x00]);
    }

    #[test]
    fn input_requires_exact_size() {
        let bytes = InputMsg {
            client_tick: 42,
            player_id: 1,
            move_x: 1,
            move_y: -1,
        }
        .encode();
        assert_eq!(bytes.len(), INPUT_SIZE);
        let back = InputMsg::decode(&bytes).unwrap();
        assert_eq!(back.client_tick, 42);
        assert_eq!(back.move_y, -1);

        assert!(InputMsg::decode(&bytes[..INPUT_SIZE - 1]).is_none());
        let mut long = bytes.clone();
        long.push(0);
        assert!(InputMsg::decode(&long).is_none());
    }

    #[test]
    fn snap_roundtrip() {
        let mut snap = SnapMsg {
            server_tick: 7,
            count: MAX_PLAYERS as u8,
            players: Default::default(),
        };
        for (i, p) in snap.players.iter_mut().enumerate() {
            p.id = i as u8;
            p.x = 200.0 + 90.0 * i as f32;
            p.y = 200.0;
        }

        let bytes = snap.encode();
        assert_eq!(bytes.len(), SNAP_SIZE);
        let back = SnapMsg::decode(&bytes).unwrap();
        assert_eq!(back.server_tick, 7);
        assert_eq!(back.count, 3);
        assert_eq!(back.players[1].x, 290.0);
        assert_eq!(back.players[2].x, 380.0);
    }

    #[test]
    fn start_game_roundtrip() {
        let bytes = StartGameMsg { world_seed: 0xC0FFEE }.encode();
        assert_eq!(bytes.len(), START_SIZE);
        assert_eq!(StartGameMsg::decode(&bytes).unwrap().world_seed, 0xC0FFEE);
    }

    #[test]
    fn wrong_type_byte_rejected() {
        let bytes = StartGameMsg { world_seed: 1 }.encode();
        assert!(WelcomeMsg::decode(&bytes).is_none());
        assert!(SnapMsg::decode(&bytes).is_none());
    }
}

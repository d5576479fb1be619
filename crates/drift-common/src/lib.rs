// drift-common -- pure logic shared by the lobby server, game host, and clients.
//
// Nothing in this crate touches a socket. The transport runtime (drift-net)
// and the component crates build on the codecs, the channel, and the packet
// queue defined here.

pub mod buf;
pub mod chan;
pub mod common;
pub mod game_proto;
pub mod lobby_proto;
pub mod net_queue;
pub mod netadr;

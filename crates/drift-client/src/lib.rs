// drift-client -- client-side components: directory access, the game
// client, and the host-migration coordinator.

pub mod game_client;
pub mod lobby_client;
pub mod migrate;

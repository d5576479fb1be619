// drift-server -- authoritative components: the session directory and the
// game host.

pub mod host;
pub mod lobby;
pub mod session;

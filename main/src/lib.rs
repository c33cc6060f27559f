mod directory;
mod multicast;
mod receiver;
mod session;

use std::net::SocketAddrV4;

pub use kaiwa_protocol::Envelope;
pub use kaiwa_protocol::PeerId;
pub use receiver::ChatObserver;
pub use session::ChatSession;
pub use session::StartError;

/// IPv4 multicast group shared by all chat peers of one deployment.
///
/// The address is fixed rather than configurable, so any two peers on the
/// same LAN automatically see each other.
fn get_group_address() -> SocketAddrV4 {
    "230.0.0.0:4446".parse().expect("Invalid group address")
}

pub mod peer;
pub mod session;
pub mod state;

pub use peer::{JoinedRoom, PeerNetwork, RoomEvent, RoomHandle};
pub use session::PeerRoomSession;
pub use state::{RemotePeerEntry, RemotePeers, RoomPhase};

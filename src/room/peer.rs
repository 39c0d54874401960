//! Contract of the peer room library.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::RoomError;
use crate::media::MediaStreamHandle;

/// Events emitted by a joined room, in delivery order.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A peer published (or renegotiated) its stream
    Stream {
        peer_id: String,
        stream: MediaStreamHandle,
    },
    PeerJoin {
        peer_id: String,
    },
    PeerLeave {
        peer_id: String,
    },
}

/// Live membership in a room.
pub trait RoomHandle: Send + Sync {
    /// Replace the stream sent to every peer.
    fn replace_stream(&self, stream: &MediaStreamHandle);

    /// Leave the room and release its peer connections.
    fn close(&self);
}

/// A successful join: the handle plus the room's event stream.
pub struct JoinedRoom {
    pub handle: Box<dyn RoomHandle>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

/// The local peer's connection to the room service.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// `true` once the peer's signaling connection is open.
    fn readiness(&self) -> watch::Receiver<bool>;

    async fn join_room(
        &self,
        room_id: &str,
        stream: MediaStreamHandle,
    ) -> Result<JoinedRoom, RoomError>;
}

use tracing::{debug, info};

use super::peer::{RoomEvent, RoomHandle};
use super::state::{RemotePeerEntry, RemotePeers, RoomPhase};
use crate::media::MediaStreamHandle;

/// Membership in one mesh room and the remote streams received in it.
///
/// A session never goes back from [`RoomPhase::Left`]; joining again needs a
/// new session. The session owns every remote stream it stores and stops
/// its tracks when the entry is discarded.
pub struct PeerRoomSession {
    room_id: String,
    epoch: u64,
    phase: RoomPhase,
    handle: Option<Box<dyn RoomHandle>>,
    local_stream: Option<MediaStreamHandle>,
    peers: RemotePeers,
}

impl PeerRoomSession {
    /// `epoch` tags every event routed to this session so that events from a
    /// previous membership can be told apart.
    pub fn new(room_id: impl Into<String>, epoch: u64) -> Self {
        Self {
            room_id: room_id.into(),
            epoch,
            phase: RoomPhase::NotJoined,
            handle: None,
            local_stream: None,
            peers: RemotePeers::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn peers(&self) -> &[RemotePeerEntry] {
        self.peers.entries()
    }

    /// Join preconditions: not joined yet, a local stream and an open peer.
    pub fn can_join(&self, stream_ready: bool, network_open: bool) -> bool {
        self.phase == RoomPhase::NotJoined && stream_ready && network_open
    }

    pub fn begin_join(&mut self) -> bool {
        if self.phase != RoomPhase::NotJoined {
            return false;
        }
        self.phase = RoomPhase::Joining;
        info!(room = %self.room_id, "Joining room");
        true
    }

    /// Record a successful join.
    ///
    /// Hands the room handle back if the session stopped waiting for it, so
    /// that the caller can close it.
    pub fn complete_join(
        &mut self,
        stream: MediaStreamHandle,
        handle: Box<dyn RoomHandle>,
    ) -> Result<(), Box<dyn RoomHandle>> {
        if self.phase != RoomPhase::Joining {
            return Err(handle);
        }
        self.phase = RoomPhase::Joined;
        self.handle = Some(handle);
        self.local_stream = Some(stream);
        info!(room = %self.room_id, "Joined room");
        Ok(())
    }

    pub fn fail_join(&mut self) {
        if self.phase == RoomPhase::Joining {
            self.phase = RoomPhase::NotJoined;
        }
    }

    /// Send `stream` instead of the current local stream.
    ///
    /// No-op unless joined or when `stream` is already being sent.
    pub fn replace_stream(&mut self, stream: &MediaStreamHandle) -> bool {
        let Some(handle) = &self.handle else {
            return false;
        };
        if self
            .local_stream
            .as_ref()
            .is_some_and(|current| current.same_stream(stream))
        {
            return false;
        }
        handle.replace_stream(stream);
        self.local_stream = Some(stream.clone());
        debug!(room = %self.room_id, stream = stream.id(), "Outgoing stream replaced");
        true
    }

    pub fn handle_event(&mut self, event: RoomEvent) {
        if self.phase != RoomPhase::Joined {
            debug!(room = %self.room_id, phase = %self.phase, ?event, "Dropping room event");
            if let RoomEvent::Stream { stream, .. } = event {
                stream.stop();
            }
            return;
        }

        match event {
            RoomEvent::Stream { peer_id, stream } => {
                info!(peer_id = %peer_id, stream = stream.id(), "Remote stream arrived");
                if let Some(superseded) = self.peers.upsert(&peer_id, stream) {
                    superseded.stop();
                }
            }
            RoomEvent::PeerJoin { peer_id } => {
                info!(peer_id = %peer_id, "Peer joined");
            }
            RoomEvent::PeerLeave { peer_id } => match self.peers.remove(&peer_id) {
                Some(entry) => {
                    let stopped = entry.stream.stop();
                    info!(peer_id = %peer_id, tracks = stopped, "Peer left, stream released");
                }
                None => debug!(peer_id = %peer_id, "Peer left without a stream"),
            },
        }
    }

    /// Leave the room, releasing every remote stream and the room handle.
    pub fn leave(&mut self) {
        if self.phase == RoomPhase::Left {
            return;
        }
        for entry in self.peers.drain() {
            entry.stream.stop();
        }
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        self.local_stream = None;
        self.phase = RoomPhase::Left;
        info!(room = %self.room_id, "Left room");
    }
}

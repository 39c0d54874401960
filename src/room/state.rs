use std::fmt;

use crate::media::MediaStreamHandle;

/// Room membership lifecycle. `Left` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    NotJoined,
    Joining,
    Joined,
    Left,
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomPhase::NotJoined => write!(f, "NotJoined"),
            RoomPhase::Joining => write!(f, "Joining"),
            RoomPhase::Joined => write!(f, "Joined"),
            RoomPhase::Left => write!(f, "Left"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemotePeerEntry {
    pub peer_id: String,
    pub stream: MediaStreamHandle,
}

/// Remote streams keyed by peer id, in arrival order.
#[derive(Debug, Default)]
pub struct RemotePeers {
    peers: Vec<RemotePeerEntry>,
}

impl RemotePeers {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Insert or replace the peer's stream.
    ///
    /// Returns the superseded stream, if the peer already had a different one.
    pub fn upsert(&mut self, peer_id: &str, stream: MediaStreamHandle) -> Option<MediaStreamHandle> {
        match self.peers.iter_mut().find(|entry| entry.peer_id == peer_id) {
            Some(entry) => {
                let previous = std::mem::replace(&mut entry.stream, stream);
                (!previous.same_stream(&entry.stream)).then_some(previous)
            }
            None => {
                self.peers.push(RemotePeerEntry {
                    peer_id: peer_id.to_string(),
                    stream,
                });
                None
            }
        }
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<RemotePeerEntry> {
        let index = self.peers.iter().position(|entry| entry.peer_id == peer_id)?;
        Some(self.peers.remove(index))
    }

    pub fn drain(&mut self) -> Vec<RemotePeerEntry> {
        std::mem::take(&mut self.peers)
    }

    pub fn entries(&self) -> &[RemotePeerEntry] {
        &self.peers
    }
}

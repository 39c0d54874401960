use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Ready state of a [`MessageChannel`](crate::channel::MessageChannel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "Closed"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Open => write!(f, "Open"),
            ChannelState::Closing => write!(f, "Closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// URL of the current or last connection
    pub url: Option<String>,
    pub outbound_pending: usize,
    pub inbound_pending: usize,
    /// Messages received since the channel was created
    pub received_total: u64,
    pub keepalive_active: bool,
    pub reconnect_attempts: u32,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Closed,
            url: None,
            outbound_pending: 0,
            inbound_pending: 0,
            received_total: 0,
            keepalive_active: false,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Clone)]
pub struct ChannelMonitor {
    status: Arc<watch::Sender<ChannelStatus>>,
    receiver: watch::Receiver<ChannelStatus>,
}

impl ChannelMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ChannelStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Apply `update` and notify subscribers if anything changed.
    pub fn update(&self, update: impl FnOnce(&mut ChannelStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            *status != before
        });
    }

    pub fn current(&self) -> ChannelStatus {
        self.receiver.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.receiver.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.receiver.clone()
    }
}

impl Default for ChannelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

//! Queued, keepalive-driven message channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::connection::{ChannelMonitor, ChannelState, ChannelStatus};
use crate::transport::{Connector, Payload, TransportCommand, TransportEvent, TransportLink};

#[derive(Debug)]
enum ChannelCommand {
    Connect(String),
    Disconnect,
    Send(Payload),
    ReceiveNext(oneshot::Sender<Option<Payload>>),
}

/// Handle to a message channel. Clones share the same channel.
#[derive(Clone)]
pub struct MessageChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    monitor: ChannelMonitor,
}

impl MessageChannel {
    /// Start the channel's driver task. The channel starts `Closed`.
    pub fn spawn(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let monitor = ChannelMonitor::new();
        let driver = ChannelDriver::new(connector, config, command_rx, monitor.clone());
        tokio::spawn(driver.run());
        Self { commands, monitor }
    }

    /// Connect to `url`. Ignored while a connection is open or opening; while
    /// the previous connection is closing, `url` is opened once it has closed.
    pub fn connect(&self, url: impl Into<String>) {
        self.command(ChannelCommand::Connect(url.into()));
    }

    /// Close the current connection. Later sends are queued until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.command(ChannelCommand::Disconnect);
    }

    /// Queue a message. Never blocks and never fails.
    pub fn send(&self, message: impl Into<Payload>) {
        self.command(ChannelCommand::Send(message.into()));
    }

    /// Pop the oldest received message, or `None` if nothing is pending.
    pub async fn receive_next(&self) -> Option<Payload> {
        let (reply, rx) = oneshot::channel();
        self.command(ChannelCommand::ReceiveNext(reply));
        rx.await.ok().flatten()
    }

    pub fn state(&self) -> ChannelState {
        self.monitor.state()
    }

    pub fn status(&self) -> ChannelStatus {
        self.monitor.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.monitor.subscribe()
    }

    fn command(&self, command: ChannelCommand) {
        if let Err(e) = self.commands.send(command) {
            warn!(command = ?e.0, "Message channel driver is gone");
        }
    }
}

struct ChannelDriver {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    monitor: ChannelMonitor,
    link: Option<TransportLink>,
    url: Option<String>,
    /// Connect requested while the previous link was still closing
    pending_connect: Option<String>,
    state: ChannelState,
    outbound: VecDeque<Payload>,
    inbound: VecDeque<Payload>,
    received_total: u64,
    /// Armed exactly while `state == Open`
    keepalive: Option<Interval>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl ChannelDriver {
    fn new(
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
        commands: mpsc::UnboundedReceiver<ChannelCommand>,
        monitor: ChannelMonitor,
    ) -> Self {
        Self {
            connector,
            config,
            commands,
            monitor,
            link: None,
            url: None,
            pending_connect: None,
            state: ChannelState::Closed,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            received_total: 0,
            keepalive: None,
            reconnect_at: None,
            reconnect_attempts: 0,
        }
    }

    async fn run(mut self) {
        loop {
            let can_drain = self.state == ChannelState::Open && !self.outbound.is_empty();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_event(&mut self.link) => self.handle_event(event),
                _ = next_tick(&mut self.keepalive) => self.send_keepalive(),
                _ = sleep_until_deadline(self.reconnect_at) => self.reconnect(),
                _ = std::future::ready(()), if can_drain => self.drain_one(),
            }

            self.publish();
        }

        if let Some(link) = self.link.take() {
            let _ = link.commands.send(TransportCommand::Close);
        }
        debug!("Message channel driver stopped");
    }

    fn handle_command(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Connect(url) => {
                if self.state == ChannelState::Closing {
                    debug!(%url, "Previous connection still closing, connect deferred");
                    self.pending_connect = Some(url);
                    return;
                }
                if self.link.is_some() {
                    debug!(%url, state = %self.state, "Connection already exists, ignoring connect");
                    return;
                }
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.open(url);
            }
            ChannelCommand::Disconnect => {
                self.pending_connect = None;
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                let Some(link) = &self.link else {
                    debug!("Disconnect without a connection");
                    return;
                };
                info!(url = ?self.url, "Disconnecting");
                if link.commands.send(TransportCommand::Close).is_err() {
                    self.handle_event(None);
                    return;
                }
                self.keepalive = None;
                self.state = ChannelState::Closing;
            }
            ChannelCommand::Send(payload) => {
                self.outbound.push_back(payload);
            }
            ChannelCommand::ReceiveNext(reply) => {
                if let Err(Some(payload)) = reply.send(self.inbound.pop_front()) {
                    self.inbound.push_front(payload);
                }
            }
        }
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => {
                if self.state == ChannelState::Closing {
                    debug!("Transport opened after disconnect was requested");
                    return;
                }
                let period = self.config.keepalive_interval;
                let mut keepalive = interval_at(Instant::now() + period, period);
                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(keepalive);
                self.reconnect_attempts = 0;
                self.state = ChannelState::Open;
                info!(url = ?self.url, queued = self.outbound.len(), "Message channel open");
            }
            Some(TransportEvent::Message(payload)) => {
                self.inbound.push_back(payload);
                self.received_total += 1;
            }
            Some(TransportEvent::Close) | None => {
                let requested = self.state == ChannelState::Closing;
                self.link = None;
                self.keepalive = None;
                self.state = ChannelState::Closed;
                info!(url = ?self.url, requested, "Message channel closed");

                if let Some(url) = self.pending_connect.take() {
                    self.open(url);
                } else if !requested {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.url.is_none() {
            return;
        }
        if self.reconnect_attempts >= self.config.reconnect_attempts {
            if self.config.reconnect_attempts > 0 {
                warn!(
                    attempts = self.reconnect_attempts,
                    "Max reconnection attempts reached"
                );
            }
            return;
        }
        self.reconnect_attempts += 1;
        let delay = self.reconnect_delay();
        debug!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter_ms = self.config.reconnect_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        self.config.reconnect_delay + Duration::from_millis(jitter)
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if self.link.is_some() {
            return;
        }
        if let Some(url) = self.url.clone() {
            info!(%url, attempt = self.reconnect_attempts, "Reconnecting");
            self.open(url);
        }
    }

    fn open(&mut self, url: String) {
        info!(%url, "Connecting");
        self.link = Some(self.connector.open(&url));
        self.url = Some(url);
        self.state = ChannelState::Connecting;
    }

    fn drain_one(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        let Some(payload) = self.outbound.pop_front() else {
            return;
        };
        if let Err(e) = link.commands.send(TransportCommand::Send(payload)) {
            if let TransportCommand::Send(payload) = e.0 {
                self.outbound.push_front(payload);
            }
            self.handle_event(None);
        }
    }

    fn send_keepalive(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        let payload = Payload::Text(self.config.keepalive_message.clone());
        if link.commands.send(TransportCommand::Send(payload)).is_err() {
            self.handle_event(None);
            return;
        }
        debug!("Keepalive sent");
    }

    fn publish(&self) {
        self.monitor.update(|status| {
            status.state = self.state;
            status.url = self.url.clone();
            status.outbound_pending = self.outbound.len();
            status.inbound_pending = self.inbound.len();
            status.received_total = self.received_total;
            status.keepalive_active = self.keepalive.is_some();
            status.reconnect_attempts = self.reconnect_attempts;
        });
    }
}

async fn next_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(keepalive) => {
            keepalive.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

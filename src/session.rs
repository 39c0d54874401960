//! Session controller actor and its handle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::SessionConfig;
use crate::connection::ChannelStatus;
use crate::error::{Error, Result, RoomError, SignalingError};
use crate::media::{
    Acquired, ActivationRequest, CapturePlatform, DeviceRegistry, DeviceSnapshot, InstallOutcome,
    MediaStreamHandle, SessionMode, StreamLifecycleManager,
};
use crate::room::{JoinedRoom, PeerNetwork, PeerRoomSession, RemotePeerEntry, RoomEvent, RoomPhase};
use crate::signaling::EndpointResolver;
use crate::transport::{Connector, Payload};

/// External services a session runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn CapturePlatform>,
    pub network: Arc<dyn PeerNetwork>,
    pub resolver: Arc<dyn EndpointResolver>,
    pub connector: Arc<dyn Connector>,
}

/// Observable state of a session, republished after every change.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Mode of the installed local stream
    pub mode: SessionMode,
    pub local_stream: Option<MediaStreamHandle>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub room_phase: RoomPhase,
    pub join_requested: bool,
    pub remote_peers: Vec<RemotePeerEntry>,
    /// Most recent recoverable failure
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            mode: SessionMode::Idle,
            local_stream: None,
            audio_enabled: true,
            video_enabled: true,
            room_phase: RoomPhase::NotJoined,
            join_requested: false,
            remote_peers: Vec::new(),
            last_error: None,
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Start,
    RefreshDevices,
    SelectAudioDevice(Option<String>),
    SelectVideoDevice(Option<String>),
    StartScreenShare,
    StopScreenShare,
    ToggleAudio {
        respond_to: oneshot::Sender<Option<bool>>,
    },
    ToggleVideo {
        respond_to: oneshot::Sender<Option<bool>>,
    },
    Join,
    Leave,
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Results of work the controller spawned.
enum Completion {
    Acquired(Acquired),
    ShareEnded {
        generation: u64,
    },
    Joined {
        epoch: u64,
        stream: MediaStreamHandle,
        result: std::result::Result<JoinedRoom, RoomError>,
    },
    Room {
        epoch: u64,
        event: RoomEvent,
    },
    Endpoint {
        epoch: u64,
        result: std::result::Result<String, SignalingError>,
    },
}

/// Handle to a running session. Clones drive the same session.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    registry: Arc<DeviceRegistry>,
    channel: MessageChannel,
}

impl Session {
    /// Spawn the controller task. Nothing is captured or joined until
    /// [`start`](Self::start) and [`join`](Self::join).
    pub fn spawn(config: SessionConfig, collaborators: Collaborators) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let registry = Arc::new(DeviceRegistry::new(
            collaborators.platform.clone(),
            config.devices.clone(),
        ));
        let channel = MessageChannel::spawn(collaborators.connector.clone(), config.channel.clone());

        let controller = SessionController::new(
            config,
            collaborators,
            registry.clone(),
            channel.clone(),
            command_rx,
            status_tx,
        );
        tokio::spawn(controller.run());

        Self {
            commands,
            status,
            registry,
            channel,
        }
    }

    /// Enumerate devices and start the default camera/microphone capture.
    pub fn start(&self) -> Result<()> {
        self.command(SessionCommand::Start)
    }

    pub fn refresh_devices(&self) -> Result<()> {
        self.command(SessionCommand::RefreshDevices)
    }

    /// `None` selects the platform's default microphone.
    pub fn select_audio_device(&self, device_id: Option<String>) -> Result<()> {
        self.command(SessionCommand::SelectAudioDevice(device_id))
    }

    /// `None` selects the platform's default camera.
    pub fn select_video_device(&self, device_id: Option<String>) -> Result<()> {
        self.command(SessionCommand::SelectVideoDevice(device_id))
    }

    pub fn start_screen_share(&self) -> Result<()> {
        self.command(SessionCommand::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.command(SessionCommand::StopScreenShare)
    }

    /// Mute or unmute the microphone. Returns the new enabled state, or
    /// `None` when the local stream has no audio track.
    pub async fn toggle_audio(&self) -> Result<Option<bool>> {
        let (respond_to, rx) = oneshot::channel();
        self.command(SessionCommand::ToggleAudio { respond_to })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub async fn toggle_video(&self) -> Result<Option<bool>> {
        let (respond_to, rx) = oneshot::channel();
        self.command(SessionCommand::ToggleVideo { respond_to })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Ask to join the configured room.
    ///
    /// The join happens as soon as a local stream exists and the peer network
    /// is ready, re-checked whenever either changes.
    pub fn join(&self) -> Result<()> {
        self.command(SessionCommand::Join)
    }

    pub fn leave(&self) -> Result<()> {
        self.command(SessionCommand::Leave)
    }

    /// Queue a message on the signaling channel.
    pub fn send_message(&self, message: impl Into<Payload>) {
        self.channel.send(message);
    }

    /// Oldest message received on the signaling channel, if any.
    pub async fn receive_message(&self) -> Option<Payload> {
        self.channel.receive_next().await
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest device enumeration.
    pub fn devices(&self) -> DeviceSnapshot {
        self.registry.current()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Leave the room, close the channel and release every local capture.
    pub async fn shutdown(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.command(SessionCommand::Shutdown { respond_to })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }
}

struct SessionController {
    config: SessionConfig,
    network: Arc<dyn PeerNetwork>,
    resolver: Arc<dyn EndpointResolver>,
    registry: Arc<DeviceRegistry>,
    streams: StreamLifecycleManager,
    room: PeerRoomSession,
    join_requested: bool,
    /// `None` once the network dropped its readiness publisher
    readiness: Option<watch::Receiver<bool>>,
    channel: MessageChannel,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    status: watch::Sender<SessionStatus>,
    last_error: Option<String>,
}

impl SessionController {
    fn new(
        config: SessionConfig,
        collaborators: Collaborators,
        registry: Arc<DeviceRegistry>,
        channel: MessageChannel,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let streams = StreamLifecycleManager::new(collaborators.platform.clone(), &config.capture);
        let room = PeerRoomSession::new(config.room_id.clone(), 0);
        let readiness = Some(collaborators.network.readiness());

        Self {
            config,
            network: collaborators.network,
            resolver: collaborators.resolver,
            registry,
            streams,
            room,
            join_requested: false,
            readiness,
            channel,
            commands,
            completions_tx,
            completions,
            status,
            last_error: None,
        }
    }

    async fn run(mut self) {
        info!(room = %self.config.room_id, "Session controller started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { respond_to }) => {
                        self.teardown();
                        self.publish();
                        let _ = respond_to.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                changed = readiness_changed(&mut self.readiness) => {
                    if changed {
                        debug!(open = self.network_open(), "Peer network readiness changed");
                        self.maybe_join();
                    }
                }
            }

            self.publish();
        }

        self.teardown();
        self.publish();
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => {
                self.spawn_refresh();
                if *self.streams.requested_mode() == SessionMode::Idle {
                    let selection = self.streams.selection().clone();
                    let request = self.streams.activate(SessionMode::Capturing(selection));
                    self.spawn_acquire(request);
                }
            }
            SessionCommand::RefreshDevices => self.spawn_refresh(),
            SessionCommand::SelectAudioDevice(device_id) => {
                let request = self.streams.select_audio_device(device_id);
                self.spawn_acquire(request);
            }
            SessionCommand::SelectVideoDevice(device_id) => {
                let request = self.streams.select_video_device(device_id);
                self.spawn_acquire(request);
            }
            SessionCommand::StartScreenShare => {
                let request = self.streams.start_screen_share();
                self.spawn_acquire(request);
            }
            SessionCommand::StopScreenShare => {
                let request = self.streams.stop_screen_share();
                self.spawn_acquire(request);
            }
            SessionCommand::ToggleAudio { respond_to } => {
                let _ = respond_to.send(self.streams.toggle_audio());
            }
            SessionCommand::ToggleVideo { respond_to } => {
                let _ = respond_to.send(self.streams.toggle_video());
            }
            SessionCommand::Join => {
                if self.room.phase() == RoomPhase::Left {
                    self.room = PeerRoomSession::new(self.config.room_id.clone(), self.room.epoch() + 1);
                }
                self.join_requested = true;
                self.maybe_join();
            }
            SessionCommand::Leave => {
                self.join_requested = false;
                self.room.leave();
                self.channel.disconnect();
            }
            SessionCommand::Shutdown { .. } => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Acquired(acquired) => self.install(acquired),
            Completion::ShareEnded { generation } => {
                let request = self.streams.share_ended(generation);
                self.spawn_acquire(request);
            }
            Completion::Joined {
                epoch,
                stream,
                result,
            } => self.joined(epoch, stream, result),
            Completion::Room { epoch, event } => {
                if epoch != self.room.epoch() {
                    debug!(epoch, current = self.room.epoch(), "Dropping event from a previous room");
                    if let RoomEvent::Stream { stream, .. } = event {
                        stream.stop();
                    }
                    return;
                }
                self.room.handle_event(event);
            }
            Completion::Endpoint { epoch, result } => {
                if epoch != self.room.epoch() || self.room.phase() != RoomPhase::Joined {
                    debug!(epoch, "Ignoring endpoint for a room no longer joined");
                    return;
                }
                match result {
                    Ok(url) => self.channel.connect(url),
                    Err(e) => {
                        warn!(error = %e, room = %self.room.room_id(), "Signaling endpoint lookup failed");
                        self.last_error = Some(e.to_string());
                    }
                }
            }
        }
    }

    fn install(&mut self, acquired: Acquired) {
        let generation = acquired.generation();
        match self.streams.install(acquired) {
            InstallOutcome::Installed { stream, .. } => {
                if self.streams.mode().is_screen_sharing() {
                    self.watch_share(stream.clone(), generation);
                }
                self.room.replace_stream(&stream);
                self.maybe_join();
            }
            InstallOutcome::Superseded => {}
            InstallOutcome::Failed(e) => {
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn maybe_join(&mut self) {
        if !self.join_requested {
            return;
        }
        let Some(stream) = self.streams.active().cloned() else {
            debug!("Join waiting for a local stream");
            return;
        };
        if !self.room.can_join(stream.is_live(), self.network_open()) {
            return;
        }
        self.room.begin_join();

        let network = self.network.clone();
        let room_id = self.room.room_id().to_string();
        let epoch = self.room.epoch();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = network.join_room(&room_id, stream.clone()).await;
            let completion = Completion::Joined {
                epoch,
                stream,
                result,
            };
            if let Err(mpsc::error::SendError(Completion::Joined {
                result: Ok(joined), ..
            })) = completions.send(completion)
            {
                joined.handle.close();
            }
        });
    }

    fn joined(
        &mut self,
        epoch: u64,
        stream: MediaStreamHandle,
        result: std::result::Result<JoinedRoom, RoomError>,
    ) {
        if epoch != self.room.epoch() {
            if let Ok(joined) = result {
                joined.handle.close();
            }
            return;
        }

        let joined = match result {
            Ok(joined) => joined,
            Err(e) => {
                warn!(error = %e, room = %self.room.room_id(), "Room join failed");
                self.room.fail_join();
                self.join_requested = false;
                self.last_error = Some(e.to_string());
                return;
            }
        };

        let JoinedRoom { handle, mut events } = joined;
        if let Err(handle) = self.room.complete_join(stream, handle) {
            handle.close();
            return;
        }

        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(mpsc::error::SendError(undelivered)) =
                    completions.send(Completion::Room { epoch, event })
                {
                    if let Completion::Room {
                        event: RoomEvent::Stream { stream, .. },
                        ..
                    } = undelivered
                    {
                        stream.stop();
                    }
                    break;
                }
            }
        });

        // The local stream may have changed while the join was in flight.
        if let Some(active) = self.streams.active().cloned() {
            self.room.replace_stream(&active);
        }
        self.resolve_endpoint();
    }

    fn resolve_endpoint(&self) {
        let resolver = self.resolver.clone();
        let room_id = self.room.room_id().to_string();
        let epoch = self.room.epoch();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = resolver.signaling_endpoint(&room_id).await;
            let _ = completions.send(Completion::Endpoint { epoch, result });
        });
    }

    fn spawn_acquire(&self, request: Option<ActivationRequest>) {
        let Some(request) = request else {
            return;
        };
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let acquired = request.acquire().await;
            if let Err(mpsc::error::SendError(Completion::Acquired(acquired))) =
                completions.send(Completion::Acquired(acquired))
            {
                acquired.discard();
            }
        });
    }

    fn spawn_refresh(&self) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            registry.refresh().await;
        });
    }

    /// Report when the user ends the share from outside the application.
    fn watch_share(&self, stream: MediaStreamHandle, generation: u64) {
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            if stream.source_ended().await {
                let _ = completions.send(Completion::ShareEnded { generation });
            }
        });
    }

    fn network_open(&self) -> bool {
        self.readiness
            .as_ref()
            .is_some_and(|readiness| *readiness.borrow())
    }

    fn teardown(&mut self) {
        self.join_requested = false;
        self.room.leave();
        self.channel.disconnect();
        self.registry.cancel();
        self.streams.deactivate();
        info!(room = %self.config.room_id, "Session shut down");
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            mode: self.streams.mode().clone(),
            local_stream: self.streams.active().cloned(),
            audio_enabled: self.streams.audio_enabled(),
            video_enabled: self.streams.video_enabled(),
            room_phase: self.room.phase(),
            join_requested: self.join_requested,
            remote_peers: self.room.peers().to_vec(),
            last_error: self.last_error.clone(),
        });
    }
}

/// Resolves with `true` on every readiness change; never resolves once the
/// publisher is gone.
async fn readiness_changed(readiness: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(receiver) = readiness else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_ok() {
        return true;
    }
    *readiness = None;
    false
}

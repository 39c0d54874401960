use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{CaptureError, RoomError, SignalingError};
use crate::media::{
    CaptureConstraints, CapturePlatform, DeviceDescriptor, DeviceKind, MediaStreamHandle,
    MediaTrack, TrackConstraint, TrackKind,
};
use crate::room::{JoinedRoom, PeerNetwork, RoomEvent, RoomHandle};
use crate::signaling::EndpointResolver;
use crate::transport::{Connector, Payload, TransportCommand, TransportEvent, TransportLink};

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Capture platform backed by a mutable device list.
#[derive(Default)]
pub struct FakePlatform {
    devices: Mutex<Vec<DeviceDescriptor>>,
    enumerations: AtomicUsize,
    fail_enumeration: AtomicBool,
    deny_capture: AtomicBool,
    deny_display: AtomicBool,
    hold: AtomicBool,
    held: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    streams: Mutex<Vec<MediaStreamHandle>>,
    user_media_calls: AtomicUsize,
    display_calls: AtomicUsize,
}

impl FakePlatform {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Self::default()
        }
    }

    /// Two microphones and two cameras; one of each is labeled.
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            DeviceDescriptor::new("a1", DeviceKind::AudioInput, "Headset"),
            DeviceDescriptor::new("a2", DeviceKind::AudioInput, ""),
            DeviceDescriptor::new("v1", DeviceKind::VideoInput, "Webcam"),
            DeviceDescriptor::new("v2", DeviceKind::VideoInput, ""),
            DeviceDescriptor::new("o1", DeviceKind::AudioOutput, "Speakers"),
        ])
    }

    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    pub fn deny_capture(&self, deny: bool) {
        self.deny_capture.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    /// Make every later capture wait for [`release`](Self::release).
    pub fn hold_captures(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of captures started while holding.
    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn release(&self, index: usize) {
        if let Some(tx) = self.held.lock().unwrap()[index].take() {
            let _ = tx.send(());
        }
    }

    /// Every stream produced so far, in completion order.
    pub fn all_streams(&self) -> Vec<MediaStreamHandle> {
        self.streams.lock().unwrap().clone()
    }

    pub fn live_streams(&self) -> Vec<MediaStreamHandle> {
        self.all_streams()
            .into_iter()
            .filter(MediaStreamHandle::is_live)
            .collect()
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn display_calls(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }

    async fn wait_if_held(&self) {
        if !self.hold.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.held.lock().unwrap().push(Some(tx));
        let _ = rx.await;
    }

    fn check_device(&self, constraint: &TrackConstraint, kind: DeviceKind) -> Result<(), CaptureError> {
        if let TrackConstraint::Device(id) = constraint {
            let known = self
                .devices
                .lock()
                .unwrap()
                .iter()
                .any(|d| &d.id == id && d.kind == kind);
            if !known {
                return Err(CaptureError::NotFound(id.clone()));
            }
        }
        Ok(())
    }

    fn record(&self, prefix: &str, constraints: &CaptureConstraints) -> MediaStreamHandle {
        let mut streams = self.streams.lock().unwrap();
        let id = format!("{prefix}-{}", streams.len());
        let mut tracks = Vec::new();
        if constraints.audio != TrackConstraint::Disabled {
            tracks.push(MediaTrack::new(format!("{id}-audio"), TrackKind::Audio));
        }
        if constraints.video != TrackConstraint::Disabled {
            tracks.push(MediaTrack::new(format!("{id}-video"), TrackKind::Video));
        }
        let stream = MediaStreamHandle::new(id, tracks);
        streams.push(stream.clone());
        stream
    }
}

#[async_trait]
impl CapturePlatform for FakePlatform {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(CaptureError::Platform(anyhow::anyhow!("enumeration unavailable")));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_if_held().await;
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("camera".to_string()));
        }
        self.check_device(&constraints.audio, DeviceKind::AudioInput)?;
        self.check_device(&constraints.video, DeviceKind::VideoInput)?;
        Ok(self.record("cam", constraints))
    }

    async fn get_display_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError> {
        self.display_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_if_held().await;
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("display".to_string()));
        }
        Ok(self.record("screen", constraints))
    }
}

#[derive(Default)]
struct ProbeState {
    closed: bool,
    replaced: Vec<String>,
}

/// Observes what the session does with a room handle.
#[derive(Clone, Default)]
pub struct RoomProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl RoomProbe {
    pub fn handle(&self) -> ProbeHandle {
        ProbeHandle {
            state: self.state.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Ids of the streams passed to `replace_stream`, in order.
    pub fn replaced(&self) -> Vec<String> {
        self.state.lock().unwrap().replaced.clone()
    }
}

pub struct ProbeHandle {
    state: Arc<Mutex<ProbeState>>,
}

impl RoomHandle for ProbeHandle {
    fn replace_stream(&self, stream: &MediaStreamHandle) {
        self.state
            .lock()
            .unwrap()
            .replaced
            .push(stream.id().to_string());
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

struct JoinRecord {
    room_id: String,
    stream: MediaStreamHandle,
    events: mpsc::UnboundedSender<RoomEvent>,
    probe: RoomProbe,
}

/// Peer network whose readiness and joins are driven by the test.
pub struct FakeNetwork {
    ready: watch::Sender<bool>,
    fail_join: AtomicBool,
    joins: Mutex<Vec<JoinRecord>>,
}

impl FakeNetwork {
    pub fn new(open: bool) -> Self {
        let (ready, _) = watch::channel(open);
        Self {
            ready,
            fail_join: AtomicBool::new(false),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.ready.send_replace(open);
    }

    pub fn fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    pub fn join_count(&self) -> usize {
        self.joins.lock().unwrap().len()
    }

    pub fn joined_room(&self, index: usize) -> String {
        self.joins.lock().unwrap()[index].room_id.clone()
    }

    pub fn joined_stream(&self, index: usize) -> MediaStreamHandle {
        self.joins.lock().unwrap()[index].stream.clone()
    }

    pub fn room(&self, index: usize) -> RoomProbe {
        self.joins.lock().unwrap()[index].probe.clone()
    }

    pub fn emit(&self, index: usize, event: RoomEvent) {
        let _ = self.joins.lock().unwrap()[index].events.send(event);
    }
}

#[async_trait]
impl PeerNetwork for FakeNetwork {
    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    async fn join_room(
        &self,
        room_id: &str,
        stream: MediaStreamHandle,
    ) -> Result<JoinedRoom, RoomError> {
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(RoomError::JoinFailed(format!("room {room_id} refused")));
        }
        let (events, rx) = mpsc::unbounded_channel();
        let probe = RoomProbe::default();
        let handle = probe.handle();
        self.joins.lock().unwrap().push(JoinRecord {
            room_id: room_id.to_string(),
            stream,
            events,
            probe,
        });
        Ok(JoinedRoom {
            handle: Box::new(handle),
            events: rx,
        })
    }
}

/// Resolver that counts lookups and can be made to fail.
pub struct FakeResolver {
    url: String,
    fail: AtomicBool,
    lookups: AtomicUsize,
}

impl FakeResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fail: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointResolver for FakeResolver {
    async fn signaling_endpoint(&self, room_id: &str) -> Result<String, SignalingError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::Lookup(format!("no endpoint for {room_id}")));
        }
        Ok(self.url.clone())
    }
}

/// Server side of one link opened by [`FakeConnector`].
#[derive(Clone)]
pub struct LinkProbe {
    pub url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: Arc<Mutex<mpsc::UnboundedReceiver<TransportCommand>>>,
}

impl LinkProbe {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn deliver(&self, payload: impl Into<Payload>) {
        let _ = self.events.send(TransportEvent::Message(payload.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Close);
    }

    /// Commands written to the link since the last call.
    pub fn sent(&self) -> Vec<TransportCommand> {
        let mut commands = self.commands.lock().unwrap();
        let mut sent = Vec::new();
        while let Ok(command) = commands.try_recv() {
            sent.push(command);
        }
        sent
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<LinkProbe>>,
}

impl FakeConnector {
    pub fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> LinkProbe {
        self.links.lock().unwrap()[index].clone()
    }
}

impl Connector for FakeConnector {
    fn open(&self, url: &str) -> TransportLink {
        let (link, commands, events) = TransportLink::pair();
        self.links.lock().unwrap().push(LinkProbe {
            url: url.to_string(),
            events,
            commands: Arc::new(Mutex::new(commands)),
        });
        link
    }
}

//! Local outgoing stream lifecycle. Captures run outside the manager and
//! come back tagged with the generation that requested them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::device::DeviceSelection;
use super::platform::{CaptureConstraints, CapturePlatform};
use super::track::{MediaStreamHandle, TrackKind};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// What the local participant is sending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Idle,
    Capturing(DeviceSelection),
    ScreenSharing,
}

impl SessionMode {
    pub fn is_screen_sharing(&self) -> bool {
        matches!(self, SessionMode::ScreenSharing)
    }
}

/// A capture the manager wants performed.
pub struct ActivationRequest {
    generation: u64,
    mode: SessionMode,
    platform: Arc<dyn CapturePlatform>,
}

impl ActivationRequest {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    /// Ask the platform for the stream.
    pub async fn acquire(self) -> Acquired {
        let result = match &self.mode {
            SessionMode::Capturing(selection) => {
                self.platform
                    .get_user_media(&CaptureConstraints::for_selection(selection))
                    .await
            }
            SessionMode::ScreenSharing => {
                self.platform
                    .get_display_media(&CaptureConstraints::display())
                    .await
            }
            SessionMode::Idle => Err(CaptureError::NotFound("nothing to capture".to_string())),
        };

        Acquired {
            generation: self.generation,
            mode: self.mode,
            result,
        }
    }
}

/// Result of an [`ActivationRequest`].
#[derive(Debug)]
pub struct Acquired {
    generation: u64,
    mode: SessionMode,
    result: Result<MediaStreamHandle, CaptureError>,
}

impl Acquired {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release a result that will never be installed.
    pub fn discard(self) {
        if let Ok(stream) = &self.result {
            stream.stop();
        }
    }
}

#[derive(Debug)]
pub enum InstallOutcome {
    /// The stream is now the active outgoing stream. `replaced` is the
    /// previous active stream, already stopped.
    Installed {
        stream: MediaStreamHandle,
        replaced: Option<MediaStreamHandle>,
    },
    /// A newer request was issued; the result has been stopped.
    Superseded,
    /// The capture failed; the previous active stream is untouched.
    Failed(CaptureError),
}

pub struct StreamLifecycleManager {
    platform: Arc<dyn CapturePlatform>,
    release_before_acquire: bool,
    /// Mode of the installed stream
    mode: SessionMode,
    /// Mode of the most recent request
    requested: SessionMode,
    /// Last device selection, kept while sharing
    selection: DeviceSelection,
    active: Option<MediaStreamHandle>,
    generation: u64,
    installed_generation: u64,
    pending: bool,
    audio_enabled: bool,
    video_enabled: bool,
}

impl StreamLifecycleManager {
    pub fn new(platform: Arc<dyn CapturePlatform>, config: &CaptureConfig) -> Self {
        Self {
            platform,
            release_before_acquire: config.release_before_acquire,
            mode: SessionMode::Idle,
            requested: SessionMode::Idle,
            selection: DeviceSelection::default(),
            active: None,
            generation: 0,
            installed_generation: 0,
            pending: false,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn requested_mode(&self) -> &SessionMode {
        &self.requested
    }

    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    pub fn active(&self) -> Option<&MediaStreamHandle> {
        self.active.as_ref()
    }

    /// Generation of the request that produced the active stream.
    pub fn installed_generation(&self) -> u64 {
        self.installed_generation
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Switch to `mode`. Returns the capture to perform, if any.
    ///
    /// `Idle` stops the active stream immediately and abandons every request
    /// in flight. A camera request while a share is requested only records the
    /// selection; it is used when the share ends.
    pub fn activate(&mut self, mode: SessionMode) -> Option<ActivationRequest> {
        if let SessionMode::Capturing(selection) = &mode {
            if self.requested.is_screen_sharing() {
                debug!(selection = ?selection, "Screen share active, recording device selection");
                self.selection = selection.clone();
                return None;
            }
        }
        self.request(mode)
    }

    fn request(&mut self, mode: SessionMode) -> Option<ActivationRequest> {
        if let SessionMode::Capturing(selection) = &mode {
            self.selection = selection.clone();
        }
        if mode == SessionMode::Idle {
            self.deactivate();
            return None;
        }

        self.generation += 1;
        self.pending = true;
        self.requested = mode.clone();

        if self.release_before_acquire {
            if let Some(previous) = self.active.take() {
                previous.stop();
                self.mode = SessionMode::Idle;
                debug!(stream = previous.id(), "Released capture ahead of replacement");
            }
        }

        debug!(generation = self.generation, mode = ?mode, "Activation requested");
        Some(ActivationRequest {
            generation: self.generation,
            mode,
            platform: self.platform.clone(),
        })
    }

    /// Apply a new camera/microphone selection.
    pub fn select_devices(&mut self, selection: DeviceSelection) -> Option<ActivationRequest> {
        if self.requested == SessionMode::Capturing(selection.clone())
            && (self.pending || self.active.as_ref().is_some_and(|s| s.is_live()))
        {
            return None;
        }
        self.activate(SessionMode::Capturing(selection))
    }

    pub fn select_audio_device(&mut self, device_id: Option<String>) -> Option<ActivationRequest> {
        let selection = DeviceSelection {
            audio: device_id,
            ..self.selection.clone()
        };
        self.select_devices(selection)
    }

    pub fn select_video_device(&mut self, device_id: Option<String>) -> Option<ActivationRequest> {
        let selection = DeviceSelection {
            video: device_id,
            ..self.selection.clone()
        };
        self.select_devices(selection)
    }

    pub fn start_screen_share(&mut self) -> Option<ActivationRequest> {
        if self.requested.is_screen_sharing() {
            return None;
        }
        self.activate(SessionMode::ScreenSharing)
    }

    /// Stop sharing and go back to the last camera selection.
    pub fn stop_screen_share(&mut self) -> Option<ActivationRequest> {
        if !self.requested.is_screen_sharing() && !self.mode.is_screen_sharing() {
            return None;
        }
        if self.mode.is_screen_sharing() {
            if let Some(share) = self.active.take() {
                share.stop();
                info!(stream = share.id(), "Screen share stopped");
            }
            self.mode = SessionMode::Idle;
        }
        self.request(SessionMode::Capturing(self.selection.clone()))
    }

    /// The share installed by `generation` was ended outside the application.
    pub fn share_ended(&mut self, generation: u64) -> Option<ActivationRequest> {
        if !self.mode.is_screen_sharing() || self.installed_generation != generation {
            debug!(generation, "Ignoring end of a stale screen share");
            return None;
        }
        info!(generation, "Screen share ended by the user, falling back to capture");
        self.stop_screen_share()
    }

    /// Install the result of an activation.
    pub fn install(&mut self, acquired: Acquired) -> InstallOutcome {
        if acquired.generation != self.generation {
            debug!(
                generation = acquired.generation,
                latest = self.generation,
                "Discarding superseded capture"
            );
            acquired.discard();
            return InstallOutcome::Superseded;
        }
        self.pending = false;

        match acquired.result {
            Err(e) => {
                warn!(error = %e, mode = ?acquired.mode, "Capture failed, keeping current stream");
                self.requested = self.mode.clone();
                InstallOutcome::Failed(e)
            }
            Ok(stream) => {
                let replaced = self.active.take();
                if let Some(previous) = &replaced {
                    if !previous.same_stream(&stream) {
                        previous.stop();
                    }
                }
                if let SessionMode::Capturing(_) = acquired.mode {
                    self.apply_mute(&stream);
                }

                info!(
                    stream = stream.id(),
                    generation = acquired.generation,
                    mode = ?acquired.mode,
                    "Active outgoing stream installed"
                );
                self.active = Some(stream.clone());
                self.mode = acquired.mode;
                self.installed_generation = acquired.generation;
                InstallOutcome::Installed { stream, replaced }
            }
        }
    }

    /// Flip the first audio track of the active stream.
    ///
    /// Returns the new enabled state, or `None` when there is no such track.
    pub fn toggle_audio(&mut self) -> Option<bool> {
        let enabled = self.toggle(TrackKind::Audio, !self.audio_enabled)?;
        self.audio_enabled = enabled;
        Some(enabled)
    }

    pub fn toggle_video(&mut self) -> Option<bool> {
        let enabled = self.toggle(TrackKind::Video, !self.video_enabled)?;
        self.video_enabled = enabled;
        Some(enabled)
    }

    /// Stop the active stream and abandon pending requests.
    pub fn deactivate(&mut self) -> Option<MediaStreamHandle> {
        self.generation += 1;
        self.pending = false;
        self.mode = SessionMode::Idle;
        self.requested = SessionMode::Idle;
        let stopped = self.active.take();
        if let Some(stream) = &stopped {
            stream.stop();
            info!(stream = stream.id(), "Active outgoing stream stopped");
        }
        stopped
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> Option<bool> {
        let track = self.active.as_ref()?.first_track(kind)?;
        track.set_enabled(enabled);
        debug!(track = track.id(), %kind, enabled, "Track toggled");
        Some(enabled)
    }

    fn apply_mute(&self, stream: &MediaStreamHandle) {
        if let Some(track) = stream.first_track(TrackKind::Audio) {
            track.set_enabled(self.audio_enabled);
        }
        if let Some(track) = stream.first_track(TrackKind::Video) {
            track.set_enabled(self.video_enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    fn manager(platform: &Arc<FakePlatform>) -> StreamLifecycleManager {
        StreamLifecycleManager::new(platform.clone(), &CaptureConfig::default())
    }

    async fn run(manager: &mut StreamLifecycleManager, request: Option<ActivationRequest>) -> InstallOutcome {
        let request = request.expect("expected an activation request");
        let acquired = request.acquire().await;
        manager.install(acquired)
    }

    fn live_count(platform: &FakePlatform) -> usize {
        platform
            .all_streams()
            .iter()
            .filter(|s| s.is_live())
            .count()
    }

    #[tokio::test]
    async fn test_capture_replaces_and_stops_previous() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "v1");
        let first = match run(&mut manager, request).await {
            InstallOutcome::Installed { stream, replaced } => {
                assert!(replaced.is_none());
                stream
            }
            other => panic!("unexpected outcome: {:?}", other),
        };

        let request = manager.select_video_device(Some("v2".to_string()));
        match run(&mut manager, request).await {
            InstallOutcome::Installed { stream, replaced } => {
                assert!(replaced.unwrap().same_stream(&first));
                assert!(stream.is_live());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(!first.is_live());
        assert_eq!(live_count(&platform), 1);
        assert_eq!(
            manager.mode(),
            &SessionMode::Capturing(DeviceSelection::new("a1", "v2"))
        );
    }

    fn manager_activate(
        manager: &mut StreamLifecycleManager,
        audio: &str,
        video: &str,
    ) -> Option<ActivationRequest> {
        manager.activate(SessionMode::Capturing(DeviceSelection::new(audio, video)))
    }

    #[tokio::test]
    async fn test_mode_switches_keep_a_single_live_stream() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "v1");
        run(&mut manager, request).await;
        assert_eq!(live_count(&platform), 1);

        let request = manager.start_screen_share();
        run(&mut manager, request).await;
        assert_eq!(live_count(&platform), 1);
        assert!(manager.mode().is_screen_sharing());

        let request = manager.stop_screen_share();
        assert_eq!(live_count(&platform), 0);
        run(&mut manager, request).await;
        assert_eq!(live_count(&platform), 1);

        let request = manager.select_audio_device(Some("a2".to_string()));
        run(&mut manager, request).await;
        assert_eq!(live_count(&platform), 1);

        manager.deactivate();
        assert_eq!(live_count(&platform), 0);
        assert_eq!(manager.mode(), &SessionMode::Idle);
    }

    #[tokio::test]
    async fn test_last_request_wins() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let older = manager_activate(&mut manager, "a1", "v1").unwrap();
        let newer = manager.select_video_device(Some("v2".to_string())).unwrap();
        assert!(newer.generation() > older.generation());

        // Newer completes first, then the stale one arrives.
        let newer = newer.acquire().await;
        let older = older.acquire().await;
        let older_stream = platform.all_streams()[1].clone();

        assert!(matches!(manager.install(newer), InstallOutcome::Installed { .. }));
        assert!(matches!(manager.install(older), InstallOutcome::Superseded));

        assert!(!older_stream.is_live());
        assert_eq!(live_count(&platform), 1);
        assert_eq!(
            manager.mode(),
            &SessionMode::Capturing(DeviceSelection::default().with_audio("a1").with_video("v2"))
        );
    }

    #[tokio::test]
    async fn test_selection_while_sharing_is_recorded_only() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "v1");
        run(&mut manager, request).await;
        let request = manager.start_screen_share();
        let share = match run(&mut manager, request).await {
            InstallOutcome::Installed { stream, .. } => stream,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let selection = DeviceSelection::new("a2", "v2");
        assert!(manager.select_devices(selection.clone()).is_none());
        assert!(share.is_live());
        assert!(manager.mode().is_screen_sharing());
        assert_eq!(manager.selection(), &selection);

        let request = manager.stop_screen_share().unwrap();
        assert_eq!(request.mode(), &SessionMode::Capturing(selection));
        assert!(!share.is_live());
    }

    #[tokio::test]
    async fn test_capture_activation_while_sharing_keeps_share() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "v1");
        run(&mut manager, request).await;
        let request = manager.start_screen_share();
        let share = match run(&mut manager, request).await {
            InstallOutcome::Installed { stream, .. } => stream,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert!(manager_activate(&mut manager, "a2", "v2").is_none());
        assert!(share.is_live());
        assert!(manager.mode().is_screen_sharing());
        assert!(manager.requested_mode().is_screen_sharing());
        assert_eq!(manager.selection(), &DeviceSelection::new("a2", "v2"));
        assert_eq!(live_count(&platform), 1);

        // A share still being acquired is not replaced either.
        manager.deactivate();
        let pending_share = manager.start_screen_share().unwrap();
        assert!(manager_activate(&mut manager, "a1", "v1").is_none());
        let acquired = pending_share.acquire().await;
        assert!(matches!(manager.install(acquired), InstallOutcome::Installed { .. }));
        assert!(manager.mode().is_screen_sharing());
        assert_eq!(manager.selection(), &DeviceSelection::new("a1", "v1"));
    }

    #[tokio::test]
    async fn test_capture_failure_keeps_previous_stream() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "v1");
        let current = match run(&mut manager, request).await {
            InstallOutcome::Installed { stream, .. } => stream,
            other => panic!("unexpected outcome: {:?}", other),
        };

        platform.deny_capture(true);
        let request = manager.select_video_device(Some("v2".to_string()));
        match run(&mut manager, request).await {
            InstallOutcome::Failed(CaptureError::PermissionDenied(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(current.is_live());
        assert!(manager.active().unwrap().same_stream(&current));
        assert_eq!(manager.requested_mode(), manager.mode());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager_activate(&mut manager, "a1", "nope");
        assert!(matches!(
            run(&mut manager, request).await,
            InstallOutcome::Failed(CaptureError::NotFound(_))
        ));
        assert!(manager.active().is_none());
    }

    #[tokio::test]
    async fn test_release_before_acquire() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = StreamLifecycleManager::new(
            platform.clone(),
            &CaptureConfig {
                release_before_acquire: true,
            },
        );

        let request = manager_activate(&mut manager, "a1", "v1");
        run(&mut manager, request).await;

        let request = manager.select_video_device(Some("v2".to_string()));
        assert_eq!(live_count(&platform), 0);
        assert!(manager.active().is_none());
        run(&mut manager, request).await;
        assert_eq!(live_count(&platform), 1);
    }

    #[tokio::test]
    async fn test_toggle_flips_first_track_and_survives_replacement() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);
        assert_eq!(manager.toggle_audio(), None);

        let request = manager_activate(&mut manager, "a1", "v1");
        run(&mut manager, request).await;

        assert_eq!(manager.toggle_audio(), Some(false));
        let active = manager.active().unwrap().clone();
        assert!(!active.first_track(TrackKind::Audio).unwrap().is_enabled());
        assert!(active.first_track(TrackKind::Video).unwrap().is_enabled());

        let request = manager.select_video_device(Some("v2".to_string()));
        run(&mut manager, request).await;
        let replacement = manager.active().unwrap();
        assert!(!replacement.first_track(TrackKind::Audio).unwrap().is_enabled());

        assert_eq!(manager.toggle_audio(), Some(true));
        assert_eq!(manager.toggle_video(), Some(false));
    }

    #[tokio::test]
    async fn test_share_ended_for_stale_generation_is_ignored() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager.start_screen_share();
        run(&mut manager, request).await;
        let generation = manager.installed_generation();

        assert!(manager.share_ended(generation + 1).is_none());
        let request = manager.share_ended(generation).unwrap();
        assert_eq!(
            request.mode(),
            &SessionMode::Capturing(DeviceSelection::default())
        );
    }

    #[tokio::test]
    async fn test_same_selection_does_not_reacquire() {
        let platform = Arc::new(FakePlatform::with_default_devices());
        let mut manager = manager(&platform);

        let request = manager.select_devices(DeviceSelection::new("a1", "v1"));
        run(&mut manager, request).await;
        assert!(manager.select_devices(DeviceSelection::new("a1", "v1")).is_none());
    }
}

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::platform::CapturePlatform;
use crate::config::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::AudioInput => write!(f, "audioinput"),
            DeviceKind::VideoInput => write!(f, "videoinput"),
            DeviceKind::AudioOutput => write!(f, "audiooutput"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub kind: DeviceKind,
    /// Empty until the user has granted capture permission
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }

    pub fn is_labeled(&self) -> bool {
        !self.label.is_empty()
    }
}

/// Usable input devices, partitioned by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub audio: Vec<DeviceDescriptor>,
    pub video: Vec<DeviceDescriptor>,
}

impl DeviceList {
    /// Partition an enumeration, dropping outputs and unlabeled entries.
    pub fn from_enumeration(devices: Vec<DeviceDescriptor>) -> Self {
        let mut list = DeviceList::default();
        for device in devices.into_iter().filter(DeviceDescriptor::is_labeled) {
            match device.kind {
                DeviceKind::AudioInput => list.audio.push(device),
                DeviceKind::VideoInput => list.video.push(device),
                DeviceKind::AudioOutput => {}
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty()
    }
}

/// Latest published enumeration result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub devices: DeviceList,
    /// Retry counter of the attempt that produced `devices`
    pub attempt: u32,
    /// No further automatic retry will replace this result
    pub settled: bool,
}

/// Device ids requested for camera/microphone capture.
///
/// `None` lets the platform choose its default device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub audio: Option<String>,
    pub video: Option<String>,
}

impl DeviceSelection {
    pub fn new(audio: impl Into<String>, video: impl Into<String>) -> Self {
        Self {
            audio: Some(audio.into()),
            video: Some(video.into()),
        }
    }

    pub fn with_audio(mut self, device_id: impl Into<String>) -> Self {
        self.audio = Some(device_id.into());
        self
    }

    pub fn with_video(mut self, device_id: impl Into<String>) -> Self {
        self.video = Some(device_id.into());
        self
    }
}

pub struct DeviceRegistry {
    platform: Arc<dyn CapturePlatform>,
    config: DeviceConfig,
    /// Bumped by every refresh and by `cancel`; a retry loop that observes a
    /// newer epoch abandons its result
    epoch: AtomicU64,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl DeviceRegistry {
    pub fn new(platform: Arc<dyn CapturePlatform>, config: DeviceConfig) -> Self {
        let (snapshot, _) = watch::channel(DeviceSnapshot::default());
        Self {
            platform,
            config,
            epoch: AtomicU64::new(0),
            snapshot,
        }
    }

    pub fn current(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Enumerate devices, retrying while both lists are empty.
    ///
    /// Returns the settled list, or `None` if a newer refresh or a
    /// [`cancel`](Self::cancel) superseded this one while it was waiting.
    pub async fn refresh(&self) -> Option<DeviceList> {
        self.refresh_from(0).await
    }

    /// Like [`refresh`](Self::refresh), starting at retry counter `retry`.
    pub async fn refresh_from(&self, mut retry: u32) -> Option<DeviceList> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        loop {
            let devices = self.enumerate().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!(retry, "Device refresh superseded, dropping result");
                return None;
            }

            let settled = !devices.is_empty() || retry >= self.config.retry_limit;
            self.snapshot.send_replace(DeviceSnapshot {
                devices: devices.clone(),
                attempt: retry,
                settled,
            });

            if settled {
                info!(
                    audio = devices.audio.len(),
                    video = devices.video.len(),
                    retry,
                    "Device list settled"
                );
                return Some(devices);
            }

            retry += 1;
            debug!(
                retry,
                delay_ms = self.config.retry_delay.as_millis() as u64,
                "No labeled devices yet, scheduling retry"
            );
            sleep(self.config.retry_delay).await;

            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!(retry, "Device retry abandoned");
                return None;
            }
        }
    }

    /// Abandon any refresh in flight.
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    async fn enumerate(&self) -> DeviceList {
        match self.platform.enumerate_devices().await {
            Ok(devices) => DeviceList::from_enumeration(devices),
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, treating as empty");
                DeviceList::default()
            }
        }
    }
}

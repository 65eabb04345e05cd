use crate::error::{Error, Operation, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Тип локального трека
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("microphone"),
            TrackKind::Video => f.write_str("camera"),
        }
    }
}

/// Ограничения видеозахвата
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// Что сессия просит у источника медиа
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Запрошенные типы в порядке подключения
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video.is_some() {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Почему не удалось получить медиа
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use camera/microphone was denied; allow access and join again")]
    PermissionDenied,

    #[error("no {0} found; connect a device and join again")]
    DeviceNotFound(TrackKind),

    #[error("{0} is busy; close the other application using it and join again")]
    DeviceBusy(String),

    #[error("{0}")]
    Other(String),
}

/// Локальный трек с подачей сэмплов
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_owned(),
                stream_id.to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    /// Трек в виде для peer connection
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

/// Источник локальных треков
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Берёт все треки по ограничениям или ни одного
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, MediaError>;

    /// Возвращает устройства
    fn release(&self, tracks: &[LocalTrack]);
}

/// Владение полученным медиа
pub struct MediaHandle {
    id: String,
    tracks: Vec<LocalTrack>,
    source: Arc<dyn MediaSource>,
}

impl MediaHandle {
    fn new(tracks: Vec<LocalTrack>, source: Arc<dyn MediaSource>) -> Self {
        let id = random_id();
        info!(media = %id, tracks = tracks.len(), "local media acquired");
        Self { id, tracks, source }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn release(self) {
        // освобождение происходит в Drop
        drop(self);
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.source.release(&self.tracks);
        info!(media = %self.id, "local media released");
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

/// Получение медиа с таймаутом
pub async fn acquire_media(
    source: Arc<dyn MediaSource>,
    constraints: &MediaConstraints,
    limit: Duration,
) -> Result<MediaHandle> {
    debug!(?constraints, "acquiring local media");
    match tokio::time::timeout(limit, source.acquire(constraints)).await {
        Ok(Ok(tracks)) => Ok(MediaHandle::new(tracks, source)),
        Ok(Err(e)) => Err(Error::MediaUnavailable(e)),
        Err(_) => Err(Error::Timeout(Operation::AcquireMedia, limit)),
    }
}

/// Источник на sample-треках; каждое устройство эксклюзивно
pub struct TrackMediaSource {
    available: Vec<TrackKind>,
    permission_granted: bool,
    in_use: Mutex<HashSet<TrackKind>>,
}

impl TrackMediaSource {
    pub fn new(available: Vec<TrackKind>) -> Self {
        Self {
            available,
            permission_granted: true,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_permission(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }
}

impl Default for TrackMediaSource {
    fn default() -> Self {
        Self::new(vec![TrackKind::Audio, TrackKind::Video])
    }
}

#[async_trait]
impl MediaSource for TrackMediaSource {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, MediaError> {
        if !self.permission_granted {
            return Err(MediaError::PermissionDenied);
        }
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::Other(
                "constraints request neither audio nor video".into(),
            ));
        }
        if matches!(&constraints.video, Some(v) if v.frame_rate == 0 || v.width == 0 || v.height == 0)
        {
            return Err(MediaError::Other(format!(
                "unsupported video constraints: {:?}",
                constraints.video
            )));
        }
        if let Some(missing) = kinds.iter().find(|k| !self.available.contains(k)) {
            return Err(MediaError::DeviceNotFound(*missing));
        }

        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| MediaError::Other("media source state poisoned".into()))?;
        if let Some(busy) = kinds.iter().find(|k| in_use.contains(k)) {
            return Err(MediaError::DeviceBusy(busy.to_string()));
        }
        in_use.extend(kinds.iter().copied());

        let stream_id = format!("roomcall-{}", random_id());
        Ok(kinds
            .into_iter()
            .map(|kind| LocalTrack::new(kind, &stream_id))
            .collect())
    }

    fn release(&self, tracks: &[LocalTrack]) {
        if let Ok(mut in_use) = self.in_use.lock() {
            for track in tracks {
                in_use.remove(&track.kind());
            }
        }
    }
}

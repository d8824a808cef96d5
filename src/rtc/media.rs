//! Local audio capture seam.
//!
//! The call core never touches audio hardware directly; a [`AudioSource`]
//! supplies the outbound track and owns the mute flag. Production wires a
//! platform capture pipeline in, tests use [`NullAudioSource`].

use super::RtcError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Opens the capture device and returns the outbound track. Called
    /// before any signaling so a missing microphone aborts the call early.
    async fn open(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>, RtcError>;

    /// Mutes or unmutes capture. Track and transceiver stay up; a muted
    /// source just stops feeding samples.
    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    /// Releases the capture device. Must be safe to call more than once.
    fn close(&self);
}

/// Opus track source backed by a sample-pushing capture pipeline.
///
/// `open` builds the track; the capture side obtains it via [`Self::track`]
/// and writes encoded Opus samples into it.
pub struct OpusTrackSource {
    track: Arc<TrackLocalStaticSample>,
    muted: AtomicBool,
}

impl OpusTrackSource {
    pub fn new() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "lingocall-mic".to_owned(),
        ));
        Self {
            track,
            muted: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl Default for OpusTrackSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSource for OpusTrackSource {
    async fn open(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>, RtcError> {
        Ok(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn close(&self) {}
}

/// Audio source that produces a silent track. Used in tests and headless
/// smoke runs.
pub struct NullAudioSource {
    inner: OpusTrackSource,
    closed: AtomicBool,
}

impl NullAudioSource {
    pub fn new() -> Self {
        Self {
            inner: OpusTrackSource::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for NullAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSource for NullAudioSource {
    async fn open(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>, RtcError> {
        self.inner.open().await
    }

    fn set_muted(&self, muted: bool) {
        self.inner.set_muted(muted);
    }

    fn is_muted(&self) -> bool {
        self.inner.is_muted()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//! Encoder adapters and the per-camera encoding pipeline.
//!
//! The H.264 hardware (or software) encoder and the JPEG encoder are
//! external collaborators behind the [`H264Encoder`] and [`JpegEncoder`]
//! traits. This module owns what wraps them: the per-camera encoder
//! thread, the global SPS/PPS cache, and the bounded drop-old rings that
//! feed each playing client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::VideoProfile;
use crate::error::Result;
use crate::frame::{CAMERA_COUNT, CameraId, FrameBus, RawFrame};

/// Capacity of each client-facing encoded-frame ring.
pub const FRAME_RING_CAPACITY: usize = 5;

/// Consecutive encode failures before a pipeline is declared failed.
const ENCODE_FAILURE_LIMIT: u32 = 3;

/// Idle poll interval while waiting for a fresh raw frame.
const ENCODE_POLL: Duration = Duration::from_millis(5);

/// One encoded H.264 access unit.
///
/// `nal_units` carry no start codes. Parameter sets surfaced by the
/// encoder ride in their own fields rather than in the data list.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub nal_units: Vec<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    pub pts_ns: u64,
    pub keyframe: bool,
}

/// Target parameters for one encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
}

impl EncoderSettings {
    pub fn from_profile(profile: &VideoProfile) -> Self {
        Self {
            width: profile.width,
            height: profile.height,
            bitrate: profile.bitrate,
            frame_rate: profile.frame_rate,
        }
    }
}

/// External H.264 encoder consuming raw YUV frames.
pub trait H264Encoder: Send {
    /// (Re)configure the encoder. Called before first use and again on
    /// dimension or rate changes.
    fn configure(&mut self, settings: &EncoderSettings) -> Result<()>;

    /// Encode one raw frame. `None` means the encoder buffered the input
    /// and produced no output yet.
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>>;

    /// Adjust the target bitrate without a full reconfigure.
    fn set_bitrate(&mut self, bps: u32);

    /// Ask for an IDR on the next encode, so a joining client can start
    /// decoding immediately. Encoders without the capability ignore it.
    fn force_keyframe(&mut self) {}
}

/// Factory producing one [`H264Encoder`] per camera, supplied by the host.
pub type H264EncoderFactory =
    Box<dyn Fn(CameraId) -> Result<Box<dyn H264Encoder>> + Send + Sync>;

/// External one-shot YUV→JPEG encoder.
pub trait JpegEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Vec<u8>>;
}

/// Bounded ring of encoded frames with drop-old semantics: pushing into a
/// full ring evicts the oldest entry first. This is the only intentional
/// lossy boundary on the encoded side.
pub struct FrameRing {
    frames: Mutex<std::collections::VecDeque<Arc<EncodedFrame>>>,
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(std::collections::VecDeque::with_capacity(FRAME_RING_CAPACITY)),
        }
    }

    pub fn push(&self, frame: Arc<EncodedFrame>) {
        let mut frames = self.frames.lock();
        if frames.len() == FRAME_RING_CAPACITY {
            frames.pop_front();
            tracing::trace!("encoded frame dropped (ring full)");
        }
        frames.push_back(frame);
    }

    /// Non-blocking dequeue.
    pub fn pop(&self) -> Option<Arc<EncodedFrame>> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest SPS/PPS surfaced by a camera's encoder.
#[derive(Default)]
struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

struct Pipeline {
    encoder: Arc<Mutex<Box<dyn H264Encoder>>>,
    subscribers: Arc<Mutex<HashMap<String, Arc<FrameRing>>>>,
    parameters: Arc<Mutex<ParameterSets>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

/// Per-camera encoder lifecycle manager.
///
/// Encoders start lazily on the first H.264 PLAY and are stopped by the
/// supervisor when no playing client remains. Stopping clears the SPS/PPS
/// cache so a fresh client re-anchors cleanly.
pub struct EncoderSet {
    bus: Arc<FrameBus>,
    factory: H264EncoderFactory,
    pipelines: [Mutex<Option<Pipeline>>; CAMERA_COUNT],
}

impl EncoderSet {
    pub fn new(bus: Arc<FrameBus>, factory: H264EncoderFactory) -> Self {
        Self {
            bus,
            factory,
            pipelines: [Mutex::new(None), Mutex::new(None)],
        }
    }

    /// Start the camera's encoder pipeline if it is not already running.
    pub fn ensure_running(&self, camera: CameraId, settings: EncoderSettings) -> Result<()> {
        let mut slot = self.pipelines[camera.index()].lock();
        if slot.is_some() {
            return Ok(());
        }

        let mut encoder = (self.factory)(camera)?;
        encoder.configure(&settings)?;

        let pipeline = Pipeline {
            encoder: Arc::new(Mutex::new(encoder)),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            parameters: Arc::new(Mutex::new(ParameterSets::default())),
            stop: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        };

        let worker = EncodeWorker {
            camera,
            bus: self.bus.clone(),
            encoder: pipeline.encoder.clone(),
            subscribers: pipeline.subscribers.clone(),
            parameters: pipeline.parameters.clone(),
            stop: pipeline.stop.clone(),
            failed: pipeline.failed.clone(),
            settings,
        };
        thread::Builder::new()
            .name(format!("encode-{camera}"))
            .spawn(move || worker.run())
            .map_err(crate::error::ServerError::Io)?;

        tracing::info!(%camera, width = settings.width, height = settings.height,
            bitrate = settings.bitrate, "H.264 encoder started");
        *slot = Some(pipeline);
        Ok(())
    }

    /// Stop the camera's encoder and clear its parameter-set cache.
    pub fn stop(&self, camera: CameraId) {
        if let Some(pipeline) = self.pipelines[camera.index()].lock().take() {
            pipeline.stop.store(true, Ordering::SeqCst);
            tracing::info!(%camera, "H.264 encoder stopped");
        }
    }

    pub fn is_running(&self, camera: CameraId) -> bool {
        self.pipelines[camera.index()].lock().is_some()
    }

    /// Whether the camera's pipeline gave up after repeated encode errors.
    pub fn is_failed(&self, camera: CameraId) -> bool {
        self.pipelines[camera.index()]
            .lock()
            .as_ref()
            .is_some_and(|p| p.failed.load(Ordering::SeqCst))
    }

    /// Register a client ring that will receive every encoded frame.
    /// The encoder is asked for a keyframe so the new client can join
    /// the stream without waiting out the GOP.
    pub fn subscribe(&self, camera: CameraId, session_id: &str) -> Option<Arc<FrameRing>> {
        let slot = self.pipelines[camera.index()].lock();
        let pipeline = slot.as_ref()?;
        let ring = Arc::new(FrameRing::new());
        pipeline
            .subscribers
            .lock()
            .insert(session_id.to_string(), ring.clone());
        pipeline.encoder.lock().force_keyframe();
        Some(ring)
    }

    pub fn unsubscribe(&self, camera: CameraId, session_id: &str) {
        if let Some(pipeline) = self.pipelines[camera.index()].lock().as_ref() {
            pipeline.subscribers.lock().remove(session_id);
        }
    }

    /// Latest SPS and PPS seen from the camera's encoder.
    pub fn parameter_sets(&self, camera: CameraId) -> Option<(Bytes, Bytes)> {
        let slot = self.pipelines[camera.index()].lock();
        let params = slot.as_ref()?.parameters.lock();
        match (&params.sps, &params.pps) {
            (Some(sps), Some(pps)) => Some((sps.clone(), pps.clone())),
            _ => None,
        }
    }

    /// Push a new target bitrate into the camera's encoder.
    pub fn set_bitrate(&self, camera: CameraId, bps: u32) {
        if let Some(pipeline) = self.pipelines[camera.index()].lock().as_ref() {
            pipeline.encoder.lock().set_bitrate(bps);
            tracing::debug!(%camera, bps, "encoder bitrate updated");
        }
    }
}

struct EncodeWorker {
    camera: CameraId,
    bus: Arc<FrameBus>,
    encoder: Arc<Mutex<Box<dyn H264Encoder>>>,
    subscribers: Arc<Mutex<HashMap<String, Arc<FrameRing>>>>,
    parameters: Arc<Mutex<ParameterSets>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    settings: EncoderSettings,
}

impl EncodeWorker {
    fn run(mut self) {
        let mut last_pts: Option<u64> = None;
        let mut consecutive_errors: u32 = 0;

        while !self.stop.load(Ordering::SeqCst) {
            let Some(frame) = self.bus.latest(self.camera) else {
                thread::sleep(ENCODE_POLL);
                continue;
            };
            if last_pts == Some(frame.pts_ns) {
                thread::sleep(ENCODE_POLL);
                continue;
            }
            last_pts = Some(frame.pts_ns);

            if frame.width != self.settings.width || frame.height != self.settings.height {
                // One reconfigure per dimension change; the encoder resets
                // its stream context and re-emits parameter sets.
                self.settings.width = frame.width;
                self.settings.height = frame.height;
                tracing::warn!(camera = %self.camera, width = frame.width,
                    height = frame.height, "frame dimensions changed, reconfiguring encoder");
                if let Err(e) = self.encoder.lock().configure(&self.settings) {
                    tracing::error!(camera = %self.camera, error = %e, "encoder reconfigure failed");
                    consecutive_errors += 1;
                    if self.fail_check(consecutive_errors) {
                        return;
                    }
                    continue;
                }
            }

            match self.encoder.lock().encode(&frame) {
                Ok(Some(encoded)) => {
                    consecutive_errors = 0;
                    self.cache_parameters(&encoded);
                    let encoded = Arc::new(encoded);
                    let subscribers = self.subscribers.lock();
                    for ring in subscribers.values() {
                        ring.push(encoded.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(camera = %self.camera, error = %e, "encode failed");
                    consecutive_errors += 1;
                    if self.fail_check(consecutive_errors) {
                        return;
                    }
                }
            }
        }
        tracing::debug!(camera = %self.camera, "encoder worker exited");
    }

    fn cache_parameters(&self, encoded: &EncodedFrame) {
        if encoded.sps.is_none() && encoded.pps.is_none() {
            return;
        }
        let mut params = self.parameters.lock();
        if let Some(sps) = &encoded.sps {
            params.sps = Some(sps.clone());
        }
        if let Some(pps) = &encoded.pps {
            params.pps = Some(pps.clone());
        }
    }

    fn fail_check(&self, consecutive_errors: u32) -> bool {
        if consecutive_errors >= ENCODE_FAILURE_LIMIT {
            tracing::error!(camera = %self.camera, "encoder failed repeatedly, giving up");
            self.failed.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

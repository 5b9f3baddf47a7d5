//! Raw frame types and the per-camera frame bus.
//!
//! The bus is a single-slot overwrite-on-write hand-off: the camera
//! producer swaps in the newest frame, readers snapshot the latest and
//! never see a queue. Readers never block the writer beyond the pointer
//! swap.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use bytes::Bytes;
use parking_lot::Mutex;

/// Number of cameras the server multiplexes.
pub const CAMERA_COUNT: usize = 2;

/// Camera identifier. Index 0 is the back camera, index 1 the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraId {
    Back,
    Front,
}

impl CameraId {
    pub const ALL: [CameraId; CAMERA_COUNT] = [CameraId::Back, CameraId::Front];

    pub fn index(self) -> usize {
        match self {
            CameraId::Back => 0,
            CameraId::Front => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(CameraId::Back),
            1 => Some(CameraId::Front),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CameraId::Back => "back",
            CameraId::Front => "front",
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel layout of a raw camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (I420).
    I420,
    /// Semi-planar YUV 4:2:0 (NV21, common on embedded camera stacks).
    Nv21,
    /// Packed 24-bit RGB.
    Rgb24,
}

/// One uncompressed frame as produced by a camera driver.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in nanoseconds, monotonic per camera.
    pub pts_ns: u64,
    pub format: PixelFormat,
    pub camera: CameraId,
}

/// Resolutions consulted by [`infer_dimensions`] as a last resort.
const COMMON_RESOLUTIONS: [(u32, u32); 8] = [
    (320, 240),
    (640, 480),
    (800, 600),
    (1024, 768),
    (1280, 720),
    (1280, 960),
    (1920, 1080),
    (2560, 1440),
];

/// Back-compute frame dimensions from a buffer length.
///
/// Authoritative metadata from the capture source always wins; an
/// explicit configured resolution is the fallback. This heuristic is the
/// last resort and logs prominently when it fires.
pub fn infer_dimensions(len: usize, format: PixelFormat) -> Option<(u32, u32)> {
    let bytes_per_pixel_x2 = match format {
        PixelFormat::I420 | PixelFormat::Nv21 => 3, // 1.5 bytes/pixel
        PixelFormat::Rgb24 => 6,
    };
    for (w, h) in COMMON_RESOLUTIONS {
        if (w as usize) * (h as usize) * bytes_per_pixel_x2 == len * 2 {
            tracing::warn!(
                len,
                width = w,
                height = h,
                ?format,
                "frame dimensions inferred from buffer length; capture metadata missing"
            );
            return Some((w, h));
        }
    }
    None
}

/// A fault reported by a camera driver, drained by the supervisor.
#[derive(Debug, Clone)]
pub struct CameraFault {
    pub camera: CameraId,
    pub message: String,
}

/// Handle given to a camera driver for delivering frames and faults.
#[derive(Clone)]
pub struct FrameSink {
    bus: Arc<FrameBus>,
    camera: CameraId,
    faults: Sender<CameraFault>,
}

impl FrameSink {
    pub fn new(bus: Arc<FrameBus>, camera: CameraId, faults: Sender<CameraFault>) -> Self {
        Self { bus, camera, faults }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Publish the newest frame, replacing any unread predecessor.
    pub fn publish(&self, frame: RawFrame) {
        self.bus.publish(frame);
    }

    /// Report a capture fault. The supervisor logs it and may restart the
    /// camera on its next tick.
    pub fn report_fault(&self, message: impl Into<String>) {
        let fault = CameraFault {
            camera: self.camera,
            message: message.into(),
        };
        // Receiver gone means the server is shutting down.
        let _ = self.faults.send(fault);
    }
}

/// Single-writer broadcast of the latest raw frame per camera.
pub struct FrameBus {
    slots: [Mutex<Option<Arc<RawFrame>>>; CAMERA_COUNT],
}

impl FrameBus {
    pub fn new() -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None)],
        }
    }

    /// Overwrite the latest frame for the frame's camera.
    pub fn publish(&self, frame: RawFrame) {
        let camera = frame.camera;
        *self.slots[camera.index()].lock() = Some(Arc::new(frame));
    }

    /// Snapshot the most recent frame, if any. Never blocks the writer
    /// beyond the slot swap.
    pub fn latest(&self, camera: CameraId) -> Option<Arc<RawFrame>> {
        self.slots[camera.index()].lock().clone()
    }

    /// Drop the cached frame for a camera (called when capture stops so a
    /// restarted consumer does not see a stale image).
    pub fn clear(&self, camera: CameraId) {
        *self.slots[camera.index()].lock() = None;
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

/// External camera capture driver.
///
/// The OS capture stack is an external collaborator: the server only
/// starts and stops it and consumes frames through the [`FrameSink`].
pub trait CameraDriver: Send + Sync {
    /// Begin capture on `camera`, delivering frames into `sink` until
    /// [`stop`](Self::stop) is called.
    fn start(&self, camera: CameraId, sink: FrameSink) -> crate::error::Result<()>;

    /// Stop capture on `camera`. Must be idempotent.
    fn stop(&self, camera: CameraId);
}

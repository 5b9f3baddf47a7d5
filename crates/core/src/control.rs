//! Typed camera control bus.
//!
//! Both the host surface (CLI) and the MJPEG HTTP server steer cameras
//! through this channel instead of reaching into the capture layer. The
//! server owns the single consumer; anything holding a [`ControlBus`]
//! clone can submit commands. No process-wide singletons.

use std::sync::mpsc::{Receiver, Sender, channel};

use crate::frame::CameraId;

/// Commands accepted by the server's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    StartCamera(CameraId),
    StopCamera(CameraId),
    StartMjpegServer,
    StopMjpegServer,
    /// Flips the camera enablement flags. Reserved; no behavior beyond
    /// the flip.
    SwitchCamera,
}

/// Cloneable submission handle for [`CameraCommand`]s.
#[derive(Clone)]
pub struct ControlBus {
    tx: Sender<CameraCommand>,
}

impl ControlBus {
    /// Create the bus, returning the handle and the server-owned consumer.
    pub fn new() -> (Self, Receiver<CameraCommand>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    /// Submit a command. A closed receiver means the server already shut
    /// down, which submitters treat as a no-op.
    pub fn send(&self, command: CameraCommand) {
        tracing::debug!(?command, "control command submitted");
        let _ = self.tx.send(command);
    }
}

//! Camera activation and enablement.
//!
//! The rig is the single owner of capture start/stop. Demand flows in
//! from PLAY handling, the MJPEG server, and the control bus; the
//! supervisor reconciles actual state against demand every tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use parking_lot::Mutex;

use crate::error::Result;
use crate::frame::{CAMERA_COUNT, CameraDriver, CameraFault, CameraId, FrameBus, FrameSink};

pub struct CameraRig {
    driver: Arc<dyn CameraDriver>,
    bus: Arc<FrameBus>,
    enabled: [AtomicBool; CAMERA_COUNT],
    /// Serializes start/stop per camera; true while capture is active.
    running: [Mutex<bool>; CAMERA_COUNT],
    faults: Sender<CameraFault>,
}

impl CameraRig {
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        bus: Arc<FrameBus>,
        back_enabled: bool,
        front_enabled: bool,
        faults: Sender<CameraFault>,
    ) -> Self {
        Self {
            driver,
            bus,
            enabled: [AtomicBool::new(back_enabled), AtomicBool::new(front_enabled)],
            running: [Mutex::new(false), Mutex::new(false)],
            faults,
        }
    }

    pub fn is_enabled(&self, camera: CameraId) -> bool {
        self.enabled[camera.index()].load(Ordering::SeqCst)
    }

    pub fn is_running(&self, camera: CameraId) -> bool {
        *self.running[camera.index()].lock()
    }

    /// Flip both enablement flags (SWITCH_CAMERA).
    pub fn switch_enabled(&self) {
        for camera in CameraId::ALL {
            let flag = &self.enabled[camera.index()];
            let now = !flag.load(Ordering::SeqCst);
            flag.store(now, Ordering::SeqCst);
            tracing::info!(%camera, enabled = now, "camera enablement flipped");
        }
    }

    /// Start capture if it is not already running. Disabled cameras are
    /// refused.
    pub fn ensure_started(&self, camera: CameraId) -> Result<()> {
        if !self.is_enabled(camera) {
            return Err(crate::error::ServerError::CameraDisabled(camera.name()));
        }
        let mut running = self.running[camera.index()].lock();
        if *running {
            return Ok(());
        }
        let sink = FrameSink::new(self.bus.clone(), camera, self.faults.clone());
        self.driver.start(camera, sink)?;
        *running = true;
        tracing::info!(%camera, "camera capture started");
        Ok(())
    }

    /// Stop capture and drop the cached frame. Idempotent.
    pub fn stop(&self, camera: CameraId) {
        let mut running = self.running[camera.index()].lock();
        if *running {
            self.driver.stop(camera);
            *running = false;
            self.bus.clear(camera);
            tracing::info!(%camera, "camera capture stopped");
        }
    }

    pub fn stop_all(&self) {
        for camera in CameraId::ALL {
            self.stop(camera);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Default)]
    struct CountingDriver {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CameraDriver for CountingDriver {
        fn start(&self, _camera: CameraId, _sink: FrameSink) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self, _camera: CameraId) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rig(driver: Arc<CountingDriver>) -> CameraRig {
        let (tx, _rx) = mpsc::channel();
        CameraRig::new(driver, Arc::new(FrameBus::new()), true, true, tx)
    }

    #[test]
    fn start_is_idempotent() {
        let driver = Arc::new(CountingDriver::default());
        let rig = rig(driver.clone());
        rig.ensure_started(CameraId::Back).unwrap();
        rig.ensure_started(CameraId::Back).unwrap();
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
        assert!(rig.is_running(CameraId::Back));
        assert!(!rig.is_running(CameraId::Front));
    }

    #[test]
    fn stop_is_idempotent() {
        let driver = Arc::new(CountingDriver::default());
        let rig = rig(driver.clone());
        rig.ensure_started(CameraId::Back).unwrap();
        rig.stop(CameraId::Back);
        rig.stop(CameraId::Back);
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
        assert!(!rig.is_running(CameraId::Back));
    }

    #[test]
    fn disabled_camera_refused() {
        let driver = Arc::new(CountingDriver::default());
        let (tx, _rx) = mpsc::channel();
        let rig = CameraRig::new(driver, Arc::new(FrameBus::new()), true, false, tx);
        assert!(rig.ensure_started(CameraId::Front).is_err());
        assert!(rig.ensure_started(CameraId::Back).is_ok());
    }

    #[test]
    fn switch_flips_enablement() {
        let driver = Arc::new(CountingDriver::default());
        let (tx, _rx) = mpsc::channel();
        let rig = CameraRig::new(driver, Arc::new(FrameBus::new()), true, false, tx);
        rig.switch_enabled();
        assert!(!rig.is_enabled(CameraId::Back));
        assert!(rig.is_enabled(CameraId::Front));
    }
}

//! Watchdog: session pruning, client-set notifications, camera and
//! encoder lifecycle reconciliation.
//!
//! Every tick (5 s) the supervisor:
//!
//! 1. Drains camera faults and retries capture where demand remains.
//! 2. Reaps sessions that are torn down, lost their control connection,
//!    or turned unhealthy; their UDP ports return to the allocator.
//! 3. Notifies registered subscribers when the client set changed.
//! 4. Stops encoders with no PLAYing H.264 client, and stops cameras no
//!    RTSP or MJPEG client is consuming.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::frame::{CameraFault, CameraId};
use crate::server::ServerCore;
use crate::session::Codec;

/// Watchdog tick interval.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Event sent to subscribers when the session set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientsChanged {
    pub active_sessions: usize,
}

/// Registry of client-set-change subscribers. Registration and
/// unregistration are deterministic: a subscriber stays until its token
/// is unsubscribed or its receiver drops.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<u64, Sender<ClientsChanged>>>,
    next_token: AtomicU64,
}

impl Notifier {
    pub fn subscribe(&self) -> (u64, Receiver<ClientsChanged>) {
        let (tx, rx) = channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().insert(token, tx);
        (token, rx)
    }

    pub fn unsubscribe(&self, token: u64) {
        self.subscribers.lock().remove(&token);
    }

    pub fn notify(&self, event: ClientsChanged) {
        // Dead receivers are pruned as they surface.
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(event).is_ok());
    }
}

/// Spawn the watchdog thread.
pub fn spawn(
    core: Arc<ServerCore>,
    faults: Receiver<CameraFault>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || {
            let mut last_count = core.sessions.len();
            while !core.shutdown.load(Ordering::SeqCst) {
                // Sleep in short slices so shutdown stays prompt.
                let mut slept = Duration::ZERO;
                while slept < WATCHDOG_INTERVAL && !core.shutdown.load(Ordering::SeqCst) {
                    let slice = Duration::from_millis(250);
                    thread::sleep(slice);
                    slept += slice;
                }
                if core.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tick(&core, &faults, &mut last_count);
            }
            tracing::debug!("supervisor exited");
        })
}

/// One watchdog pass. Public for direct invocation from tests.
pub fn tick(core: &Arc<ServerCore>, faults: &Receiver<CameraFault>, last_count: &mut usize) {
    let faulted = drain_faults(faults);
    prune_sessions(core);
    reconcile(core, &faulted);

    let count = core.sessions.len();
    if count != *last_count {
        *last_count = count;
        core.notifier.notify(ClientsChanged {
            active_sessions: count,
        });
    }
}

fn drain_faults(faults: &Receiver<CameraFault>) -> Vec<CameraId> {
    let mut faulted = Vec::new();
    while let Ok(fault) = faults.try_recv() {
        tracing::error!(camera = %fault.camera, message = %fault.message, "camera fault");
        if !faulted.contains(&fault.camera) {
            faulted.push(fault.camera);
        }
    }
    faulted
}

fn prune_sessions(core: &Arc<ServerCore>) {
    for session in core.sessions.all() {
        if session.should_reap() {
            tracing::info!(
                session_id = %session.id,
                torn_down = session.is_torn_down(),
                connection_open = session.connection_open(),
                "pruning dead session"
            );
            core.release_session(&session);
        }
    }
}

/// Reconcile camera + encoder activation against demand.
fn reconcile(core: &Arc<ServerCore>, faulted: &[CameraId]) {
    for camera in CameraId::ALL {
        let rtsp_playing = !core.sessions.playing_on(camera, None).is_empty();
        let h264_playing = !core.sessions.playing_on(camera, Some(Codec::H264)).is_empty();
        let mjpeg_clients = core.mjpeg_client_count(camera);
        let demand = rtsp_playing || mjpeg_clients > 0;

        // Encoder runs only while an H.264 client plays. Stopping clears
        // the SPS/PPS caches so a fresh client re-anchors cleanly.
        if !h264_playing && core.encoders.is_running(camera) {
            core.encoders.stop(camera);
        }

        if !demand {
            if core.cameras.is_running(camera) {
                core.cameras.stop(camera);
            }
            continue;
        }

        // Restart after a fault, or pick up demand that arrived through
        // a path that could not start the camera itself.
        let needs_start = !core.cameras.is_running(camera) || faulted.contains(&camera);
        if needs_start {
            if faulted.contains(&camera) {
                core.cameras.stop(camera);
            }
            if let Err(e) = core.cameras.ensure_started(camera) {
                tracing::error!(%camera, error = %e, "camera restart failed");
            }
        }
    }
}

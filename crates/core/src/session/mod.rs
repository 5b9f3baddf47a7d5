//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is created during SETUP and destroyed by TEARDOWN, by the
//! supervisor when it turns unhealthy, or when its control connection
//! drops. It owns the per-client RTP state (sequence, timestamp anchor,
//! SSRC, parameter-set cache), traffic counters, the negotiated
//! transport, and the health signals the watchdog reads.
//!
//! ## Lifecycle
//!
//! ```text
//! SETUP          -> registered (not playing)
//! PLAY           -> playing, StreamLoop running
//! TEARDOWN       -> torn down; supervisor reaps within one tick
//! TCP disconnect -> connection_open false; supervisor reaps
//! ≥3 send errors / >10 s silence while playing -> unhealthy; reaped
//! ```

pub mod transport;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::VideoProfile;
use crate::error::{Result, ServerError};
use crate::frame::CameraId;
use crate::media::rtp::RtpState;
pub use transport::{TransportBinding, TransportSpec};

/// Consecutive send errors after which a session is unhealthy.
pub const SEND_ERROR_LIMIT: u32 = 3;

/// Playing sessions silent for longer than this are unhealthy.
pub const INACTIVITY_LIMIT: Duration = Duration::from_secs(10);

/// Negotiated video codec for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Mjpeg,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Codec::H264 => "H264",
            Codec::Mjpeg => "MJPEG",
        })
    }
}

/// Cumulative traffic counters, read by the RTCP sender-report builder.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets: u64,
    pub octets: u64,
    pub frames: u64,
    pub last_sender_report: Option<Instant>,
}

/// One RTSP client session.
///
/// The mutable RTP state sits behind a dedicated mutex advanced only by
/// the session's StreamLoop, so the lock is rarely contended; counters
/// and profile have their own small locks; health flags are atomics.
pub struct Session {
    /// Server-allocated 16-lowercase-hex identifier.
    pub id: String,
    pub camera: CameraId,
    pub codec: Codec,
    pub uri: String,

    playing: AtomicBool,
    torn_down: AtomicBool,
    unhealthy: AtomicBool,
    /// Cleared by the connection reader when the control socket closes.
    connection_open: Arc<AtomicBool>,
    send_errors: AtomicU32,

    pub transport: RwLock<Option<TransportBinding>>,
    pub rtp: Mutex<RtpState>,
    pub counters: Mutex<Counters>,
    pub profile: Mutex<VideoProfile>,
    last_activity: Mutex<Instant>,
    pub last_rate_raise: Mutex<Instant>,
}

impl Session {
    pub fn new(
        id: String,
        camera: CameraId,
        codec: Codec,
        uri: &str,
        profile: VideoProfile,
        connection_open: Arc<AtomicBool>,
    ) -> Self {
        Session {
            id,
            camera,
            codec,
            uri: uri.to_string(),
            playing: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            unhealthy: AtomicBool::new(false),
            connection_open,
            send_errors: AtomicU32::new(0),
            transport: RwLock::new(None),
            rtp: Mutex::new(RtpState::seeded()),
            counters: Mutex::new(Counters::default()),
            profile: Mutex::new(profile),
            last_activity: Mutex::new(Instant::now()),
            last_rate_raise: Mutex::new(Instant::now()),
        }
    }

    pub fn set_transport(&self, binding: TransportBinding) {
        tracing::debug!(session_id = %self.id, transport = %binding.describe(), "transport configured");
        *self.transport.write() = Some(binding);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Transition into PLAY: reseed sequence/timestamp and raise the flag.
    pub fn start_playing(&self) {
        if !self.playing.swap(true, Ordering::SeqCst) {
            self.rtp.lock().reseed();
            self.touch();
            tracing::info!(session_id = %self.id, codec = %self.codec, camera = %self.camera,
                "session playing");
        }
    }

    /// Lower the playing flag; the StreamLoop observes and exits.
    pub fn stop_playing(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    /// TEARDOWN: stop delivery and flag for supervisor cleanup.
    pub fn tear_down(&self) {
        self.stop_playing();
        self.torn_down.store(true, Ordering::SeqCst);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn connection_open(&self) -> bool {
        self.connection_open.load(Ordering::SeqCst)
    }

    /// Record successful delivery of `packets` totaling `octets` bytes.
    pub fn record_send(&self, packets: u64, octets: u64) {
        let mut counters = self.counters.lock();
        counters.packets += packets;
        counters.octets += octets;
        counters.frames += 1;
        drop(counters);
        self.send_errors.store(0, Ordering::SeqCst);
        self.touch();
    }

    /// Count one failed send; returns the consecutive error total.
    pub fn record_send_error(&self) -> u32 {
        self.send_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_send_errors(&self) -> u32 {
        self.send_errors.load(Ordering::SeqCst)
    }

    /// Note activity (RTSP request, RTCP receipt, successful send).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Mark the session beyond recovery; the supervisor reaps it.
    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
        self.stop_playing();
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
            || self.consecutive_send_errors() >= SEND_ERROR_LIMIT
            || (self.is_playing() && self.idle_for() > INACTIVITY_LIMIT)
    }

    /// Whether the supervisor should remove this session.
    pub fn should_reap(&self) -> bool {
        self.is_torn_down() || !self.connection_open() || self.is_unhealthy()
    }

    /// `Session` response header value (RFC 2326 §12.37).
    pub fn session_header_value(&self) -> String {
        format!("{};timeout=60", self.id)
    }
}

/// Generate a random 16-lowercase-hex session identifier.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::RngExt::fill(&mut rand::rng(), &mut bytes[..]);
    hex::encode(bytes)
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock`; lookups happen on every watchdog
/// tick and RTCP arrival, so read performance matters.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id.clone();
        self.sessions.write().insert(id.clone(), session);
        let total = self.sessions.read().len();
        tracing::debug!(session_id = %id, total_sessions = total, "session registered");
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Sessions currently playing from `camera`, optionally filtered by
    /// codec.
    pub fn playing_on(&self, camera: CameraId, codec: Option<Codec>) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| {
                s.is_playing() && s.camera == camera && codec.is_none_or(|c| s.codec == c)
            })
            .cloned()
            .collect()
    }
}

const PORT_BASE: u16 = 5000;
const PORT_LIMIT: u16 = 65000;

struct PortCursor {
    next: u16,
    used: HashSet<u16>,
}

/// Server-side UDP port pair allocator.
///
/// A monotone cursor starts at 5000, steps by 2, and wraps at 65000.
/// Allocation hands out the next free even port, reserving even+odd;
/// release returns the pair. No two active sessions share a pair.
pub struct PortAllocator {
    inner: Mutex<PortCursor>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::starting_at(PORT_BASE)
    }

    fn starting_at(next: u16) -> Self {
        Self {
            inner: Mutex::new(PortCursor {
                next,
                used: HashSet::new(),
            }),
        }
    }

    /// Allocate an (RTP, RTCP) = (even, even+1) port pair.
    pub fn allocate(&self) -> Result<(u16, u16)> {
        let mut inner = self.inner.lock();
        let span = ((PORT_LIMIT - PORT_BASE) / 2) as usize;
        for _ in 0..span {
            let rtp = inner.next;
            inner.next = if rtp + 2 >= PORT_LIMIT { PORT_BASE } else { rtp + 2 };
            if inner.used.insert(rtp) {
                tracing::trace!(rtp_port = rtp, rtcp_port = rtp + 1, "allocated server ports");
                return Ok((rtp, rtp + 1));
            }
        }
        tracing::error!("UDP port range exhausted");
        Err(ServerError::PortRangeExhausted)
    }

    /// Return a pair to the pool, keyed by its RTP (even) port.
    pub fn release(&self, rtp_port: u16) {
        self.inner.lock().used.remove(&rtp_port);
    }

    #[cfg(test)]
    fn with_cursor(next: u16) -> Self {
        Self::starting_at(next)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, camera: CameraId, codec: Codec) -> Arc<Session> {
        Arc::new(Session::new(
            id.to_string(),
            camera,
            codec,
            "rtsp://h/live",
            VideoProfile::default(),
            Arc::new(AtomicBool::new(true)),
        ))
    }

    #[test]
    fn session_id_format() {
        let id = new_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(new_session_id(), id);
    }

    #[test]
    fn lifecycle_flags() {
        let s = session("a", CameraId::Back, Codec::H264);
        assert!(!s.is_playing());
        s.start_playing();
        assert!(s.is_playing());
        s.tear_down();
        assert!(!s.is_playing());
        assert!(s.is_torn_down());
        assert!(s.should_reap());
    }

    #[test]
    fn play_reseeds_rtp_state() {
        let s = session("a", CameraId::Back, Codec::H264);
        s.rtp.lock().sps_sent = Some(bytes::Bytes::from_static(&[0x67]));
        let ssrc = s.rtp.lock().ssrc;
        s.start_playing();
        assert_eq!(s.rtp.lock().ssrc, ssrc, "SSRC constant for the session");
        assert!(s.rtp.lock().sps_sent.is_none());
    }

    #[test]
    fn send_errors_mark_unhealthy() {
        let s = session("a", CameraId::Back, Codec::H264);
        assert!(!s.is_unhealthy());
        for _ in 0..SEND_ERROR_LIMIT {
            s.record_send_error();
        }
        assert!(s.is_unhealthy());
        // Success resets the streak.
        s.record_send(1, 100);
        assert!(!s.is_unhealthy());
    }

    #[test]
    fn closed_connection_reaps() {
        let open = Arc::new(AtomicBool::new(true));
        let s = Arc::new(Session::new(
            "a".into(),
            CameraId::Back,
            Codec::H264,
            "rtsp://h/live",
            VideoProfile::default(),
            open.clone(),
        ));
        assert!(!s.should_reap());
        open.store(false, Ordering::SeqCst);
        assert!(s.should_reap());
    }

    #[test]
    fn counters_accumulate() {
        let s = session("a", CameraId::Back, Codec::H264);
        s.record_send(3, 4000);
        s.record_send(2, 1000);
        let counters = s.counters.lock();
        assert_eq!(counters.packets, 5);
        assert_eq!(counters.octets, 5000);
        assert_eq!(counters.frames, 2);
    }

    #[test]
    fn manager_queries() {
        let manager = SessionManager::new();
        let a = session("a", CameraId::Back, Codec::H264);
        let b = session("b", CameraId::Back, Codec::Mjpeg);
        let c = session("c", CameraId::Front, Codec::H264);
        manager.insert(a.clone());
        manager.insert(b.clone());
        manager.insert(c);
        a.start_playing();
        b.start_playing();

        assert_eq!(manager.len(), 3);
        assert_eq!(manager.playing_on(CameraId::Back, None).len(), 2);
        assert_eq!(manager.playing_on(CameraId::Back, Some(Codec::H264)).len(), 1);
        assert!(manager.playing_on(CameraId::Front, None).is_empty());

        assert!(manager.remove("a").is_some());
        assert!(manager.remove("a").is_none());
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn ports_allocate_even_odd_pairs() {
        let ports = PortAllocator::new();
        let (rtp, rtcp) = ports.allocate().unwrap();
        assert_eq!(rtp, 5000);
        assert_eq!(rtcp, 5001);
        assert_eq!(rtp % 2, 0);
        let (rtp2, _) = ports.allocate().unwrap();
        assert_eq!(rtp2, 5002);
    }

    #[test]
    fn ports_release_and_reuse() {
        let ports = PortAllocator::new();
        let (rtp, _) = ports.allocate().unwrap();
        let (rtp2, _) = ports.allocate().unwrap();
        ports.release(rtp);
        ports.release(rtp2);
        // Cursor keeps moving; released ports come back once it wraps.
        let (rtp3, _) = ports.allocate().unwrap();
        assert_eq!(rtp3, 5004);
    }

    #[test]
    fn ports_wrap_at_limit() {
        let ports = PortAllocator::with_cursor(64_998);
        let (rtp, rtcp) = ports.allocate().unwrap();
        assert_eq!((rtp, rtcp), (64_998, 64_999));
        let (rtp, rtcp) = ports.allocate().unwrap();
        assert_eq!((rtp, rtcp), (5000, 5001));
    }

    #[test]
    fn ports_skip_in_use_after_wrap() {
        let ports = PortAllocator::with_cursor(64_998);
        let first = ports.allocate().unwrap();
        let second = ports.allocate().unwrap(); // wrapped to 5000
        let third = ports.allocate().unwrap();
        assert_eq!(first.0, 64_998);
        assert_eq!(second.0, 5000);
        assert_eq!(third.0, 5002);
    }
}

//! Server configuration.
//!
//! All knobs exposed by the host surface live here. Every field has a
//! serde default so a partial TOML file (or an empty one) yields a
//! runnable configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default RTSP listening port.
pub const DEFAULT_RTSP_PORT: u16 = 7778;
/// Default MJPEG HTTP listening port.
pub const DEFAULT_MJPEG_PORT: u16 = 8089;

/// Quality clamp bounds applied by [`VideoProfile::set_quality`].
pub const QUALITY_MIN: u8 = 10;
pub const QUALITY_MAX: u8 = 100;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// RTSP listening port.
    pub port: u16,
    /// Address both listeners bind to.
    pub bind_address: String,
    /// Maximum simultaneous RTSP client connections.
    pub max_clients: usize,
    /// Username → password map. Empty map seeds the default user.
    pub users: HashMap<String, String>,
    /// When false, every request passes without credentials. Disabling
    /// authentication must be explicit.
    pub auth_required: bool,
    /// Front camera (index 1) availability.
    pub front_camera_enabled: bool,
    /// Back camera (index 0) availability.
    pub back_camera_enabled: bool,
    /// MJPEG HTTP server port.
    pub mjpeg_server_port: u16,
    /// JPEG quality used by the MJPEG HTTP endpoint.
    pub mjpeg_server_quality: u8,
    /// Serve the MJPEG endpoint over HTTPS.
    pub use_https: bool,
    /// PEM file with certificate chain and private key.
    pub certificate_path: Option<PathBuf>,
    /// Retained for hosts with encrypted certificate stores; PEM keys are
    /// expected unencrypted and a set password only produces a warning.
    pub certificate_password: Option<String>,
    /// Profile used for the back camera.
    pub primary_profile: VideoProfile,
    /// Profile used for the front camera.
    pub secondary_profile: VideoProfile,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RTSP_PORT,
            bind_address: "0.0.0.0".to_string(),
            max_clients: 100,
            users: HashMap::new(),
            auth_required: true,
            front_camera_enabled: true,
            back_camera_enabled: true,
            mjpeg_server_port: DEFAULT_MJPEG_PORT,
            mjpeg_server_quality: 80,
            use_https: false,
            certificate_path: None,
            certificate_password: None,
            primary_profile: VideoProfile::named("primary"),
            secondary_profile: VideoProfile::named("secondary"),
        }
    }
}

/// Encoding profile for one camera.
///
/// `bitrate` and `quality` are the *current* targets and move at runtime
/// under RTCP feedback; `min_bitrate`/`max_bitrate` bound that movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub bitrate: u32,
    pub quality: u8,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 640,
            height: 480,
            frame_rate: 30,
            min_bitrate: 500_000,
            max_bitrate: 4_000_000,
            bitrate: 2_000_000,
            quality: 80,
        }
    }
}

impl VideoProfile {
    pub fn named(name: &str) -> Self {
        let mut profile = Self::default();
        profile.set_name(Some(name));
        profile
    }

    /// Set the profile name, removing spaces and slashes. An empty or
    /// absent name keeps the previous one.
    pub fn set_name(&mut self, name: Option<&str>) {
        let Some(name) = name else { return };
        let cleaned: String = name.chars().filter(|c| *c != ' ' && *c != '/').collect();
        if !cleaned.is_empty() {
            self.name = cleaned;
        }
    }

    /// Set the JPEG/encoder quality, clamped to `[10, 100]`. Accepts a
    /// signed value so out-of-range host input (including negatives)
    /// clamps instead of wrapping.
    pub fn set_quality(&mut self, quality: i32) {
        self.quality = quality.clamp(QUALITY_MIN as i32, QUALITY_MAX as i32) as u8;
    }

    /// Set the target bitrate, clamped into `[min_bitrate, max_bitrate]`.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate.clamp(self.min_bitrate, self.max_bitrate);
    }
}

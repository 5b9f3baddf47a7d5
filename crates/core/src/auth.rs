//! Authentication: user store, nonce lifecycle, Basic and Digest (MD5).
//!
//! Both schemes are accepted on the same endpoint. Challenges advertise
//! Digest (RFC 7616, MD5 with or without `qop=auth`); Basic credentials
//! are still honored when a client offers them. All secret comparisons
//! are constant-time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use md5::{Digest as _, Md5};
use parking_lot::{Mutex, RwLock};
use rand::RngExt;

/// Realm advertised in every challenge.
pub const REALM: &str = "RTSP Server";

/// Nonce lifetime. Expired nonces are deleted on sight and purged on
/// every issuance.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(300);

const DEFAULT_USER: &str = "admin";
const DEFAULT_PASSWORD: &str = "password123";

/// Credentials carried by an `Authorization` header, parsed eagerly by
/// the request parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Digest(DigestResponse),
}

/// Fields of a Digest `Authorization` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl Credentials {
    /// Parse an `Authorization` header value. Returns `None` for unknown
    /// schemes or undecodable payloads; the request then counts as
    /// unauthenticated.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(encoded) = value.strip_prefix("Basic ") {
            let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        if let Some(params) = value.strip_prefix("Digest ") {
            return Some(Credentials::Digest(parse_digest_params(params)?));
        }
        None
    }
}

/// Parse comma-separated `key=value` Digest parameters, honoring quoted
/// values (which may themselves contain commas, e.g. opaque data).
fn parse_digest_params(input: &str) -> Option<DigestResponse> {
    let mut out = DigestResponse::default();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let close = stripped.find('"')?;
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();

        match key.as_str() {
            "username" => out.username = value,
            "realm" => out.realm = value,
            "nonce" => out.nonce = value,
            "uri" => out.uri = value,
            "response" => out.response = value,
            "qop" => out.qop = Some(value),
            "nc" => out.nc = Some(value),
            "cnonce" => out.cnonce = Some(value),
            // algorithm, opaque and extensions are accepted and ignored.
            _ => {}
        }
    }

    if out.username.is_empty() || out.nonce.is_empty() || out.response.is_empty() {
        return None;
    }
    Some(out)
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Runtime-mutable username → password store, shared between the RTSP
/// server and the MJPEG HTTP server.
#[derive(Clone, Default)]
pub struct UserStore {
    users: std::sync::Arc<RwLock<HashMap<String, String>>>,
}

impl UserStore {
    /// Build from the configured map; an empty map seeds the default user.
    pub fn from_config(users: &HashMap<String, String>) -> Self {
        let mut map = users.clone();
        if map.is_empty() {
            map.insert(DEFAULT_USER.to_string(), DEFAULT_PASSWORD.to_string());
        }
        Self {
            users: std::sync::Arc::new(RwLock::new(map)),
        }
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.users
            .write()
            .insert(username.to_string(), password.to_string());
        tracing::info!(username, "user added");
    }

    pub fn update_user(&self, username: &str, password: &str) {
        self.users
            .write()
            .insert(username.to_string(), password.to_string());
        tracing::info!(username, "user updated");
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
        tracing::info!(username, "user removed");
    }

    /// Constant-time password check.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let users = self.users.read();
        match users.get(username) {
            Some(stored) => constant_time_eq(stored.as_bytes(), password.as_bytes()),
            None => false,
        }
    }

    pub fn password_for(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }
}

/// Server-issued nonce cache.
struct NonceStore {
    nonces: Mutex<HashMap<String, Instant>>,
}

impl NonceStore {
    fn new() -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh nonce, purging every expired entry first.
    fn issue(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes[..]);
        let nonce = BASE64_STANDARD.encode(bytes);

        let now = Instant::now();
        let mut nonces = self.nonces.lock();
        nonces.retain(|_, expiry| *expiry >= now);
        nonces.insert(nonce.clone(), now + NONCE_LIFETIME);
        nonce
    }

    /// True if the nonce was issued by this server and has not expired.
    /// An expired nonce is deleted on sight.
    fn validate(&self, nonce: &str) -> bool {
        let mut nonces = self.nonces.lock();
        match nonces.get(nonce) {
            Some(expiry) if *expiry >= Instant::now() => true,
            Some(_) => {
                nonces.remove(nonce);
                false
            }
            None => false,
        }
    }
}

/// Authentication engine shared by every protocol surface.
pub struct AuthEngine {
    users: UserStore,
    nonces: NonceStore,
    required: bool,
}

impl AuthEngine {
    pub fn new(users: UserStore, required: bool) -> Self {
        if !required {
            tracing::warn!("authentication explicitly disabled, all requests pass");
        }
        Self {
            users,
            nonces: NonceStore::new(),
            required,
        }
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    /// Build a fresh `WWW-Authenticate` challenge value.
    pub fn challenge(&self) -> String {
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
            REALM,
            self.nonces.issue()
        )
    }

    /// Validate credentials for `method`. Always true when authentication
    /// is disabled.
    pub fn authorize(&self, credentials: Option<&Credentials>, method: &str) -> bool {
        if !self.required {
            return true;
        }
        match credentials {
            Some(Credentials::Basic { username, password }) => {
                let ok = self.users.verify(username, password);
                if !ok {
                    tracing::warn!(username, "Basic authentication failed");
                }
                ok
            }
            Some(Credentials::Digest(digest)) => {
                let ok = self.verify_digest(digest, method);
                if !ok {
                    tracing::warn!(username = %digest.username, "Digest authentication failed");
                }
                ok
            }
            None => false,
        }
    }

    /// RFC 7616 MD5 verification.
    ///
    /// - `HA1 = MD5(username:realm:password)`
    /// - `HA2 = MD5(method:uri)`
    /// - with `qop=auth`: `MD5(HA1:nonce:nc:cnonce:qop:HA2)`
    /// - without qop: `MD5(HA1:nonce:HA2)`
    fn verify_digest(&self, digest: &DigestResponse, method: &str) -> bool {
        if !self.nonces.validate(&digest.nonce) {
            tracing::debug!(nonce = %digest.nonce, "unknown or expired nonce");
            return false;
        }
        let Some(password) = self.users.password_for(&digest.username) else {
            return false;
        };

        let ha1 = md5_hex(&format!("{}:{}:{}", digest.username, REALM, password));
        let ha2 = md5_hex(&format!("{}:{}", method, digest.uri));

        let expected = match digest.qop.as_deref() {
            Some(qop) => {
                let (Some(nc), Some(cnonce)) = (&digest.nc, &digest.cnonce) else {
                    return false;
                };
                md5_hex(&format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, digest.nonce, nc, cnonce, qop, ha2
                ))
            }
            None => md5_hex(&format!("{}:{}:{}", ha1, digest.nonce, ha2)),
        };

        // The client may hex-encode in either case.
        constant_time_eq(
            expected.as_bytes(),
            digest.response.to_ascii_lowercase().as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AuthEngine {
        AuthEngine::new(UserStore::from_config(&HashMap::new()), true)
    }

    fn nonce_of(challenge: &str) -> String {
        let start = challenge.find("nonce=\"").unwrap() + 7;
        let end = challenge[start..].find('"').unwrap() + start;
        challenge[start..end].to_string()
    }

    #[test]
    fn default_user_seeded() {
        let store = UserStore::from_config(&HashMap::new());
        assert!(store.verify("admin", "password123"));
        assert!(!store.verify("admin", "wrong"));
        assert!(!store.verify("ghost", "password123"));
    }

    #[test]
    fn configured_users_override_seed() {
        let mut users = HashMap::new();
        users.insert("op".to_string(), "secret".to_string());
        let store = UserStore::from_config(&users);
        assert!(store.verify("op", "secret"));
        assert!(!store.verify("admin", "password123"));
    }

    #[test]
    fn user_store_mutations() {
        let store = UserStore::from_config(&HashMap::new());
        store.add_user("viewer", "pw1");
        assert!(store.verify("viewer", "pw1"));
        store.update_user("viewer", "pw2");
        assert!(store.verify("viewer", "pw2"));
        assert!(!store.verify("viewer", "pw1"));
        store.remove_user("viewer");
        assert!(!store.verify("viewer", "pw2"));
    }

    #[test]
    fn parse_basic_credentials() {
        let value = format!("Basic {}", BASE64_STANDARD.encode("admin:password123"));
        match Credentials::parse(&value) {
            Some(Credentials::Basic { username, password }) => {
                assert_eq!(username, "admin");
                assert_eq!(password, "password123");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_basic_password_with_colon() {
        let value = format!("Basic {}", BASE64_STANDARD.encode("u:pa:ss"));
        match Credentials::parse(&value) {
            Some(Credentials::Basic { username, password }) => {
                assert_eq!(username, "u");
                assert_eq!(password, "pa:ss");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_digest_quoted_and_bare() {
        let value = "Digest username=\"admin\", realm=\"RTSP Server\", \
                     nonce=\"abc\", uri=\"rtsp://h/live\", response=\"00ff\", \
                     algorithm=MD5, qop=auth, nc=00000001, cnonce=\"xyz\"";
        match Credentials::parse(value) {
            Some(Credentials::Digest(d)) => {
                assert_eq!(d.username, "admin");
                assert_eq!(d.nonce, "abc");
                assert_eq!(d.uri, "rtsp://h/live");
                assert_eq!(d.response, "00ff");
                assert_eq!(d.qop.as_deref(), Some("auth"));
                assert_eq!(d.nc.as_deref(), Some("00000001"));
                assert_eq!(d.cnonce.as_deref(), Some("xyz"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(Credentials::parse("Bearer token").is_none());
        assert!(Credentials::parse("Basic !!!notbase64!!!").is_none());
    }

    #[test]
    fn rfc_digest_vector() {
        // RFC 2617 §3.5 worked example.
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let response = md5_hex(&format!(
            "{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:00000001:0a4f113b:auth:{ha2}"
        ));
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_roundtrip_with_qop() {
        let engine = engine();
        let nonce = nonce_of(&engine.challenge());

        let ha1 = md5_hex(&format!("admin:{REALM}:password123"));
        let ha2 = md5_hex("DESCRIBE:rtsp://10.0.0.1:7778/live");
        let response = md5_hex(&format!("{ha1}:{nonce}:00000001:deadbeef:auth:{ha2}"));

        let creds = Credentials::Digest(DigestResponse {
            username: "admin".into(),
            realm: REALM.into(),
            nonce: nonce.clone(),
            uri: "rtsp://10.0.0.1:7778/live".into(),
            response,
            qop: Some("auth".into()),
            nc: Some("00000001".into()),
            cnonce: Some("deadbeef".into()),
        });
        assert!(engine.authorize(Some(&creds), "DESCRIBE"));

        // Wrong method must fail (HA2 covers the method).
        assert!(!engine.authorize(Some(&creds), "SETUP"));
    }

    #[test]
    fn digest_roundtrip_without_qop() {
        let engine = engine();
        let nonce = nonce_of(&engine.challenge());

        let ha1 = md5_hex(&format!("admin:{REALM}:password123"));
        let ha2 = md5_hex("OPTIONS:/live");
        let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));

        let creds = Credentials::Digest(DigestResponse {
            username: "admin".into(),
            realm: REALM.into(),
            nonce,
            uri: "/live".into(),
            response: response.to_ascii_uppercase(), // case-insensitive compare
            ..Default::default()
        });
        assert!(engine.authorize(Some(&creds), "OPTIONS"));
    }

    #[test]
    fn digest_rejects_foreign_nonce() {
        let engine = engine();
        let ha1 = md5_hex(&format!("admin:{REALM}:password123"));
        let ha2 = md5_hex("DESCRIBE:/live");
        let response = md5_hex(&format!("{ha1}:forged:{ha2}"));
        let creds = Credentials::Digest(DigestResponse {
            username: "admin".into(),
            realm: REALM.into(),
            nonce: "forged".into(),
            uri: "/live".into(),
            response,
            ..Default::default()
        });
        assert!(!engine.authorize(Some(&creds), "DESCRIBE"));
    }

    #[test]
    fn nonce_expiry() {
        let store = NonceStore::new();
        let nonce = store.issue();
        assert!(store.validate(&nonce));

        // Force-expire the entry, then confirm deletion on sight.
        store
            .nonces
            .lock()
            .insert(nonce.clone(), Instant::now() - Duration::from_secs(1));
        assert!(!store.validate(&nonce));
        assert!(!store.nonces.lock().contains_key(&nonce));
    }

    #[test]
    fn issuance_purges_expired() {
        let store = NonceStore::new();
        let stale = store.issue();
        store
            .nonces
            .lock()
            .insert(stale.clone(), Instant::now() - Duration::from_secs(1));
        let _fresh = store.issue();
        assert!(!store.nonces.lock().contains_key(&stale));
    }

    #[test]
    fn auth_disabled_passes_everything() {
        let engine = AuthEngine::new(UserStore::from_config(&HashMap::new()), false);
        assert!(engine.authorize(None, "DESCRIBE"));
    }

    #[test]
    fn missing_credentials_rejected_when_required() {
        assert!(!engine().authorize(None, "DESCRIBE"));
    }

    #[test]
    fn basic_against_engine() {
        let engine = engine();
        let good = Credentials::Basic {
            username: "admin".into(),
            password: "password123".into(),
        };
        let bad = Credentials::Basic {
            username: "admin".into(),
            password: "nope".into(),
        };
        assert!(engine.authorize(Some(&good), "DESCRIBE"));
        assert!(!engine.authorize(Some(&bad), "DESCRIBE"));
    }
}

//! Request signing.
//!
//! A signature is HMAC_SHA256(secret, verb + path + token + body), hex
//! encoded. The verb is upper-cased, the path is relative (including the
//! query string), and the body must be the exact bytes put on the wire.
//! The freshness token is either a strictly increasing nonce or an expiry
//! timestamp a few seconds ahead; expiry tolerates clock skew and
//! out-of-order delivery since concurrent requests need no ordering.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Grace period added to expiry tokens, in seconds.
pub const EXPIRES_GRACE_SECS: u64 = 5;

static LAST_NONCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessScheme {
    /// Millisecond nonce, must increase per key.
    Nonce,
    /// Unix-seconds expiry a few seconds ahead.
    Expires,
}

impl FreshnessScheme {
    pub fn header(&self) -> &'static str {
        match self {
            FreshnessScheme::Nonce => "api-nonce",
            FreshnessScheme::Expires => "api-expires",
        }
    }

    pub fn token(&self) -> u64 {
        match self {
            FreshnessScheme::Nonce => nonce(),
            FreshnessScheme::Expires => expires(),
        }
    }
}

impl FromStr for FreshnessScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nonce" => Ok(FreshnessScheme::Nonce),
            "expires" => Ok(FreshnessScheme::Expires),
            other => Err(format!("unknown freshness scheme: {other}")),
        }
    }
}

/// Milliseconds since epoch, forced strictly increasing within the process.
pub fn nonce() -> u64 {
    let now = unix_millis();
    let mut prev = LAST_NONCE.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_NONCE.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Unix seconds a short grace period in the future.
pub fn expires() -> u64 {
    unix_secs() + EXPIRES_GRACE_SECS
}

pub fn sign(secret: &str, verb: &str, path: &str, token: u64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(verb.as_bytes());
    mac.update(path.as_bytes());
    mac.update(token.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "chNOOS4KvNXR_Xq4k4c9qsfoKWvnDecLATCRlcBwyKDYnWgO";
    const BODY: &str = r#"{"symbol":"XBTZ14","quantity":1,"price":395.01}"#;

    #[test]
    fn signature_matches_documented_nonce_vector() {
        let sig = sign(SECRET, "POST", "/api/v1/order", 1416993995705, BODY);
        assert_eq!(
            sig,
            "df477fbf0d43e3f72b37c2bb9ace989d9f814d4a952ee75ebeea901b28f6a418"
        );
    }

    #[test]
    fn signature_matches_expiry_vector() {
        let sig = sign(SECRET, "POST", "/api/v1/order", 1518064238, BODY);
        assert_eq!(
            sig,
            "d76928aaa6e1b3100c7bf330d04c7deba63659dbf0d18bc80372785eed6e7942"
        );
    }

    #[test]
    fn signature_covers_realtime_handshake() {
        let sig = sign(SECRET, "GET", "/realtime", 1518064236, "");
        assert_eq!(
            sig,
            "6d459dc02866d35a2b965edeecc68063d488e296b77982235fc6eca24b934945"
        );
    }

    #[test]
    fn nonces_strictly_increase() {
        let a = nonce();
        let b = nonce();
        let c = nonce();
        assert!(a < b && b < c);
    }

    #[test]
    fn expiry_is_in_the_future() {
        assert!(expires() > unix_secs());
    }

    #[test]
    fn scheme_parsing() {
        assert_eq!("nonce".parse(), Ok(FreshnessScheme::Nonce));
        assert_eq!("Expires".parse(), Ok(FreshnessScheme::Expires));
        assert!("hmac".parse::<FreshnessScheme>().is_err());
        assert_eq!(FreshnessScheme::Nonce.header(), "api-nonce");
        assert_eq!(FreshnessScheme::Expires.header(), "api-expires");
    }
}

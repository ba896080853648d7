use chrono::{DateTime, Duration, Utc};
use common::canonical_request;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{PanelError, PanelResult};

type HmacSha256 = Hmac<Sha256>;

const MAX_NONCE_LEN: usize = 128;

/// Raw signing headers of one request.
#[derive(Debug, Clone, Copy)]
pub struct SignatureParts<'a> {
    pub agent_id: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
    pub signature: &'a str,
}

/// Remembers nonces seen per agent for as long as a request carrying them
/// could still pass the timestamp check.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl ReplayGuard {
    /// Record the nonce; `false` if it was already used.
    pub fn check_and_record(&self, agent_id: &str, nonce: &str, now: DateTime<Utc>, retain: Duration) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.retain(|_, at| *at + retain > now);
        let key = (agent_id.to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

pub struct SignatureVerifier {
    window: Duration,
    replay: ReplayGuard,
}

impl SignatureVerifier {
    pub fn new(window_secs: i64) -> Self {
        Self { window: Duration::seconds(window_secs), replay: ReplayGuard::default() }
    }

    /// Verify an HMAC-SHA256 request signature made with `secret`.
    pub fn verify(
        &self,
        parts: &SignatureParts<'_>,
        secret: &str,
        method: &str,
        path_and_query: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> PanelResult<()> {
        let timestamp: i64 = parts
            .timestamp
            .trim()
            .parse()
            .map_err(|_| PanelError::SignatureInvalid("timestamp is not unix seconds".to_string()))?;
        // header value is untrusted; an overflowing difference is out of window
        let window = self.window.num_seconds().unsigned_abs();
        match now.timestamp().checked_sub(timestamp).map(i64::unsigned_abs) {
            Some(skew) if skew <= window => {}
            Some(skew) => return Err(PanelError::SignatureInvalid(format!("timestamp skew of {}s", skew))),
            None => return Err(PanelError::SignatureInvalid("timestamp out of range".to_string())),
        }
        if parts.nonce.is_empty() || parts.nonce.len() > MAX_NONCE_LEN {
            return Err(PanelError::SignatureInvalid("bad nonce".to_string()));
        }

        let expected = hex::decode(parts.signature.trim())
            .map_err(|_| PanelError::SignatureInvalid("signature is not hex".to_string()))?;
        let canonical = canonical_request(method, path_and_query, timestamp, parts.nonce, body);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| PanelError::Internal(format!("hmac key: {}", e)))?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| PanelError::SignatureInvalid("signature mismatch".to_string()))?;

        // only a verified request may burn a nonce
        if !self.replay.check_and_record(parts.agent_id, parts.nonce, now, self.window * 2) {
            return Err(PanelError::SignatureInvalid("nonce already used".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SignedHeaders;

    fn signed(secret: &str, body: &[u8], ts: i64) -> SignedHeaders {
        SignedHeaders::sign("a1", secret, "POST", "/agent/heartbeat", body, ts)
    }

    fn parts<'a>(h: &'a SignedHeaders, ts: &'a str) -> SignatureParts<'a> {
        SignatureParts { agent_id: &h.agent_id, timestamp: ts, nonce: &h.nonce, signature: &h.signature }
    }

    #[test]
    fn valid_signature_passes_once() {
        let v = SignatureVerifier::new(300);
        let now = Utc::now();
        let h = signed("s3cret", b"{}", now.timestamp());
        let ts = h.timestamp.to_string();
        v.verify(&parts(&h, &ts), "s3cret", "POST", "/agent/heartbeat", b"{}", now).unwrap();

        let replay = v.verify(&parts(&h, &ts), "s3cret", "POST", "/agent/heartbeat", b"{}", now).unwrap_err();
        assert!(matches!(replay, PanelError::SignatureInvalid(_)));
    }

    #[test]
    fn tampering_is_detected() {
        let v = SignatureVerifier::new(300);
        let now = Utc::now();
        let h = signed("s3cret", b"{}", now.timestamp());
        let ts = h.timestamp.to_string();
        for (secret, method, path, body) in [
            ("other", "POST", "/agent/heartbeat", &b"{}"[..]),
            ("s3cret", "GET", "/agent/heartbeat", &b"{}"[..]),
            ("s3cret", "POST", "/agent/jobs", &b"{}"[..]),
            ("s3cret", "POST", "/agent/heartbeat", &b"{\"x\":1}"[..]),
        ] {
            let err = v.verify(&parts(&h, &ts), secret, method, path, body, now).unwrap_err();
            assert!(matches!(err, PanelError::SignatureInvalid(_)));
        }
        // failed attempts did not burn the nonce
        v.verify(&parts(&h, &ts), "s3cret", "POST", "/agent/heartbeat", b"{}", now).unwrap();
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let v = SignatureVerifier::new(300);
        let now = Utc::now();
        let h = signed("s3cret", b"", now.timestamp() - 301);
        let ts = h.timestamp.to_string();
        assert!(v.verify(&parts(&h, &ts), "s3cret", "POST", "/agent/heartbeat", b"", now).is_err());
        assert!(v.verify(&parts(&h, "yesterday"), "s3cret", "POST", "/agent/heartbeat", b"", now).is_err());
    }

    #[test]
    fn replay_guard_forgets_after_retention() {
        let g = ReplayGuard::default();
        let now = Utc::now();
        assert!(g.check_and_record("a1", "n1", now, Duration::seconds(600)));
        assert!(!g.check_and_record("a1", "n1", now, Duration::seconds(600)));
        assert!(g.check_and_record("a2", "n1", now, Duration::seconds(600)));
        assert!(g.check_and_record("a1", "n1", now + Duration::seconds(601), Duration::seconds(600)));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn extreme_or_malformed_timestamps_are_rejected() {
        let v = SignatureVerifier::new(300);
        let now = Utc::now();
        for ts in [i64::MIN, i64::MAX, i64::MIN + 1, now.timestamp() - i64::MAX] {
            // correctly signed, so only the window check stands in the way
            let h = signed("s3cret", b"", ts);
            let text = h.timestamp.to_string();
            let err = v.verify(&parts(&h, &text), "s3cret", "POST", "/agent/heartbeat", b"", now).unwrap_err();
            assert!(matches!(err, PanelError::SignatureInvalid(_)), "timestamp {}", ts);
        }
        let h = signed("s3cret", b"", now.timestamp());
        for text in ["", "abc", "1.5e9", "99999999999999999999", "-"] {
            let err = v.verify(&parts(&h, text), "s3cret", "POST", "/agent/heartbeat", b"", now).unwrap_err();
            assert!(matches!(err, PanelError::SignatureInvalid(_)), "header {:?}", text);
        }
        assert_eq!(v.replay.len(), 0);
    }

    #[test]
    fn poisoned_replay_guard_keeps_working() {
        let g = ReplayGuard::default();
        let now = Utc::now();
        assert!(g.check_and_record("a1", "n1", now, Duration::seconds(600)));
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = g.seen.lock().unwrap();
            panic!("poison the lock");
        }));
        assert!(g.seen.is_poisoned());
        assert!(g.check_and_record("a1", "n2", now, Duration::seconds(600)));
        assert!(!g.check_and_record("a1", "n1", now, Duration::seconds(600)));
        assert_eq!(g.len(), 2);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEADER_AGENT_ID: &str = "x-agent-id";
pub const HEADER_TIMESTAMP: &str = "x-agent-timestamp";
pub const HEADER_NONCE: &str = "x-agent-nonce";
pub const HEADER_SIGNATURE: &str = "x-agent-signature";

/// Flat string map carried by every job.
pub type JobPayloadMap = BTreeMap<String, String>;

// ===================== Registration =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub bootstrap_token: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub secret: String, // hex, shown exactly once
}

impl std::fmt::Debug for RegisterResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterResponse")
            .field("agent_id", &self.agent_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ===================== Heartbeat =====================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub version: String,
    #[serde(default)]
    pub stats: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusOk {
    pub status: String,
}

impl StatusOk {
    pub fn ok() -> Self {
        Self { status: "ok".to_string() }
    }
}

// ===================== Job polling & reporting =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: JobPayloadMap,
    pub created_at: DateTime<Utc>,
    /// Lease capability; agents may echo it back on logs/results.
    pub lock_token: String,
    pub lock_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub jobs: Vec<JobEnvelope>,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub job_id: String,
    /// "succeeded" | "failed" | "cancelled"; validated server side.
    pub status: String,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogReport {
    pub job_id: String,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    /// Either a single string or an array of strings.
    #[serde(default)]
    pub logs: Option<serde_json::Value>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

// ===================== Request signing =====================

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(bytes);
    let out = h.finalize();
    hex::encode(out)
}

/// Canonical form covered by the agent signature. Any change here is a
/// protocol break for every deployed agent.
pub fn canonical_request(method: &str, path_and_query: &str, timestamp: i64, nonce: &str, body: &[u8]) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path_and_query,
        timestamp,
        nonce,
        sha256_hex(body)
    )
}

pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn generate_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The four headers an agent attaches to every signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub agent_id: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

impl SignedHeaders {
    pub fn sign(agent_id: &str, secret: &str, method: &str, path_and_query: &str, body: &[u8], timestamp: i64) -> Self {
        let nonce = generate_nonce();
        let canonical = canonical_request(method, path_and_query, timestamp, &nonce, body);
        Self {
            agent_id: agent_id.to_string(),
            timestamp,
            nonce,
            signature: hmac_sha256_hex(secret, &canonical),
        }
    }

    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_AGENT_ID, self.agent_id.clone()),
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_NONCE, self.nonce.clone()),
            (HEADER_SIGNATURE, self.signature.clone()),
        ]
    }
}

//! Agent identity: registration, secrets at rest and request signatures.

mod cipher;
mod registration;
mod signature;

pub use cipher::{AesSecretCipher, SecretCipher};
pub use registration::{constant_time_eq, generate_agent_secret};
pub use signature::{ReplayGuard, SignatureParts, SignatureVerifier};

//! Ed25519 host identity.
//!
//! Every peer owns a long-lived signing key; the SHA-256 of the public key
//! is the fingerprint users see in trust prompts.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// SHA-256 of an identity public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(key: &VerifyingKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the display form (`SHA256:<base64>`).
    pub fn parse(text: &str) -> Option<Self> {
        let encoded = text.strip_prefix("SHA256:")?;
        let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(encoded)
            .ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        Some(Fingerprint(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(self.0)
        )
    }
}

/// Long-lived Ed25519 identity keypair.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Identity { signing: SigningKey::from_bytes(&seed) }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Identity { signing: SigningKey::from_bytes(&seed) }
    }

    /// Load the key file, generating and persisting a fresh identity on
    /// first run.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(raw) => {
                let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "identity key file is not 32 bytes")
                })?;
                Ok(Identity::from_seed(seed))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let identity = Identity::generate();
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::write(path, identity.signing.to_bytes())?;
                Ok(identity)
            }
            Err(err) => Err(err),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

/// Verify a detached signature against an identity public key.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify(message, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let identity = Identity::generate();
        let sig = identity.sign(b"transcript");
        assert!(verify(&identity.verifying_key(), b"transcript", &sig));
        assert!(!verify(&identity.verifying_key(), b"tampered", &sig));
    }

    #[test]
    fn fingerprint_display_round_trip() {
        let identity = Identity::generate();
        let fp = identity.fingerprint();
        let text = fp.to_string();
        assert!(text.starts_with("SHA256:"));
        assert_eq!(Fingerprint::parse(&text), Some(fp));
    }

    #[test]
    fn load_or_generate_persists() {
        let dir = std::env::temp_dir().join(format!("ascii-chat-test-{}", std::process::id()));
        let path = dir.join("identity.key");
        let first = Identity::load_or_generate(&path).expect("generate");
        let second = Identity::load_or_generate(&path).expect("load");
        assert_eq!(first.fingerprint(), second.fingerprint());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

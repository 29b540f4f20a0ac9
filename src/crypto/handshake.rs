//! Transcript-signed session handshake.
//!
//! Three messages ride the unencrypted wire before the session streams
//! come up:
//!
//! 1. I -> R  HELLO          `version | capabilities | eph_pub | identity_pub | nonce_i`
//! 2. R -> I  AUTH_CHALLENGE `eph_pub | identity_pub | nonce_r | sign_R(transcript)`
//! 3. I -> R  AUTH_RESPONSE  `sign_I(transcript) | confirm`
//!
//! Both sides then derive per-direction keys from the X25519 shared secret
//! with HKDF-SHA256 salted by `"ascii-chat v1" || nonce_i || nonce_r`. An
//! optional password factor is injected into the KDF input and confirmed
//! by the tag in AUTH_RESPONSE.

use super::cipher::{OpeningStream, SealingStream};
use super::identity::{verify, Fingerprint, Identity};
use super::HandshakeError;
use crate::protocol::VERSION;
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

const NONCE_LEN: usize = 32;
const HELLO_LEN: usize = 2 + 4 + 32 + 32 + NONCE_LEN;
const CHALLENGE_UNSIGNED_LEN: usize = 32 + 32 + NONCE_LEN;
const CHALLENGE_LEN: usize = CHALLENGE_UNSIGNED_LEN + 64;
const RESPONSE_LEN: usize = 64 + 32;

const KDF_SALT_PREFIX: &[u8] = b"ascii-chat v1";
const INFO_I_TO_R: &[u8] = b"ascii-chat v1 initiator->responder";
const INFO_R_TO_I: &[u8] = b"ascii-chat v1 responder->initiator";
const INFO_PASSWORD: &[u8] = b"ascii-chat v1 password";
const INFO_CONFIRM: &[u8] = b"ascii-chat v1 confirm";

/// Per-direction session streams handed to the transport once the
/// handshake completes.
pub struct SessionKeys {
    pub send: SealingStream,
    pub recv: OpeningStream,
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Password factor mixed into the session KDF; all-zero when the session
/// is not password-protected.
fn password_factor(password: Option<&str>, nonce_i: &[u8], nonce_r: &[u8]) -> [u8; 32] {
    let Some(password) = password else {
        return [0u8; 32];
    };
    let mut salt = Vec::with_capacity(NONCE_LEN * 2);
    salt.extend_from_slice(nonce_i);
    salt.extend_from_slice(nonce_r);
    let hk = Hkdf::<Sha256>::new(Some(&salt), password.as_bytes());
    let mut factor = [0u8; 32];
    hk.expand(INFO_PASSWORD, &mut factor)
        .expect("32 bytes is a valid hkdf output length");
    factor
}

/// Key-confirmation tag binding the password factor to the transcript.
fn confirm_tag(factor: &[u8; 32], transcript: &[u8]) -> [u8; 32] {
    if factor.iter().all(|&b| b == 0) {
        return [0u8; 32];
    }
    let transcript_hash: [u8; 32] = Sha256::digest(transcript).into();
    let hk = Hkdf::<Sha256>::new(Some(&transcript_hash), factor);
    let mut tag = [0u8; 32];
    hk.expand(INFO_CONFIRM, &mut tag)
        .expect("32 bytes is a valid hkdf output length");
    tag
}

fn derive_keys(
    shared: &[u8],
    factor: &[u8; 32],
    nonce_i: &[u8],
    nonce_r: &[u8],
    initiator: bool,
) -> SessionKeys {
    let mut salt = Vec::with_capacity(KDF_SALT_PREFIX.len() + NONCE_LEN * 2);
    salt.extend_from_slice(KDF_SALT_PREFIX);
    salt.extend_from_slice(nonce_i);
    salt.extend_from_slice(nonce_r);

    let mut ikm = Vec::with_capacity(shared.len() + factor.len());
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(factor);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut key_i_to_r = [0u8; 32];
    let mut key_r_to_i = [0u8; 32];
    hk.expand(INFO_I_TO_R, &mut key_i_to_r)
        .expect("32 bytes is a valid hkdf output length");
    hk.expand(INFO_R_TO_I, &mut key_r_to_i)
        .expect("32 bytes is a valid hkdf output length");

    if initiator {
        SessionKeys {
            send: SealingStream::new(&key_i_to_r),
            recv: OpeningStream::new(&key_r_to_i),
        }
    } else {
        SessionKeys {
            send: SealingStream::new(&key_r_to_i),
            recv: OpeningStream::new(&key_i_to_r),
        }
    }
}

fn parse_key(bytes: &[u8]) -> Result<VerifyingKey, HandshakeError> {
    let raw: [u8; 32] = bytes.try_into().map_err(|_| HandshakeError::Malformed)?;
    VerifyingKey::from_bytes(&raw).map_err(|_| HandshakeError::Malformed)
}

/// Initiator half of the handshake (the connecting client).
pub struct Initiator {
    eph_secret: EphemeralSecret,
    nonce_i: [u8; NONCE_LEN],
    hello: Vec<u8>,
    password: Option<String>,
}

/// Everything the initiator learns from a valid AUTH_CHALLENGE. The
/// caller must consult the trust store on `peer_fingerprint` before
/// sending `response_payload`.
pub struct InitiatorOutcome {
    pub keys: SessionKeys,
    pub response_payload: Vec<u8>,
    pub peer_identity: VerifyingKey,
    pub peer_fingerprint: Fingerprint,
}

impl Initiator {
    /// Build the HELLO payload and the state awaiting the challenge.
    pub fn start(
        identity: &Identity,
        capabilities: u32,
        password: Option<&str>,
    ) -> (Initiator, Vec<u8>) {
        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = PublicKey::from(&eph_secret);
        let nonce_i = random_nonce();

        let mut hello = Vec::with_capacity(HELLO_LEN);
        hello.extend_from_slice(&VERSION.to_le_bytes());
        hello.extend_from_slice(&capabilities.to_le_bytes());
        hello.extend_from_slice(eph_pub.as_bytes());
        hello.extend_from_slice(identity.verifying_key().as_bytes());
        hello.extend_from_slice(&nonce_i);

        let state = Initiator {
            eph_secret,
            nonce_i,
            hello: hello.clone(),
            password: password.map(str::to_owned),
        };
        (state, hello)
    }

    /// Verify the challenge, derive session keys, and produce the
    /// AUTH_RESPONSE payload.
    pub fn finish(
        self,
        identity: &Identity,
        challenge: &[u8],
    ) -> Result<InitiatorOutcome, HandshakeError> {
        if challenge.len() != CHALLENGE_LEN {
            return Err(HandshakeError::Malformed);
        }
        let peer_eph_raw: [u8; 32] = challenge[0..32].try_into().unwrap();
        let peer_identity = parse_key(&challenge[32..64])?;
        let nonce_r = &challenge[64..96];
        let signature = Signature::from_bytes(challenge[96..160].try_into().unwrap());

        let mut transcript = Vec::with_capacity(HELLO_LEN + CHALLENGE_UNSIGNED_LEN);
        transcript.extend_from_slice(&self.hello);
        transcript.extend_from_slice(&challenge[..CHALLENGE_UNSIGNED_LEN]);
        if !verify(&peer_identity, &transcript, &signature) {
            return Err(HandshakeError::BadSignature);
        }

        let shared = self.eph_secret.diffie_hellman(&PublicKey::from(peer_eph_raw));
        let factor = password_factor(self.password.as_deref(), &self.nonce_i, nonce_r);

        // Sign the full transcript including the responder's signature.
        let mut full_transcript = Vec::with_capacity(HELLO_LEN + CHALLENGE_LEN);
        full_transcript.extend_from_slice(&self.hello);
        full_transcript.extend_from_slice(challenge);
        let response_sig = identity.sign(&full_transcript);
        let confirm = confirm_tag(&factor, &full_transcript);

        let mut response = Vec::with_capacity(RESPONSE_LEN);
        response.extend_from_slice(&response_sig.to_bytes());
        response.extend_from_slice(&confirm);

        let keys = derive_keys(shared.as_bytes(), &factor, &self.nonce_i, nonce_r, true);
        Ok(InitiatorOutcome {
            keys,
            response_payload: response,
            peer_identity,
            peer_fingerprint: Fingerprint::of(&peer_identity),
        })
    }
}

/// Responder half of the handshake (the accepting server).
pub struct Responder {
    shared: [u8; 32],
    factor: [u8; 32],
    nonce_i: [u8; NONCE_LEN],
    nonce_r: [u8; NONCE_LEN],
    transcript: Vec<u8>,
    peer_identity: VerifyingKey,
    passworded: bool,
}

impl Responder {
    /// Validate the HELLO, produce the AUTH_CHALLENGE payload, and hold
    /// state for the response. Returns the initiator's claimed
    /// capabilities alongside.
    pub fn accept(
        identity: &Identity,
        password: Option<&str>,
        hello: &[u8],
    ) -> Result<(Responder, Vec<u8>, u32), HandshakeError> {
        if hello.len() != HELLO_LEN {
            return Err(HandshakeError::Malformed);
        }
        let version = u16::from_le_bytes(hello[0..2].try_into().unwrap());
        if version != VERSION {
            return Err(HandshakeError::VersionIncompatible(version));
        }
        let capabilities = u32::from_le_bytes(hello[2..6].try_into().unwrap());
        let peer_eph_raw: [u8; 32] = hello[6..38].try_into().unwrap();
        let peer_identity = parse_key(&hello[38..70])?;
        let nonce_i: [u8; NONCE_LEN] = hello[70..102].try_into().unwrap();

        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = PublicKey::from(&eph_secret);
        let nonce_r = random_nonce();

        let mut challenge = Vec::with_capacity(CHALLENGE_LEN);
        challenge.extend_from_slice(eph_pub.as_bytes());
        challenge.extend_from_slice(identity.verifying_key().as_bytes());
        challenge.extend_from_slice(&nonce_r);

        let mut transcript = Vec::with_capacity(HELLO_LEN + CHALLENGE_UNSIGNED_LEN);
        transcript.extend_from_slice(hello);
        transcript.extend_from_slice(&challenge);
        let signature = identity.sign(&transcript);
        challenge.extend_from_slice(&signature.to_bytes());

        let shared = eph_secret.diffie_hellman(&PublicKey::from(peer_eph_raw));
        let factor = password_factor(password, &nonce_i, &nonce_r);

        let mut full_transcript = Vec::with_capacity(HELLO_LEN + CHALLENGE_LEN);
        full_transcript.extend_from_slice(hello);
        full_transcript.extend_from_slice(&challenge);

        let state = Responder {
            shared: *shared.as_bytes(),
            factor,
            nonce_i,
            nonce_r,
            transcript: full_transcript,
            peer_identity,
            passworded: password.is_some(),
        };
        Ok((state, challenge, capabilities))
    }

    pub fn peer_fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.peer_identity)
    }

    /// Verify AUTH_RESPONSE and derive the session keys.
    pub fn finish(self, response: &[u8]) -> Result<(SessionKeys, VerifyingKey), HandshakeError> {
        if response.len() != RESPONSE_LEN {
            return Err(HandshakeError::Malformed);
        }
        let signature = Signature::from_bytes(response[0..64].try_into().unwrap());
        let confirm: [u8; 32] = response[64..96].try_into().unwrap();

        if !verify(&self.peer_identity, &self.transcript, &signature) {
            return Err(HandshakeError::BadSignature);
        }

        let expected = confirm_tag(&self.factor, &self.transcript);
        // Either side requiring a password the other lacks must land here,
        // not in a later AEAD failure.
        if self.passworded != confirm.iter().any(|&b| b != 0) || expected != confirm {
            return Err(HandshakeError::BadPassword);
        }

        let keys = derive_keys(&self.shared, &self.factor, &self.nonce_i, &self.nonce_r, false);
        Ok((keys, self.peer_identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(
        client_password: Option<&str>,
        server_password: Option<&str>,
    ) -> Result<(SessionKeys, SessionKeys), HandshakeError> {
        let client_id = Identity::generate();
        let server_id = Identity::generate();

        let (initiator, hello) = Initiator::start(&client_id, 0, client_password);
        let (responder, challenge, _caps) = Responder::accept(&server_id, server_password, &hello)?;
        let outcome = initiator.finish(&client_id, &challenge)?;
        let (server_keys, _peer) = responder.finish(&outcome.response_payload)?;
        Ok((outcome.keys, server_keys))
    }

    #[test]
    fn handshake_derives_matching_streams() {
        let (mut client, mut server) = run_handshake(None, None).expect("handshake");

        let wire = client.send.seal(b"hdr", b"client says hi");
        assert_eq!(server.recv.open(b"hdr", &wire).unwrap(), b"client says hi");

        let wire = server.send.seal(b"hdr", b"server says hi");
        assert_eq!(client.recv.open(b"hdr", &wire).unwrap(), b"server says hi");
    }

    #[test]
    fn password_match_succeeds() {
        assert!(run_handshake(Some("hunter2"), Some("hunter2")).is_ok());
    }

    #[test]
    fn password_mismatch_fails() {
        assert!(matches!(
            run_handshake(Some("hunter2"), Some("swordfish")),
            Err(HandshakeError::BadPassword)
        ));
    }

    #[test]
    fn missing_password_fails() {
        assert!(matches!(
            run_handshake(None, Some("hunter2")),
            Err(HandshakeError::BadPassword)
        ));
        assert!(matches!(
            run_handshake(Some("hunter2"), None),
            Err(HandshakeError::BadPassword)
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let client_id = Identity::generate();
        let server_id = Identity::generate();
        let (_initiator, mut hello) = Initiator::start(&client_id, 0, None);
        hello[0] = 0x63;
        assert!(matches!(
            Responder::accept(&server_id, None, &hello),
            Err(HandshakeError::VersionIncompatible(_))
        ));
    }

    #[test]
    fn tampered_challenge_signature_rejected() {
        let client_id = Identity::generate();
        let server_id = Identity::generate();
        let (initiator, hello) = Initiator::start(&client_id, 0, None);
        let (_responder, mut challenge, _) =
            Responder::accept(&server_id, None, &hello).expect("accept");
        // Flip a byte of the responder nonce after signing.
        challenge[70] ^= 0x01;
        assert_eq!(
            initiator.finish(&client_id, &challenge).map(|_| ()).unwrap_err(),
            HandshakeError::BadSignature
        );
    }

    #[test]
    fn tampered_response_signature_rejected() {
        let client_id = Identity::generate();
        let server_id = Identity::generate();
        let (initiator, hello) = Initiator::start(&client_id, 0, None);
        let (responder, challenge, _) =
            Responder::accept(&server_id, None, &hello).expect("accept");
        let outcome = initiator.finish(&client_id, &challenge).expect("finish");
        let mut response = outcome.response_payload.clone();
        response[3] ^= 0x01;
        assert_eq!(
            responder.finish(&response).map(|_| ()).unwrap_err(),
            HandshakeError::BadSignature
        );
    }
}

//! BEP-44 item signing and target derivation.
//!
//! Mutable items are signed with Ed25519 over the bencoded concatenation of
//! the salt (when present), the sequence number, and the already-bencoded
//! value: `4:salt6:foobar3:seqi1e1:v12:Hello World!`.
//!
//! Secret keys are carried in the 64-byte expanded form (clamped
//! SHA-512 of the seed), which is the representation the published test
//! vectors are defined against.
//!
//! [BEP-44]: http://bittorrent.org/beps/bep_0044.html

use std::fmt;
use std::io::Write as _;

use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Verifier as _, VerifyingKey};
use rand::Rng as _;
use sha1::{Digest as _, Sha1};
use sha2::Sha512;

use super::error::DhtError;
use super::node::NodeId;

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

/// An Ed25519 secret key in expanded form (scalar ‖ hash prefix).
#[derive(Clone)]
pub struct SecretKey(pub [u8; 64]);

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| DhtError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| DhtError::InvalidSignature)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// An Ed25519 keypair for publishing mutable items.
#[derive(Clone)]
pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Keypair {
    /// Generates a fresh keypair from the process CSPRNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derives a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut expanded = [0u8; 64];
        expanded.copy_from_slice(&Sha512::digest(seed));
        expanded[0] &= 248;
        expanded[31] &= 63;
        expanded[31] |= 64;

        let esk = ExpandedSecretKey::from_bytes(&expanded);
        let public = PublicKey(VerifyingKey::from(&esk).to_bytes());

        Self {
            public,
            secret: SecretKey(expanded),
        }
    }
}

/// Builds the canonical byte string that mutable-item signatures cover.
fn signing_buffer(value: &[u8], salt: &[u8], seq: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(salt.len() + value.len() + 32);
    if !salt.is_empty() {
        let _ = write!(buf, "4:salt{}:", salt.len());
        buf.extend_from_slice(salt);
    }
    let _ = write!(buf, "3:seqi{}e1:v", seq);
    buf.extend_from_slice(value);
    buf
}

/// Signs a mutable item. `value` is the bencoded value bytes.
pub fn sign_mutable_item(
    value: &[u8],
    salt: &[u8],
    seq: i64,
    pk: &PublicKey,
    sk: &SecretKey,
) -> Result<Signature, DhtError> {
    let vk = VerifyingKey::from_bytes(&pk.0).map_err(|_| DhtError::InvalidPublicKey)?;
    let esk = ExpandedSecretKey::from_bytes(&sk.0);
    let sig = raw_sign::<Sha512>(&esk, &signing_buffer(value, salt, seq), &vk);
    Ok(Signature(sig.to_bytes()))
}

/// Verifies a mutable item signature. `value` is the bencoded value bytes.
pub fn verify_mutable_item(
    value: &[u8],
    salt: &[u8],
    seq: i64,
    pk: &PublicKey,
    sig: &Signature,
) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(&pk.0) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
    vk.verify(&signing_buffer(value, salt, seq), &sig).is_ok()
}

/// Target ID of a mutable item: SHA-1(public key ‖ salt).
pub fn item_target_id(salt: &[u8], pk: &PublicKey) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(pk.0);
    hasher.update(salt);
    NodeId(hasher.finalize().into())
}

/// Target ID of an immutable item: SHA-1 of the bencoded value.
pub fn immutable_item_target_id(value: &[u8]) -> NodeId {
    NodeId(Sha1::digest(value).into())
}

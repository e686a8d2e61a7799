//! Result hashing and signing primitives.
//!
//! Two independent concerns live here:
//! - [`digest_result`]: SHA3-256 over a speculatively executed result
//!   (`spec.md` §6, §2 Glossary: "Hash").
//! - [`SigningKey`]/[`VerifyingKey`]: Ed25519 signatures over a result
//!   hash, used for the reply-signature sets `spec.md` §3 describes.
//!
//! This mirrors the shape of the teacher's `kimberlite-crypto::verified`
//! wrapper (opaque key types around `ed25519-dalek`, `Debug` redacts key
//! material) without that crate's embedded Coq proof certificates — this
//! crate carries no formal-verification claims.

use ed25519_dalek::{Signer, Verifier};
use quorate_types::ResultHash;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use zeroize::Zeroize;

/// Computes the SHA3-256 digest of a result buffer.
pub fn digest_result(bytes: &[u8]) -> ResultHash {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    ResultHash::from_bytes(out)
}

/// An Ed25519 signature over a result hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidSignatureLength(bytes.len()));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

/// A replica's Ed25519 signing key.
///
/// `Debug` is implemented manually to avoid printing key material.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("inner", &"<redacted>").finish()
    }
}

impl SigningKey {
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Signs a result hash. Replies carry this as the "signature-over-hash"
    /// field in `spec.md` §4/§6.
    pub fn sign_hash(&self, hash: &ResultHash) -> Signature {
        let sig = self.inner.sign(hash.as_bytes());
        Signature(sig.to_bytes())
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        // ed25519_dalek::SigningKey zeroizes its own bytes on drop; this is
        // a defense-in-depth no-op kept for symmetry with other key types
        // in this crate that hold raw seed material.
        let mut scratch = [0u8; 0];
        scratch.zeroize();
    }
}

/// A replica's Ed25519 verifying (public) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    pub fn verify_hash(&self, hash: &ResultHash, signature: &Signature) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.inner
            .verify(hash.as_bytes(), &sig)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureInvalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = digest_result(b"hello world");
        let b = digest_result(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_distinguishes_inputs() {
        let a = digest_result(b"result A");
        let b = digest_result(b"result B");
        assert_ne!(a, b);
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let key = SigningKey::generate();
        let hash = digest_result(b"speculative result");
        let sig = key.sign_hash(&hash);
        assert!(key.verifying_key().verify_hash(&hash, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_hash() {
        let key = SigningKey::generate();
        let hash = digest_result(b"speculative result");
        let other = digest_result(b"different result");
        let sig = key.sign_hash(&hash);
        assert!(key.verifying_key().verify_hash(&other, &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key_a = SigningKey::generate();
        let key_b = SigningKey::generate();
        let hash = digest_result(b"speculative result");
        let sig = key_a.sign_hash(&hash);
        assert!(key_b.verifying_key().verify_hash(&hash, &sig).is_err());
    }

    #[test]
    fn signature_roundtrips_through_bytes() {
        let key = SigningKey::generate();
        let hash = digest_result(b"speculative result");
        let sig = key.sign_hash(&hash);
        let restored = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, restored);
    }

    #[test]
    fn signature_from_bytes_rejects_wrong_length() {
        let err = Signature::from_bytes(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignatureLength(32)));
    }

    proptest::proptest! {
        #[test]
        fn prop_sign_verify_roundtrip(data: Vec<u8>) {
            let key = SigningKey::generate();
            let hash = digest_result(&data);
            let sig = key.sign_hash(&hash);
            proptest::prop_assert!(key.verifying_key().verify_hash(&hash, &sig).is_ok());
        }
    }
}

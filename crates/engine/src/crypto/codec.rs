//! Entry codecs for externally stored documents
//!
//! Every byte written to an external entry file passes through an
//! [`EntryCodec`]. Encrypted stores seal payloads with XChaCha20-Poly1305;
//! unencrypted stores use [`IdentityCodec`].
//!
//! Sealed file layout: `b"SSX1" || nonce (24 bytes) || ciphertext+tag`.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

const SEALED_MAGIC: &[u8; 4] = b"SSX1";
const NONCE_LEN: usize = 24;
const ENTRY_KEY_DOMAIN: &[u8] = b"soupstore/external-entry/v1";

/// Codec applied to external entry payloads
///
/// Codecs must be `Send + Sync`; one instance is shared by every soup of a
/// store.
pub trait EntryCodec: Send + Sync {
    /// Encode a payload for writing
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decode a payload read from disk
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Codec identifier, used in logs
    fn codec_id(&self) -> &str;
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Payload is not in the codec's format
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Authentication failed (wrong key or tampered file)
    #[error("payload failed authentication")]
    Authentication,

    /// Sealing failed
    #[error("failed to seal payload")]
    Seal,
}

/// Pass-through codec for unencrypted stores
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl EntryCodec for IdentityCodec {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

/// XChaCha20-Poly1305 codec keyed from the store key
pub struct SealedCodec {
    cipher: XChaCha20Poly1305,
}

impl SealedCodec {
    /// Derive the entry key from the 32-byte store key
    pub fn from_store_key(store_key: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ENTRY_KEY_DOMAIN);
        hasher.update(store_key);
        let derived = hasher.finalize();
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&derived)),
        }
    }
}

impl std::fmt::Debug for SealedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCodec").finish_non_exhaustive()
    }
}

impl EntryCodec for SealedCodec {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|_| CodecError::Seal)?;
        let mut out = Vec::with_capacity(SEALED_MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(SEALED_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let header = SEALED_MAGIC.len() + NONCE_LEN;
        if data.len() < header || &data[..SEALED_MAGIC.len()] != SEALED_MAGIC {
            return Err(CodecError::Malformed(format!(
                "expected sealed entry header, got {} bytes",
                data.len()
            )));
        }
        let nonce = XNonce::from_slice(&data[SEALED_MAGIC.len()..header]);
        self.cipher
            .decrypt(nonce, &data[header..])
            .map_err(|_| CodecError::Authentication)
    }

    fn codec_id(&self) -> &str {
        "xchacha20poly1305"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _accepts_box_dyn_codec(_codec: Box<dyn EntryCodec>) {}

    #[test]
    fn identity_passes_through() {
        let codec = IdentityCodec;
        let encoded = codec.encode(b"{\"a\":1}").unwrap();
        assert_eq!(encoded, b"{\"a\":1}");
        assert_eq!(codec.decode(&encoded).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn sealed_hides_plaintext() {
        let codec = SealedCodec::from_store_key(&[7u8; 32]);
        let sealed = codec.encode(b"secret document").unwrap();
        assert!(sealed.starts_with(SEALED_MAGIC));
        assert!(!sealed.windows(6).any(|w| w == b"secret"));
        assert_eq!(codec.decode(&sealed).unwrap(), b"secret document");
    }

    #[test]
    fn sealed_uses_fresh_nonces() {
        let codec = SealedCodec::from_store_key(&[1u8; 32]);
        assert_ne!(codec.encode(b"same").unwrap(), codec.encode(b"same").unwrap());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = SealedCodec::from_store_key(&[1u8; 32]).encode(b"doc").unwrap();
        let other = SealedCodec::from_store_key(&[2u8; 32]);
        assert_eq!(other.decode(&sealed), Err(CodecError::Authentication));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let codec = SealedCodec::from_store_key(&[1u8; 32]);
        assert!(matches!(codec.decode(b"SSX1"), Err(CodecError::Malformed(_))));
        assert!(matches!(codec.decode(b"{}"), Err(CodecError::Malformed(_))));
    }
}

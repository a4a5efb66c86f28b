//! Session-key cryptography
//!
//! A connection's symmetric session key is a random 256-bit AES key. The
//! client wraps it with the server's RSA public key (OAEP, SHA-256) and sends
//! it base64-encoded; the server unwraps it with its private key. Messages and
//! whole files are then sealed with AES-256-GCM under a fresh 96-bit nonce,
//! carried on the wire as the `iv` field.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use core::fmt;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;

use crate::errors::{CryptographicError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Session key length in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

// ----------------------------------------------------------------------------
// Base64 Helpers
// ----------------------------------------------------------------------------

/// Standard-alphabet base64 encode
pub fn encode_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Standard-alphabet base64 decode; surrounding whitespace is ignored
pub fn decode_b64(data: &str) -> core::result::Result<Vec<u8>, CryptographicError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| CryptographicError::MalformedBase64(e.to_string()))
}

// ----------------------------------------------------------------------------
// Session Key
// ----------------------------------------------------------------------------

/// Symmetric key for one connection's lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Fresh random key from the OS generator
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> core::result::Result<Self, CryptographicError> {
        let key: [u8; SESSION_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptographicError::InvalidKeyLength {
                    expected: SESSION_KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedPayload> {
        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptographicError::EncryptionFailed)?;
        Ok(SealedPayload { ciphertext, iv })
    }

    /// Decrypt and authenticate
    pub fn open(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != NONCE_LEN {
            return Err(CryptographicError::InvalidNonceLength {
                expected: NONCE_LEN,
                actual: iv.len(),
            }
            .into());
        }
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        Ok(plaintext)
    }

    /// Decrypt base64 ciphertext and IV into UTF-8 text
    pub fn open_text(&self, ciphertext_b64: &str, iv_b64: &str) -> Result<String> {
        let ciphertext = decode_b64(ciphertext_b64)?;
        let iv = decode_b64(iv_b64)?;
        let plaintext = self.open(&ciphertext, &iv)?;
        String::from_utf8(plaintext).map_err(|_| CryptographicError::DecryptionFailed.into())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Ciphertext together with the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
}

impl SealedPayload {
    pub fn ciphertext_b64(&self) -> String {
        encode_b64(&self.ciphertext)
    }

    pub fn iv_b64(&self) -> String {
        encode_b64(&self.iv)
    }
}

// ----------------------------------------------------------------------------
// Key Wrapping
// ----------------------------------------------------------------------------

/// Wrap a session key for the holder of `public_key_pem`, returning base64
pub fn wrap_session_key(public_key_pem: &str, key: &SessionKey) -> Result<String> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem.trim())
        .map_err(|e| CryptographicError::InvalidKeyFormat(e.to_string()))?;
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptographicError::KeyWrapFailed(e.to_string()))?;
    Ok(encode_b64(&wrapped))
}

/// The responder's RSA key pair
#[derive(Clone)]
pub struct ServerKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl ServerKeyPair {
    /// Generate a new key pair with a `bits`-bit modulus
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptographicError::KeyGenerationFailed(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pem = pem.trim();
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptographicError::InvalidKeyFormat(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Read a PEM private key from disk
    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// SPKI PEM encoding of the public half, as served out-of-band
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptographicError::InvalidKeyFormat(e.to_string()).into())
    }

    /// Decode and unwrap a base64 wrapped session key
    pub fn unwrap_session_key(&self, wrapped_b64: &str) -> Result<SessionKey> {
        let wrapped = decode_b64(wrapped_b64)?;
        let raw = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|e| CryptographicError::KeyUnwrapFailed(e.to_string()))?;
        Ok(SessionKey::from_slice(&raw)?)
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair").finish_non_exhaustive()
    }
}

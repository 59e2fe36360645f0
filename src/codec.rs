//! Authenticated encryption of protocol envelopes.
//!
//! Messages are encrypted with AES-128-CBC (PKCS#7, fresh random IV) and the
//! encoded envelope is signed with HMAC-SHA256. Opening a message verifies the
//! signature first and fails closed: a bad signature, malformed envelope or
//! bad padding all surface as [`Error::Integrity`] with no plaintext.
use std::fmt;

use aes::Aes128;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rsa::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block and IV size.
pub const IV_LEN: usize = 16;
/// Required encryption key length.
pub const ENCRYPTION_KEY_LEN: usize = 16;

/// Symmetric keys for one session.
#[derive(Clone)]
pub struct CryptoContext {
    encryption_key: [u8; ENCRYPTION_KEY_LEN],
    signing_key: Vec<u8>,
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext").finish_non_exhaustive()
    }
}

/// The JSON document carried inside every encrypted header or payload chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptionEnvelope {
    keyid: String,
    iv: String,
    ciphertext: String,
    #[serde(default)]
    sha256: String,
}

/// An encoded envelope and the signature over exactly those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub envelope: Vec<u8>,
    pub signature: Vec<u8>,
}

impl CryptoContext {
    /// Build a context from raw session keys.
    pub fn new(encryption_key: &[u8], signing_key: &[u8]) -> Result<Self> {
        let encryption_key: [u8; ENCRYPTION_KEY_LEN] = encryption_key.try_into().map_err(|_| {
            Error::Handshake(format!(
                "Invalid encryption key length: expected {}, got {}",
                ENCRYPTION_KEY_LEN,
                encryption_key.len()
            ))
        })?;
        if signing_key.is_empty() {
            return Err(Error::Handshake("Signing key is empty".to_string()));
        }
        Ok(Self {
            encryption_key,
            signing_key: signing_key.to_vec(),
        })
    }

    /// Encrypt `plaintext` under a fresh IV and sign the resulting envelope.
    pub fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<SignedEnvelope> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new(&self.encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let b64 = base64::engine::general_purpose::STANDARD;
        let envelope = serde_json::to_vec(&EncryptionEnvelope {
            keyid: key_id.to_string(),
            iv: b64.encode(iv),
            ciphertext: b64.encode(ciphertext),
            sha256: "AA==".to_string(),
        })?;
        let signature = self.sign(&envelope)?;

        Ok(SignedEnvelope {
            envelope,
            signature,
        })
    }

    /// Verify and decrypt a signed envelope.
    pub fn decrypt(&self, sealed: &SignedEnvelope) -> Result<Vec<u8>> {
        self.verify(&sealed.envelope, &sealed.signature)?;

        let envelope: EncryptionEnvelope = serde_json::from_slice(&sealed.envelope)
            .map_err(|e| Error::Integrity(format!("Malformed envelope: {}", e)))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let iv: [u8; IV_LEN] = b64
            .decode(&envelope.iv)
            .ok()
            .and_then(|iv| iv.try_into().ok())
            .ok_or_else(|| Error::Integrity("Malformed envelope IV".to_string()))?;
        let ciphertext = b64
            .decode(&envelope.ciphertext)
            .map_err(|e| Error::Integrity(format!("Malformed ciphertext: {}", e)))?;

        Aes128CbcDec::new(&self.encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Error::Integrity("Invalid padding".to_string()))
    }

    /// HMAC-SHA256 over `data` with the session signing key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time signature check.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| Error::Integrity("Signature mismatch".to_string()))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| Error::Integrity(format!("Invalid HMAC key: {}", e)))
    }
}

/// Tracks the last accepted inbound (message id, sequence number) pair.
///
/// Pairs must strictly increase for the lifetime of one response.
#[derive(Debug, Default, Clone)]
pub struct ReplayGuard {
    last: Option<(u64, u64)>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `(message_id, sequence)` or reject it as a replay.
    pub fn accept(&mut self, message_id: u64, sequence: u64) -> Result<()> {
        let received = (message_id, sequence);
        if let Some(last) = self.last {
            if received <= last {
                return Err(Error::Replay { last, received });
            }
        }
        self.last = Some(received);
        Ok(())
    }

    pub fn last(&self) -> Option<(u64, u64)> {
        self.last
    }
}

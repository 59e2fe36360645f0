//! Device identity used for entity authentication and key exchange.
//!
//! A device is an ESN (electronic serial number) plus an RSA keypair. The
//! public half is offered in the handshake key request; the service wraps the
//! session keys to it with RSA-OAEP.

use std::path::Path;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::{Error, Result};

/// Default modulus size for generated device keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Process-wide device identity.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    esn: String,
    private_key: RsaPrivateKey,
}

impl DeviceIdentity {
    /// Create an identity from an ESN and an existing private key.
    pub fn new(esn: impl Into<String>, private_key: RsaPrivateKey) -> Result<Self> {
        let esn = esn.into();
        validate_esn(&esn)?;
        Ok(Self { esn, private_key })
    }

    /// Create an identity with a freshly generated RSA key.
    pub fn generate(esn: impl Into<String>, bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
        Self::new(esn, private_key)
    }

    /// Load the private key from a PEM file (PKCS#8 or PKCS#1).
    pub fn from_pem_path<P: AsRef<Path>>(esn: impl Into<String>, path: P) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(esn, &pem)
    }

    /// Parse the private key from PEM text (PKCS#8 or PKCS#1).
    pub fn from_pem(esn: impl Into<String>, pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::Config(format!("Failed to parse device key: {}", e)))?;
        Self::new(esn, private_key)
    }

    /// Load the key at `path`, or generate and save one if the file is absent.
    pub fn load_or_generate<P: AsRef<Path>>(esn: impl Into<String>, path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_pem_path(esn, path);
        }
        let identity = Self::generate(esn, DEFAULT_KEY_BITS)?;
        identity.save_pem(path)?;
        Ok(identity)
    }

    /// Write the private key as PKCS#8 PEM.
    pub fn save_pem<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Config(format!("Failed to encode device key: {}", e)))?;
        crate::utils::atomic_write(path.as_ref(), pem.as_bytes())?;
        Ok(())
    }

    pub fn esn(&self) -> &str {
        &self.esn
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// SubjectPublicKeyInfo DER of the public key, as sent in key requests.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.public_key()
            .to_public_key_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|e| Error::Handshake(format!("Failed to encode public key: {}", e)))
    }

    /// Unwrap a key the service encrypted to this device (RSA-OAEP, SHA-1).
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha1>(), wrapped)
            .map_err(|e| Error::Handshake(format!("Failed to unwrap session key: {}", e)))
    }
}

fn validate_esn(esn: &str) -> Result<()> {
    if esn.trim().is_empty() {
        return Err(Error::Config("ESN must not be empty".to_string()));
    }
    if esn.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Config(format!("ESN contains whitespace: {:?}", esn)));
    }
    Ok(())
}

//! Wire framing for protocol messages.
//!
//! A message is a JSON header object followed by one or more JSON payload
//! chunk objects, concatenated without separators. Handshake messages carry
//! entity authentication and a plaintext header; every other message carries a
//! master token and encrypted, signed header and payload envelopes.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{EntityAuthData, UserAuthData};
use crate::codec::{CryptoContext, SignedEnvelope};
use crate::error::{Error, Result};

/// Recipient name expected by the service.
pub const RECIPIENT: &str = "Netflix";
/// Key exchange scheme requested in handshakes.
pub const KEYX_SCHEME: &str = "ASYMMETRIC_WRAPPED";
/// Key exchange mechanism requested in handshakes.
pub const KEYX_MECHANISM: &str = "JWK_RSA";
/// Compression algorithm name for gzip payloads.
pub const GZIP: &str = "GZIP";
/// Upper bound on the inflated size of one payload chunk.
pub const MAX_INFLATED_PAYLOAD: u64 = 32 * 1024 * 1024;

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Service-issued token referencing negotiated session keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterToken {
    pub tokendata: String,
    pub signature: String,
}

/// Decoded `tokendata` of a master token.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterTokenData {
    pub sequencenumber: u64,
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub renewalwindow: Option<u64>,
    #[serde(default)]
    pub serialnumber: Option<u64>,
}

impl MasterToken {
    pub fn data(&self) -> Result<MasterTokenData> {
        let bytes = b64().decode(&self.tokendata)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCapabilities {
    pub compressionalgos: Vec<String>,
    pub languages: Vec<String>,
    pub encoderformats: Vec<String>,
}

impl MessageCapabilities {
    pub fn new(languages: &[String]) -> Self {
        Self {
            compressionalgos: vec![GZIP.to_string()],
            languages: languages.to_vec(),
            encoderformats: vec!["JSON".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestData {
    pub scheme: String,
    pub keydata: KeyRequestKeyData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestKeyData {
    pub keypairid: String,
    pub mechanism: String,
    pub publickey: String,
}

/// Plaintext header data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderData {
    pub messageid: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub handshake: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<MessageCapabilities>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default)]
    pub nonreplayable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyrequestdata: Vec<KeyRequestData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyresponsedata: Option<KeyResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userauthdata: Option<UserAuthData>,
}

/// Key response carried in a handshake reply header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponseData {
    pub scheme: String,
    pub keydata: KeyResponseKeyData,
    pub mastertoken: MasterToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponseKeyData {
    #[serde(default)]
    pub keypairid: Option<String>,
    /// RSA-wrapped JWK holding the encryption key.
    pub encryptionkey: String,
    /// RSA-wrapped JWK holding the HMAC key.
    pub hmackey: String,
}

/// A symmetric key in JWK form, as unwrapped from a key response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub k: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

/// Plaintext payload chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadChunk {
    pub messageid: u64,
    pub sequencenumber: u64,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub endofmsg: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressionalgo: Option<String>,
}

impl PayloadChunk {
    /// Wrap application bytes, optionally gzip-compressed.
    pub fn with_data(messageid: u64, sequencenumber: u64, data: &[u8], compress: bool) -> Result<Self> {
        let (data, compressionalgo) = if compress {
            (gzip(data)?, Some(GZIP.to_string()))
        } else {
            (data.to_vec(), None)
        };
        Ok(Self {
            messageid,
            sequencenumber,
            data: b64().encode(data),
            endofmsg: true,
            compressionalgo,
        })
    }

    /// Decoded (and decompressed) application bytes.
    pub fn application_data(&self) -> Result<Vec<u8>> {
        let raw = b64().decode(&self.data)?;
        match self.compressionalgo.as_deref() {
            Some(algo) if algo.eq_ignore_ascii_case(GZIP) => gunzip(&raw, MAX_INFLATED_PAYLOAD),
            Some(other) => Err(Error::Service(format!("Unsupported compression {}", other))),
            None => Ok(raw),
        }
    }
}

/// Error header returned by the service instead of a normal header.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub errorcode: Option<Value>,
    #[serde(default)]
    pub internalcode: Option<Value>,
    #[serde(default)]
    pub errormsg: Option<String>,
    #[serde(default)]
    pub messageid: Option<u64>,
}

impl ErrorData {
    pub fn code(&self) -> String {
        match &self.errorcode {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    pub fn describe(&self) -> String {
        let msg = self.errormsg.as_deref().unwrap_or("unknown error");
        match self.code().as_str() {
            "" => msg.to_string(),
            code => format!("{} ({})", msg, code),
        }
    }

    /// Whether the service is asking for fresh user credentials.
    pub fn requires_user_reauth(&self) -> bool {
        let code = self.code().to_ascii_uppercase();
        code.contains("USERDATA_REAUTH") || code.contains("USER_REAUTH") || code.contains("SSOTOKEN_REJECTED")
    }

    /// Whether the service no longer honours the master token the message
    /// was sent under, so a fresh key exchange is needed.
    pub fn rejects_master_token(&self) -> bool {
        let code = self.code().to_ascii_uppercase();
        code.starts_with("MASTERTOKEN_") || code == "KEYX_REQUIRED" || code == "ENTITYDATA_REAUTH"
    }
}

/// Serialize a handshake message: plaintext header plus an empty payload.
pub fn encode_handshake(entity: &EntityAuthData, header: &HeaderData) -> Result<Vec<u8>> {
    let header_json = serde_json::to_vec(header)?;
    let mut out = serde_json::to_vec(&serde_json::json!({
        "entityauthdata": entity,
        "headerdata": b64().encode(header_json),
        "signature": "",
    }))?;
    let chunk = serde_json::to_vec(&PayloadChunk {
        messageid: header.messageid,
        sequencenumber: 1,
        data: String::new(),
        endofmsg: true,
        compressionalgo: None,
    })?;
    out.extend(serde_json::to_vec(&serde_json::json!({
        "payload": b64().encode(chunk),
        "signature": "",
    }))?);
    Ok(out)
}

/// Serialize an encrypted message referencing a master token.
pub fn encode_encrypted(
    crypto: &CryptoContext,
    key_id: &str,
    master_token: &MasterToken,
    header: &HeaderData,
    chunk: &PayloadChunk,
) -> Result<Vec<u8>> {
    let header_env = crypto.encrypt(&serde_json::to_vec(header)?, key_id)?;
    let mut out = serde_json::to_vec(&serde_json::json!({
        "headerdata": b64().encode(&header_env.envelope),
        "signature": b64().encode(&header_env.signature),
        "mastertoken": master_token,
    }))?;
    let chunk_env = crypto.encrypt(&serde_json::to_vec(chunk)?, key_id)?;
    out.extend(serde_json::to_vec(&signed_object("payload", &chunk_env))?);
    Ok(out)
}

fn signed_object(field: &str, env: &SignedEnvelope) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(field.to_string(), Value::String(b64().encode(&env.envelope)));
    map.insert("signature".to_string(), Value::String(b64().encode(&env.signature)));
    Value::Object(map)
}

/// A response split into its header object and payload chunk objects.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub header: Value,
    pub chunks: Vec<Value>,
}

impl RawResponse {
    /// Split a concatenated JSON object stream.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut objects = serde_json::Deserializer::from_slice(body)
            .into_iter::<Value>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Transport(format!("Malformed response stream: {}", e)))?
            .into_iter();
        let header = objects
            .next()
            .ok_or_else(|| Error::Transport("Empty response".to_string()))?;
        Ok(Self {
            header,
            chunks: objects.collect(),
        })
    }

    /// Decoded error header, if the service returned one.
    pub fn error_data(&self) -> Option<ErrorData> {
        let encoded = self.header.get("errordata")?.as_str()?;
        let bytes = b64().decode(encoded).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Plaintext header of a handshake response.
    pub fn plaintext_header(&self) -> Result<HeaderData> {
        let encoded = string_field(&self.header, "headerdata")?;
        Ok(serde_json::from_slice(&b64().decode(encoded)?)?)
    }

    /// Verify and decrypt the header of a session response.
    pub fn encrypted_header(&self, crypto: &CryptoContext) -> Result<HeaderData> {
        let env = signed_envelope(&self.header, "headerdata")?;
        let plain = crypto.decrypt(&env)?;
        serde_json::from_slice(&plain).map_err(|e| Error::Integrity(format!("Malformed header: {}", e)))
    }

    /// Verify and decrypt every payload chunk, in order.
    pub fn payload_chunks(&self, crypto: &CryptoContext) -> Result<Vec<PayloadChunk>> {
        self.chunks
            .iter()
            .map(|chunk| {
                let env = signed_envelope(chunk, "payload")?;
                let plain = crypto.decrypt(&env)?;
                serde_json::from_slice(&plain)
                    .map_err(|e| Error::Integrity(format!("Malformed payload chunk: {}", e)))
            })
            .collect()
    }
}

fn string_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Integrity(format!("Missing {}", field)))
}

fn signed_envelope(value: &Value, field: &str) -> Result<SignedEnvelope> {
    let decode = |name: &str| {
        b64()
            .decode(string_field(value, name)?)
            .map_err(|e| Error::Integrity(format!("Malformed {}: {}", name, e)))
    };
    Ok(SignedEnvelope {
        envelope: decode(field)?,
        signature: decode("signature")?,
    })
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::Service(format!("Failed to inflate payload: {}", e)))?;
    if out.len() as u64 > limit {
        return Err(Error::Service(format!("Inflated payload exceeds {} bytes", limit)));
    }
    Ok(out)
}

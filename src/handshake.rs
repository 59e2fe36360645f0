//! Key exchange with the service.
//!
//! A handshake sends the device public key (SPKI DER) together with entity
//! and user authentication. The service answers with a master token and two
//! JWKs wrapped to that key: the AES encryption key and the HMAC key. The
//! negotiator unwraps both, validates them and returns [`SessionKeys`].
use base64::Engine;
use rsa::rand_core::{OsRng, RngCore};

use crate::auth::{CookieSet, EntityAuthenticator, UserAuthenticator};
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::keystore::SessionKeyStore;
use crate::message::{
    encode_handshake, HeaderData, Jwk, KeyRequestData, KeyRequestKeyData, KeyResponseData,
    MessageCapabilities, RawResponse, KEYX_MECHANISM, KEYX_SCHEME, RECIPIENT,
};
use crate::session::SessionKeys;
use crate::transport::Transport;
use crate::utils::{decode_jwk_key, short_fingerprint};

/// Key pair id sent with key requests.
pub const KEY_PAIR_ID: &str = "superKeyPair";

/// Handshake lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No keys, nothing in flight.
    Idle,
    /// Key request sent, waiting for the response.
    KeyExchangeSent,
    /// Keys validated and usable.
    Established,
    /// Keys passed their validity window.
    Expired,
}

/// Runs one key exchange at a time over a transport.
pub struct HandshakeNegotiator<'a> {
    device: &'a DeviceIdentity,
    user_auth: &'a UserAuthenticator,
    transport: &'a dyn Transport,
    store: Option<&'a SessionKeyStore>,
    ttl_secs: u64,
    languages: Vec<String>,
    state: HandshakeState,
}

impl<'a> HandshakeNegotiator<'a> {
    pub fn new(
        device: &'a DeviceIdentity,
        user_auth: &'a UserAuthenticator,
        transport: &'a dyn Transport,
        ttl_secs: u64,
    ) -> Self {
        Self {
            device,
            user_auth,
            transport,
            store: None,
            ttl_secs,
            languages: vec!["en-US".to_string()],
            state: HandshakeState::Idle,
        }
    }

    /// Persist established keys to `store`.
    pub fn store(mut self, store: &'a SessionKeyStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Move an established handshake to [`HandshakeState::Expired`] once
    /// `keys` run out at `now`.
    pub fn observe(&mut self, keys: &SessionKeys, now: u64) -> HandshakeState {
        if self.state == HandshakeState::Established && keys.is_expired_at(now) {
            debug!("Session keys expired at {}", keys.expires_at());
            self.state = HandshakeState::Expired;
        }
        self.state
    }

    /// Negotiate fresh session keys for the account behind `cookies`.
    ///
    /// Keys are written to the store only once fully validated; a failed
    /// exchange leaves the cache untouched.
    ///
    /// Missing or malformed cookies fail with [`Error::Authentication`]
    /// before anything is sent. Every other failure, including transport
    /// errors, is reported as [`Error::Handshake`] unless the service
    /// explicitly rejected the user credentials.
    pub fn negotiate(&mut self, cookies: &CookieSet, now: u64) -> Result<SessionKeys> {
        let userauth = self.user_auth.claim(cookies)?;
        let fingerprint = self.user_auth.fingerprint(cookies)?;
        let entity = EntityAuthenticator::claim(self.device);

        let publickey = base64::engine::general_purpose::STANDARD.encode(self.device.public_key_der()?);
        let header = HeaderData {
            messageid: OsRng.next_u64() & ((1 << 52) - 1),
            renewable: true,
            handshake: true,
            capabilities: Some(MessageCapabilities::new(&self.languages)),
            timestamp: now,
            sender: Some(self.device.esn().to_string()),
            nonreplayable: false,
            recipient: Some(RECIPIENT.to_string()),
            keyrequestdata: vec![KeyRequestData {
                scheme: KEYX_SCHEME.to_string(),
                keydata: KeyRequestKeyData {
                    keypairid: KEY_PAIR_ID.to_string(),
                    mechanism: KEYX_MECHANISM.to_string(),
                    publickey,
                },
            }],
            keyresponsedata: None,
            userauthdata: Some(userauth),
        };
        let body = encode_handshake(&entity, &header)?;

        self.state = HandshakeState::KeyExchangeSent;
        info!("Sending key exchange for {} as {}", short_fingerprint(&fingerprint), self.device.esn());

        let result = self
            .transport
            .exchange(&body)
            .and_then(|response| self.complete(&response, fingerprint, now));

        match result {
            Ok(keys) => {
                self.state = HandshakeState::Established;
                info!(
                    "Key exchange complete: sequence {} valid until {}",
                    keys.sequence_number,
                    keys.expires_at()
                );
                if let Some(store) = self.store {
                    if let Err(e) = store.put(keys.clone()) {
                        warn!("Keys negotiated but not cached: {}", e);
                    }
                }
                Ok(keys)
            }
            Err(e) => {
                self.state = HandshakeState::Idle;
                warn!("Key exchange failed: {}", e);
                Err(match e {
                    Error::Authentication(_) | Error::Handshake(_) => e,
                    other => Error::Handshake(other.to_string()),
                })
            }
        }
    }

    fn complete(&self, response: &[u8], fingerprint: String, now: u64) -> Result<SessionKeys> {
        let raw = RawResponse::parse(response)?;
        if let Some(err) = raw.error_data() {
            return Err(if err.requires_user_reauth() {
                Error::Authentication(err.describe())
            } else {
                Error::Handshake(format!("Service rejected key exchange: {}", err.describe()))
            });
        }

        let header = raw.plaintext_header()?;
        let response = header
            .keyresponsedata
            .ok_or_else(|| Error::Handshake("Response carries no key response data".to_string()))?;
        let KeyResponseData {
            scheme,
            keydata,
            mastertoken,
        } = response;
        if scheme != KEYX_SCHEME {
            return Err(Error::Handshake(format!("Unexpected key exchange scheme {}", scheme)));
        }

        let encryption_key = self.unwrap_jwk(&keydata.encryptionkey, "encryption")?;
        let signing_key = self.unwrap_jwk(&keydata.hmackey, "HMAC")?;
        let token = mastertoken.data()?;

        let keys = SessionKeys {
            fingerprint,
            encryption_key,
            signing_key,
            master_token: mastertoken,
            sequence_number: token.sequencenumber,
            created_at: now,
            ttl_secs: self.ttl_secs,
            token_expiration: token.expiration,
        };
        keys.crypto()?;
        Ok(keys)
    }

    fn unwrap_jwk(&self, wrapped: &str, what: &str) -> Result<Vec<u8>> {
        let wrapped = base64::engine::general_purpose::STANDARD.decode(wrapped)?;
        let plain = self.device.unwrap_key(&wrapped)?;
        let jwk: Jwk = serde_json::from_slice(&plain)
            .map_err(|e| Error::Handshake(format!("Malformed {} key: {}", what, e)))?;
        decode_jwk_key(&jwk.k).map_err(|e| Error::Handshake(format!("Malformed {} key: {}", what, e)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Oaep, RsaPublicKey};
    use serde_json::json;
    use sha1::Sha1;

    use super::*;

    const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

    /// Answers key requests with fixed keys, or with a canned body.
    struct KeyService {
        canned: Option<Vec<u8>>,
        seen: Mutex<Vec<serde_json::Value>>,
    }

    impl KeyService {
        fn new() -> Self {
            Self {
                canned: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn wrap(public: &RsaPublicKey, key: &[u8]) -> String {
            let jwk = json!({ "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key), "kty": "oct" });
            let wrapped = public
                .encrypt(&mut OsRng, Oaep::new::<Sha1>(), jwk.to_string().as_bytes())
                .unwrap();
            B64.encode(wrapped)
        }
    }

    impl Transport for KeyService {
        fn exchange(&self, body: &[u8]) -> Result<Vec<u8>> {
            if let Some(canned) = &self.canned {
                return Ok(canned.clone());
            }
            let raw = RawResponse::parse(body)?;
            self.seen.lock().unwrap().push(raw.header.clone());
            let header = raw.plaintext_header()?;
            let request = &header.keyrequestdata[0].keydata;
            let public = RsaPublicKey::from_public_key_der(&B64.decode(&request.publickey)?).unwrap();

            let tokendata = B64.encode(json!({ "sequencenumber": 3, "expiration": 5000 }).to_string());
            let reply = json!({
                "messageid": header.messageid + 1,
                "keyresponsedata": {
                    "scheme": KEYX_SCHEME,
                    "keydata": {
                        "keypairid": KEY_PAIR_ID,
                        "encryptionkey": Self::wrap(&public, &[9u8; 16]),
                        "hmackey": Self::wrap(&public, &[8u8; 32]),
                    },
                    "mastertoken": { "tokendata": tokendata, "signature": "c2ln" },
                }
            });
            let body = json!({ "headerdata": B64.encode(reply.to_string()), "signature": "" });
            Ok(body.to_string().into_bytes())
        }
    }

    struct Unreachable;

    impl Transport for Unreachable {
        fn exchange(&self, _body: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Transport("connection refused".to_string()))
        }
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity::generate("NFCDIE-02-TEST", 1024).unwrap()
    }

    fn cookies() -> CookieSet {
        [("NetflixId", "id"), ("SecureNetflixId", "secure")].into_iter().collect()
    }

    #[test]
    fn negotiate_unwraps_keys_and_token() {
        let device = device();
        let auth = UserAuthenticator::default();
        let service = KeyService::new();
        let mut negotiator = HandshakeNegotiator::new(&device, &auth, &service, 36_000);
        assert_eq!(negotiator.state(), HandshakeState::Idle);

        let keys = negotiator.negotiate(&cookies(), 1000).unwrap();
        assert_eq!(negotiator.state(), HandshakeState::Established);
        assert_eq!(keys.encryption_key, vec![9u8; 16]);
        assert_eq!(keys.signing_key, vec![8u8; 32]);
        assert_eq!(keys.sequence_number, 3);
        assert_eq!(keys.expires_at(), 5000);
        assert_eq!(keys.fingerprint, auth.fingerprint(&cookies()).unwrap());

        let seen = service.seen.lock().unwrap();
        assert_eq!(seen[0]["entityauthdata"]["authdata"]["identity"], "NFCDIE-02-TEST");
    }

    #[test]
    fn established_keys_are_stored() {
        let device = device();
        let auth = UserAuthenticator::default();
        let store = SessionKeyStore::in_memory();
        let keys = HandshakeNegotiator::new(&device, &auth, &KeyService::new(), 100)
            .store(&store)
            .negotiate(&cookies(), 10)
            .unwrap();
        assert_eq!(store.get(&keys.fingerprint, 11), Some(keys));

        let failed = HandshakeNegotiator::new(&device, &auth, &Unreachable, 100)
            .store(&store)
            .negotiate(&cookies(), 20);
        assert!(failed.is_err());
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn expiry_is_observed() {
        let device = device();
        let auth = UserAuthenticator::default();
        let service = KeyService::new();
        let mut negotiator = HandshakeNegotiator::new(&device, &auth, &service, 100);
        let keys = negotiator.negotiate(&cookies(), 1000).unwrap();
        assert_eq!(negotiator.observe(&keys, 1099), HandshakeState::Established);
        assert_eq!(negotiator.observe(&keys, 1100), HandshakeState::Expired);
    }

    #[test]
    fn missing_cookies_fail_before_sending() {
        let device = device();
        let auth = UserAuthenticator::default();
        let service = KeyService::new();
        let mut negotiator = HandshakeNegotiator::new(&device, &auth, &service, 100);
        let err = negotiator.negotiate(&CookieSet::new(), 0).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(service.seen.lock().unwrap().is_empty());
        assert_eq!(negotiator.state(), HandshakeState::Idle);
    }

    #[test]
    fn transport_failure_is_handshake_error() {
        let device = device();
        let auth = UserAuthenticator::default();
        let mut negotiator = HandshakeNegotiator::new(&device, &auth, &Unreachable, 100);
        let err = negotiator.negotiate(&cookies(), 0).unwrap_err();
        assert!(matches!(err, Error::Handshake(ref m) if m.contains("connection refused")));
        assert!(err.is_retryable());
    }

    #[test]
    fn service_error_maps_by_code() {
        let device = device();
        let auth = UserAuthenticator::default();
        let reply = |code: &str| {
            let data = B64.encode(json!({ "errorcode": code, "errormsg": "nope" }).to_string());
            json!({ "errordata": data, "signature": "" }).to_string().into_bytes()
        };

        let service = KeyService {
            canned: Some(reply("USERDATA_REAUTH")),
            seen: Mutex::new(Vec::new()),
        };
        let err = HandshakeNegotiator::new(&device, &auth, &service, 100)
            .negotiate(&cookies(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        let service = KeyService {
            canned: Some(reply("ENTITY_REAUTH")),
            seen: Mutex::new(Vec::new()),
        };
        let err = HandshakeNegotiator::new(&device, &auth, &service, 100)
            .negotiate(&cookies(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn garbage_response_is_handshake_error() {
        let device = device();
        let auth = UserAuthenticator::default();
        let service = KeyService {
            canned: Some(b"<html>503</html>".to_vec()),
            seen: Mutex::new(Vec::new()),
        };
        let err = HandshakeNegotiator::new(&device, &auth, &service, 100)
            .negotiate(&cookies(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }
}

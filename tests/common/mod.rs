//! In-process stand-in for the manifest service.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use rsa::pkcs8::DecodePublicKey;
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Oaep, RsaPublicKey};
use serde_json::{json, Value};
use sha1::Sha1;

use rsmsl::auth::CookieSet;
use rsmsl::codec::CryptoContext;
use rsmsl::error::{Error, Result};
use rsmsl::message::{encode_encrypted, HeaderData, MasterToken, PayloadChunk, RawResponse, RECIPIENT};
use rsmsl::transport::Transport;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Issued session: keys plus the master token that references them.
struct Issued {
    crypto: CryptoContext,
    token: MasterToken,
    /// Last manifest reply sent under this session.
    last_reply: Option<Vec<u8>>,
}

pub struct FakeService {
    manifest: Value,
    issued: Mutex<Vec<Issued>>,
    handshakes: AtomicUsize,
    manifests: AtomicUsize,
    handshake_delay: Duration,
    manifest_delay: Duration,
    /// Corrupt the signature of the next N manifest responses.
    tamper: AtomicUsize,
    /// Answer the next N manifest requests with an earlier reply.
    replay: AtomicUsize,
    /// Answer the next N manifest requests with a header and no payload.
    header_only: AtomicUsize,
    last_profiles: Mutex<Value>,
    /// Fail the next N handshakes with a service error.
    reject_handshakes: AtomicUsize,
    saw_user_auth: AtomicBool,
}

impl FakeService {
    pub fn new(manifest: Value) -> Self {
        Self {
            manifest,
            issued: Mutex::new(Vec::new()),
            handshakes: AtomicUsize::new(0),
            manifests: AtomicUsize::new(0),
            handshake_delay: Duration::ZERO,
            manifest_delay: Duration::ZERO,
            tamper: AtomicUsize::new(0),
            replay: AtomicUsize::new(0),
            header_only: AtomicUsize::new(0),
            last_profiles: Mutex::new(Value::Null),
            reject_handshakes: AtomicUsize::new(0),
            saw_user_auth: AtomicBool::new(false),
        }
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub fn with_manifest_delay(mut self, delay: Duration) -> Self {
        self.manifest_delay = delay;
        self
    }

    pub fn replay_next(&self, count: usize) {
        self.replay.store(count, Ordering::SeqCst);
    }

    pub fn header_only_next(&self, count: usize) {
        self.header_only.store(count, Ordering::SeqCst);
    }

    /// `params.profiles` of the last manifest request.
    pub fn last_profiles(&self) -> Value {
        self.last_profiles.lock().unwrap().clone()
    }

    pub fn tamper_next(&self, count: usize) {
        self.tamper.store(count, Ordering::SeqCst);
    }

    pub fn reject_next_handshakes(&self, count: usize) {
        self.reject_handshakes.store(count, Ordering::SeqCst);
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn manifests(&self) -> usize {
        self.manifests.load(Ordering::SeqCst)
    }

    pub fn saw_user_auth(&self) -> bool {
        self.saw_user_auth.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn error_reply(code: &str, message: &str) -> Vec<u8> {
        let data = B64.encode(json!({ "errorcode": code, "errormsg": message }).to_string());
        json!({ "errordata": data, "signature": "" }).to_string().into_bytes()
    }

    fn wrap(public: &RsaPublicKey, key: &[u8]) -> String {
        let jwk = json!({
            "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key),
            "kty": "oct",
        });
        let wrapped = public
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), jwk.to_string().as_bytes())
            .expect("wrap key");
        B64.encode(wrapped)
    }

    fn handshake(&self, raw: &RawResponse) -> Result<Vec<u8>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.handshake_delay);
        if Self::take(&self.reject_handshakes) {
            return Ok(Self::error_reply("ENTITY_REAUTH", "try again"));
        }

        let header = raw.plaintext_header()?;
        if header.userauthdata.is_some() {
            self.saw_user_auth.store(true, Ordering::SeqCst);
        }
        let request = &header.keyrequestdata[0].keydata;
        let public = RsaPublicKey::from_public_key_der(&B64.decode(&request.publickey)?)
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let mut encryption_key = [0u8; 16];
        let mut hmac_key = [0u8; 32];
        OsRng.fill_bytes(&mut encryption_key);
        OsRng.fill_bytes(&mut hmac_key);

        let mut issued = self.issued.lock().unwrap();
        let sequence = issued.len() as u64 + 1;
        let token = MasterToken {
            tokendata: B64.encode(json!({ "sequencenumber": sequence, "serialnumber": 42 }).to_string()),
            signature: B64.encode(b"token-signature"),
        };
        issued.push(Issued {
            crypto: CryptoContext::new(&encryption_key, &hmac_key)?,
            token: token.clone(),
            last_reply: None,
        });

        let reply = json!({
            "messageid": header.messageid + 1,
            "keyresponsedata": {
                "scheme": "ASYMMETRIC_WRAPPED",
                "keydata": {
                    "keypairid": "superKeyPair",
                    "encryptionkey": Self::wrap(&public, &encryption_key),
                    "hmackey": Self::wrap(&public, &hmac_key),
                },
                "mastertoken": token,
            }
        });
        Ok(json!({ "headerdata": B64.encode(reply.to_string()), "signature": "" })
            .to_string()
            .into_bytes())
    }

    fn manifest(&self, raw: &RawResponse) -> Result<Vec<u8>> {
        self.manifests.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.manifest_delay);
        let token: MasterToken = serde_json::from_value(raw.header["mastertoken"].clone())?;
        let mut issued = self.issued.lock().unwrap();
        let Some(session) = issued.iter_mut().find(|s| s.token == token) else {
            return Ok(Self::error_reply("MASTERTOKEN_UNTRUSTED", "unknown master token"));
        };

        let header = raw.encrypted_header(&session.crypto)?;
        if header.userauthdata.is_some() {
            self.saw_user_auth.store(true, Ordering::SeqCst);
        }
        let mut request = Vec::new();
        for chunk in raw.payload_chunks(&session.crypto)? {
            request.extend(chunk.application_data()?);
        }
        let request: Value = serde_json::from_slice(&request)?;
        assert_eq!(request["url"], "/manifest");
        *self.last_profiles.lock().unwrap() = request["params"]["profiles"].clone();

        if Self::take(&self.replay) {
            if let Some(previous) = &session.last_reply {
                return Ok(previous.clone());
            }
            // Nothing sent yet on this session: echo the request's own id.
            return self.reply(session, header.messageid);
        }

        let reply = self.reply(session, header.messageid + 1)?;
        session.last_reply = Some(reply.clone());

        if Self::take(&self.header_only) {
            return Ok(serde_json::to_vec(&RawResponse::parse(&reply)?.header)?);
        }
        if Self::take(&self.tamper) {
            let mut raw = RawResponse::parse(&reply)?;
            raw.chunks[0]["signature"] = Value::String(B64.encode([7u8; 32]));
            let mut out = serde_json::to_vec(&raw.header)?;
            out.extend(serde_json::to_vec(&raw.chunks[0])?);
            return Ok(out);
        }
        Ok(reply)
    }

    fn reply(&self, session: &Issued, messageid: u64) -> Result<Vec<u8>> {
        let reply_header = HeaderData {
            messageid,
            renewable: false,
            handshake: false,
            capabilities: None,
            timestamp: 0,
            sender: Some(RECIPIENT.to_string()),
            nonreplayable: false,
            recipient: None,
            keyrequestdata: Vec::new(),
            keyresponsedata: None,
            userauthdata: None,
        };
        let body = json!({
            "version": 2,
            "result": self.manifest.clone(),
        });
        let chunk = PayloadChunk::with_data(messageid, 1, body.to_string().as_bytes(), true)?;
        encode_encrypted(&session.crypto, "server", &session.token, &reply_header, &chunk)
    }
}

impl Transport for FakeService {
    fn exchange(&self, body: &[u8]) -> Result<Vec<u8>> {
        let raw = RawResponse::parse(body)?;
        if raw.header.get("entityauthdata").is_some() {
            self.handshake(&raw)
        } else {
            self.manifest(&raw)
        }
    }
}

pub fn cookies() -> CookieSet {
    [("NetflixId", "v%3D3%26ct%3DBQAOAAEB"), ("SecureNetflixId", "v%3D3%26mac%3DAQEAEQAB")]
        .into_iter()
        .collect()
}

pub fn title_manifest() -> Value {
    json!({
        "movieId": 81215567,
        "video_tracks": [{
            "title": "Arcane",
            "streams": [
                { "content_profile": "hevc-dv5-main10-L51-dash-cenc", "res_w": 3840, "res_h": 2160, "bitrate": 16000 },
                { "content_profile": "hevc-hdr-main10-L51-dash-cenc", "res_w": 3840, "res_h": 2160, "bitrate": 15500 },
                { "content_profile": "hevc-main10-L41-dash-cenc", "res_w": 1920, "res_h": 1080, "bitrate": 5800 }
            ]
        }],
        "audio_tracks": [{
            "language": "en",
            "streams": [
                { "content_profile": "ddplus-atmos-dash", "channels": "5.1", "isAtmos": true, "bitrate": 768 },
                { "content_profile": "dd-5.1-dash", "channels": "5.1", "bitrate": 448 }
            ]
        }],
        "timedtexttracks": [
            { "trackId": "T:en", "language": "en", "trackType": "PRIMARY" },
            { "trackId": "T:en-sdh", "language": "en", "trackType": "ASSISTIVE" },
            { "isNoneTrack": true }
        ]
    })
}

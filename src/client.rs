//! Manifest lookups over an established session.
//!
//! [`ManifestClient`] owns the device identity, transport and key store. A
//! lookup resolves the account's session (live, cached or freshly
//! negotiated), sends one encrypted manifest request, verifies and decrypts
//! the reply, then parses and classifies it.
//!
//! Negotiation is single-flight per account: concurrent lookups that miss the
//! cache queue on a per-fingerprint lock and the followers pick up the
//! leader's session instead of starting their own handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::auth::{CookieSet, UserAuthData, UserAuthenticator};
use crate::classify::{CapabilitySet, FormatClassifier};
use crate::config::{ClientConfig, RetryPolicy};
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::handshake::HandshakeNegotiator;
use crate::keystore::SessionKeyStore;
use crate::manifest::{ManifestParser, ParsedManifest, Representation, TextTrack};
use crate::message::{encode_encrypted, HeaderData, MessageCapabilities, PayloadChunk, RawResponse, RECIPIENT};
use crate::request::ManifestRequestBuilder;
use crate::session::Session;
use crate::transport::Transport;
use crate::utils::{short_fingerprint, unix_now};

/// Source of the current unix time.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        unix_now()
    }
}

/// Result of one manifest lookup.
#[derive(Debug, Clone, Serialize)]
pub struct Lookup {
    pub asset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub capabilities: CapabilitySet,
    pub representations: Vec<Representation>,
    pub text_tracks: Vec<TextTrack>,
    pub warnings: Vec<String>,
}

impl Lookup {
    /// Classify an already parsed manifest.
    pub fn from_parsed(asset_id: &str, parsed: ParsedManifest, classifier: &FormatClassifier) -> Self {
        let mut warnings: Vec<String> = parsed.warnings.iter().map(ToString::to_string).collect();
        if let Some(err) = &parsed.error {
            warn!("Manifest for {} not interpreted: {}", asset_id, err);
            warnings.push(err.to_string());
        }
        let classification = classifier.classify(&parsed.representations);
        warnings.extend(classification.warnings);
        Lookup {
            asset_id: asset_id.to_string(),
            title: parsed.title,
            capabilities: classification.capabilities,
            representations: parsed.representations,
            text_tracks: parsed.text_tracks,
            warnings,
        }
    }
}

type NegotiationLocks = Mutex<HashMap<String, Arc<Mutex<()>>>>;

pub struct ManifestClient {
    device: DeviceIdentity,
    transport: Arc<dyn Transport>,
    store: Arc<SessionKeyStore>,
    config: ClientConfig,
    user_auth: UserAuthenticator,
    parser: ManifestParser,
    classifier: FormatClassifier,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    negotiations: NegotiationLocks,
}

impl ManifestClient {
    pub fn new(
        device: DeviceIdentity,
        transport: Arc<dyn Transport>,
        store: Arc<SessionKeyStore>,
        config: ClientConfig,
    ) -> Self {
        Self {
            user_auth: UserAuthenticator::new(config.cookie_names.clone()),
            classifier: FormatClassifier::new(config.rules.clone()),
            parser: ManifestParser::new(),
            clock: Arc::new(SystemClock),
            sessions: Mutex::new(HashMap::new()),
            negotiations: Mutex::new(HashMap::new()),
            device,
            transport,
            store,
            config,
        }
    }

    /// Build a client from configuration alone: HTTPS transport, device key
    /// loaded or generated at `device_key_path`, cache at `cache_path`.
    #[cfg(feature = "http")]
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let device = match &config.device_key_path {
            Some(path) => DeviceIdentity::load_or_generate(config.esn.clone(), path)?,
            None => DeviceIdentity::generate(config.esn.clone(), crate::device::DEFAULT_KEY_BITS)?,
        };
        let transport = crate::transport::HttpTransport::new(config.endpoint.clone(), config.timeout())?;
        let store = match &config.cache_path {
            Some(path) => SessionKeyStore::open(path),
            None => SessionKeyStore::in_memory(),
        };
        Ok(Self::new(device, Arc::new(transport), Arc::new(store), config))
    }

    /// Replace the clock used for key expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionKeyStore {
        &self.store
    }

    /// Fetch and classify the manifest for `asset_id`.
    ///
    /// `profiles` overrides the configured profile tokens. A manifest that
    /// cannot be interpreted is not an error: the lookup succeeds with a
    /// default capability set and a warning.
    pub fn lookup(&self, asset_id: &str, cookies: &CookieSet, profiles: Option<&[String]>) -> Result<Lookup> {
        let userauth = self.user_auth.claim(cookies)?;
        let fingerprint = self.user_auth.fingerprint(cookies)?;

        let request = ManifestRequestBuilder::new(asset_id)
            .profiles(profiles.unwrap_or(&self.config.profiles).iter().cloned())
            .output_constraints(self.config.output.clone())
            .languages(self.config.languages.clone())
            .client_version(self.config.client_version.clone(), self.config.ui_version.clone())
            .build(self.device.esn())?;
        let payload = request.to_payload(self.clock.now().saturating_mul(1000));

        let mut renegotiated = false;
        let body = loop {
            let session = self.session_for(&fingerprint, cookies)?;
            match self.exchange(&session, &userauth, &payload) {
                Ok(body) => break body,
                Err(e) if e.forces_renegotiation() => {
                    warn!("Discarding session after failed exchange: {}", e);
                    self.discard_session(&fingerprint, &session);
                    if renegotiated {
                        return Err(e);
                    }
                    renegotiated = true;
                }
                Err(e) => return Err(e),
            }
        };

        let parsed = match serde_json::from_slice::<Value>(&body) {
            Ok(value) => {
                service_error(&value)?;
                self.parser.parse(&value)
            }
            // Empty or non-JSON payloads are reported, not fatal.
            Err(_) => self.parser.parse_slice(&body),
        };
        let lookup = Lookup::from_parsed(&request.asset_id, parsed, &self.classifier);
        info!("{}: {}", lookup.asset_id, lookup.capabilities.badges().join(", "));
        Ok(lookup)
    }

    /// Drop the live and cached session for the account behind `cookies`.
    pub fn clear_session(&self, cookies: &CookieSet) -> Result<()> {
        let fingerprint = self.user_auth.fingerprint(cookies)?;
        self.with_negotiation_lock(&fingerprint, || {
            self.sessions
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&fingerprint);
            if let Err(e) = self.store.invalidate(&fingerprint) {
                warn!("{}", e);
            }
        });
        Ok(())
    }

    /// A usable session from memory or the key cache.
    fn cached_session(&self, fingerprint: &str) -> Option<Arc<Session>> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get(fingerprint) {
            if !session.is_expired_at(now) {
                return Some(session.clone());
            }
            debug!("Live session for {} expired", short_fingerprint(fingerprint));
            sessions.remove(fingerprint);
        }

        let keys = self.store.get(fingerprint, now)?;
        match Session::new(keys) {
            Ok(session) => {
                let session = Arc::new(session);
                sessions.insert(fingerprint.to_string(), session.clone());
                debug!("Resumed cached session for {}", short_fingerprint(fingerprint));
                Some(session)
            }
            Err(e) => {
                warn!("Discarding unusable cached keys: {}", e);
                if let Err(e) = self.store.invalidate(fingerprint) {
                    warn!("{}", e);
                }
                None
            }
        }
    }

    /// Run `f` holding the account's negotiation lock. The lock entry is
    /// dropped again once no other caller holds or waits on it.
    fn with_negotiation_lock<T>(&self, fingerprint: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .negotiations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(fingerprint.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };

        let mut locks = self.negotiations.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map and this call still reference it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(fingerprint);
        }
        result
    }

    fn session_for(&self, fingerprint: &str, cookies: &CookieSet) -> Result<Arc<Session>> {
        if let Some(session) = self.cached_session(fingerprint) {
            return Ok(session);
        }

        self.with_negotiation_lock(fingerprint, || -> Result<Arc<Session>> {
            if let Some(session) = self.cached_session(fingerprint) {
                debug!("Joined session negotiated by a concurrent lookup");
                return Ok(session);
            }

            let keys = self.negotiate_with_retry(cookies)?;
            let session = Arc::new(Session::new(keys)?);
            self.sessions
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(fingerprint.to_string(), session.clone());
            Ok(session)
        })
    }

    #[cfg(test)]
    fn negotiation_locks(&self) -> usize {
        self.negotiations.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn negotiate_with_retry(&self, cookies: &CookieSet) -> Result<crate::session::SessionKeys> {
        let RetryPolicy { attempts, .. } = self.config.retry;
        let mut attempt = 1;
        loop {
            let mut negotiator = HandshakeNegotiator::new(
                &self.device,
                &self.user_auth,
                self.transport.as_ref(),
                self.config.key_ttl_secs,
            )
            .store(&self.store)
            .languages(self.config.languages.clone());

            match negotiator.negotiate(cookies, self.clock.now()) {
                Ok(keys) => return Ok(keys),
                Err(e @ Error::Handshake(_)) if attempt < attempts => {
                    let delay = self.config.retry.delay(attempt);
                    warn!("Handshake attempt {}/{} failed, retrying in {:?}: {}", attempt, attempts, delay, e);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forget `failed` unless another lookup already replaced it.
    fn discard_session(&self, fingerprint: &str, failed: &Arc<Session>) {
        self.with_negotiation_lock(fingerprint, || {
            let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            if sessions.get(fingerprint).is_some_and(|s| Arc::ptr_eq(s, failed)) {
                sessions.remove(fingerprint);
            }
            drop(sessions);
            let cached = self.store.get(fingerprint, 0);
            if cached.is_some_and(|keys| keys.master_token == failed.keys().master_token) {
                if let Err(e) = self.store.invalidate(fingerprint) {
                    warn!("{}", e);
                }
            }
        });
    }

    /// One encrypted request/response round trip on `session`, returning the
    /// decrypted application data.
    fn exchange(&self, session: &Session, userauth: &UserAuthData, payload: &Value) -> Result<Vec<u8>> {
        let keys = session.keys();
        let crypto = session.crypto();
        let esn = self.device.esn();

        let mut exchange = session.begin_exchange();
        let message_id = exchange.message_id();
        let header = HeaderData {
            messageid: message_id,
            renewable: true,
            handshake: false,
            capabilities: Some(MessageCapabilities::new(&self.config.languages)),
            timestamp: self.clock.now(),
            sender: Some(esn.to_string()),
            nonreplayable: false,
            recipient: Some(RECIPIENT.to_string()),
            keyrequestdata: Vec::new(),
            keyresponsedata: None,
            userauthdata: Some(userauth.clone()),
        };
        let chunk = PayloadChunk::with_data(message_id, 1, &serde_json::to_vec(payload)?, self.config.compress_requests)?;
        let body = encode_encrypted(crypto, &keys.key_id(esn), &keys.master_token, &header, &chunk)?;

        debug!("Sending manifest request {}", message_id);
        let response = self.transport.exchange(&body)?;
        let raw = RawResponse::parse(&response)?;
        if let Some(err) = raw.error_data() {
            return Err(if err.requires_user_reauth() {
                Error::Authentication(err.describe())
            } else if err.rejects_master_token() {
                Error::SessionRejected(err.describe())
            } else {
                Error::Service(err.describe())
            });
        }

        let header = raw.encrypted_header(crypto)?;
        exchange.accept_header(header.messageid)?;
        let mut data = Vec::new();
        for chunk in raw.payload_chunks(crypto)? {
            if chunk.messageid != header.messageid {
                return Err(Error::Integrity(format!(
                    "Payload chunk for message {} in response {}",
                    chunk.messageid, header.messageid
                )));
            }
            exchange.accept_chunk(chunk.messageid, chunk.sequencenumber)?;
            data.extend(chunk.application_data()?);
        }
        if data.is_empty() {
            debug!("Response {} carried no payload", header.messageid);
        }
        Ok(data)
    }
}

/// Application-level error object in a decrypted response.
fn service_error(value: &Value) -> Result<()> {
    let Some(error) = value.get("error") else {
        return Ok(());
    };
    let detail = error
        .get("display")
        .or_else(|| error.get("detail"))
        .or_else(|| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Err(Error::Service(detail))
}

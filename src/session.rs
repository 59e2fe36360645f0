//! Session keys and the per-session runtime state built on top of them.
//!
//! [`SessionKeys`] is the persisted product of a handshake. [`Session`] wraps
//! a validated copy for use by concurrent lookups: the keys are read-only, and
//! each round trip runs as an [`Exchange`] that checks its own response
//! against replay.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use rsa::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::codec::{CryptoContext, ReplayGuard};
use crate::error::{Error, Result};
use crate::message::MasterToken;

/// Keys negotiated for one account, bound to its fingerprint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionKeys {
    /// Account fingerprint the keys were negotiated for.
    pub fingerprint: String,
    /// AES-128 encryption key.
    #[serde(with = "b64")]
    pub encryption_key: Vec<u8>,
    /// HMAC-SHA256 signing key.
    #[serde(with = "b64")]
    pub signing_key: Vec<u8>,
    /// Master token issued by the service.
    pub master_token: MasterToken,
    /// Sequence number embedded in the master token.
    pub sequence_number: u64,
    /// Unix seconds at which the handshake completed.
    pub created_at: u64,
    /// Local validity window in seconds.
    pub ttl_secs: u64,
    /// Service-declared expiration (unix seconds), if the token carried one.
    #[serde(default)]
    pub token_expiration: Option<u64>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("fingerprint", &self.fingerprint)
            .field("sequence_number", &self.sequence_number)
            .field("created_at", &self.created_at)
            .field("ttl_secs", &self.ttl_secs)
            .field("token_expiration", &self.token_expiration)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Unix seconds at which these keys stop being usable.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        let local = self.created_at.saturating_add(self.ttl_secs);
        match self.token_expiration {
            Some(service) => local.min(service),
            None => local,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Key identifier carried in every encryption envelope.
    #[must_use]
    pub fn key_id(&self, esn: &str) -> String {
        format!("{}_{}", esn, self.sequence_number)
    }

    pub fn crypto(&self) -> Result<CryptoContext> {
        CryptoContext::new(&self.encryption_key, &self.signing_key)
    }
}

/// Message-id bookkeeping shared by the exchanges running on one session.
#[derive(Debug)]
struct ExchangeState {
    next_message_id: u64,
    /// Request ids whose responses are still outstanding.
    in_flight: BTreeSet<u64>,
    /// Response ids already consumed that a live request could still match.
    answered: BTreeSet<u64>,
}

impl ExchangeState {
    fn new(start: u64) -> Self {
        Self {
            next_message_id: start & MESSAGE_ID_MASK,
            in_flight: BTreeSet::new(),
            answered: BTreeSet::new(),
        }
    }

    /// Reserve the message id for the next outbound message.
    fn allocate_message_id(&mut self) -> u64 {
        self.next_message_id = self.next_message_id.wrapping_add(1) & MESSAGE_ID_MASK;
        self.next_message_id
    }

    /// Claim `response_id` as the answer to `request_id`.
    ///
    /// A response must advance past its request and may be consumed once.
    fn claim_response(&mut self, request_id: u64, response_id: u64) -> Result<()> {
        if response_id <= request_id || !self.answered.insert(response_id) {
            return Err(Error::Replay {
                last: (request_id, 0),
                received: (response_id, 0),
            });
        }
        Ok(())
    }

    fn begin(&mut self) -> u64 {
        let id = self.allocate_message_id();
        self.in_flight.insert(id);
        id
    }

    fn finish(&mut self, request_id: u64) {
        self.in_flight.remove(&request_id);
        // Answers at or below the oldest live request can no longer pass the
        // advance check, so they need not be remembered.
        let floor = self.in_flight.first().copied().unwrap_or(self.next_message_id);
        self.answered = self.answered.split_off(&floor.saturating_add(1));
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Message ids are 52-bit values.
const MESSAGE_ID_MASK: u64 = (1 << 52) - 1;

/// A live session shared by lookups for one account.
#[derive(Debug)]
pub struct Session {
    keys: SessionKeys,
    crypto: CryptoContext,
    state: Mutex<ExchangeState>,
}

impl Session {
    /// Validate `keys` and start with a random message id.
    pub fn new(keys: SessionKeys) -> Result<Self> {
        let start = OsRng.next_u64() & (MESSAGE_ID_MASK >> 1);
        Self::with_message_id(keys, start)
    }

    pub fn with_message_id(keys: SessionKeys, start: u64) -> Result<Self> {
        let crypto = keys.crypto()?;
        Ok(Self {
            keys,
            crypto,
            state: Mutex::new(ExchangeState::new(start)),
        })
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.keys.is_expired_at(now)
    }

    fn state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start one request/response round trip.
    ///
    /// The session lock is only taken for id bookkeeping, so exchanges on the
    /// same session may overlap on the network.
    pub fn begin_exchange(&self) -> Exchange<'_> {
        let message_id = self.state().begin();
        Exchange {
            session: self,
            message_id,
            inbound: ReplayGuard::new(),
        }
    }

    pub fn exchanges_in_flight(&self) -> usize {
        self.state().in_flight()
    }
}

/// One outstanding request on a [`Session`].
#[derive(Debug)]
pub struct Exchange<'a> {
    session: &'a Session,
    message_id: u64,
    inbound: ReplayGuard,
}

impl Exchange<'_> {
    /// Message id of the outbound request.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Check the response header's message id.
    pub fn accept_header(&mut self, response_id: u64) -> Result<()> {
        self.session.state().claim_response(self.message_id, response_id)?;
        self.inbound.accept(response_id, 0)
    }

    /// Check a response payload chunk.
    pub fn accept_chunk(&mut self, message_id: u64, sequence: u64) -> Result<()> {
        self.inbound.accept(message_id, sequence)
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        self.session.state().finish(self.message_id);
    }
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

//! Authenticated encryption for the tunnel
//!
//! ChaCha20-Poly1305 envelopes with HKDF-SHA256 directional keys
//! derived from the pre-shared secret. Query-direction envelopes carry
//! a Unix timestamp inside the authenticated plaintext so recorded
//! packets cannot be replayed later; the response direction is bound to
//! the live in-flight query and omits it.
//!
//! Envelope layout: `nonce(12) || ciphertext`, where the nonce is an
//! 8-byte big-endian monotonic counter followed by 4 random bytes.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Size of encryption keys in bytes
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Counter portion of the nonce
pub const NONCE_COUNTER_SIZE: usize = 8;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Timestamp prefix size inside query-direction plaintext
pub const TIMESTAMP_SIZE: usize = 4;

/// Time window for replay protection and timestamp freshness
pub const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Tolerated forward clock skew on received timestamps
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// HKDF info for the client-to-server key
const CONTEXT_CLIENT_TO_SERVER: &[u8] = b"client-to-server";

/// HKDF info for the server-to-client key
const CONTEXT_SERVER_TO_CLIENT: &[u8] = b"server-to-client";

/// Errors produced by the envelope layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid encryption key")]
    InvalidKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    SealFailed,

    #[error("decryption failed")]
    OpenFailed,

    #[error("message timestamp too old")]
    MessageTooOld,

    #[error("message timestamp too far in future")]
    MessageTooNew,

    #[error("system random generator failed")]
    Rng,
}

/// Which end of the tunnel this cipher belongs to. The role selects
/// which directional key seals and which opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Directional AEAD cipher with a process-lifetime nonce counter.
///
/// Safe to share across workers: sealing only touches the atomic
/// counter and the system RNG.
pub struct Cipher {
    seal_key: LessSafeKey,
    open_key: LessSafeKey,
    counter: AtomicU64,
    rng: SystemRandom,
}

impl Cipher {
    /// Builds a cipher from the pre-shared secret. Secrets shorter than
    /// 16 bytes are rejected; the canonical size is 32.
    pub fn new(shared_secret: &[u8], role: Role) -> Result<Self, CryptoError> {
        if shared_secret.len() < 16 {
            return Err(CryptoError::InvalidKey);
        }

        let client_to_server = derive_key(shared_secret, CONTEXT_CLIENT_TO_SERVER)?;
        let server_to_client = derive_key(shared_secret, CONTEXT_SERVER_TO_CLIENT)?;

        let (seal, open) = match role {
            Role::Client => (client_to_server, server_to_client),
            Role::Server => (server_to_client, client_to_server),
        };

        Ok(Cipher {
            seal_key: aead_key(&seal)?,
            open_key: aead_key(&open)?,
            counter: AtomicU64::new(0),
            rng: SystemRandom::new(),
        })
    }

    /// Seals `plaintext` with the current timestamp prepended inside
    /// the authenticated payload (query direction).
    pub fn seal_timestamped(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let timestamp = unix_now() as u32;
        let mut payload = Vec::with_capacity(TIMESTAMP_SIZE + plaintext.len());
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend_from_slice(plaintext);
        self.seal(&payload)
    }

    /// Opens a query-direction envelope and verifies its timestamp
    /// against the freshness window.
    pub fn open_timestamped(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE + TIMESTAMP_SIZE + TAG_SIZE {
            return Err(CryptoError::OpenFailed);
        }

        let payload = self.open(data)?;
        if payload.len() < TIMESTAMP_SIZE {
            return Err(CryptoError::OpenFailed);
        }

        let timestamp =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
        let now = unix_now();

        if now > timestamp && now - timestamp > REPLAY_WINDOW.as_secs() {
            return Err(CryptoError::MessageTooOld);
        }
        if timestamp > now && timestamp - now > MAX_CLOCK_SKEW.as_secs() {
            return Err(CryptoError::MessageTooNew);
        }

        Ok(payload[TIMESTAMP_SIZE..].to_vec())
    }

    /// Seals `plaintext` without a timestamp (response direction).
    pub fn seal_untimestamped(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal(plaintext)
    }

    /// Opens a response-direction envelope.
    pub fn open_untimestamped(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::OpenFailed);
        }
        self.open(data)
    }

    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce()?;

        let mut out = Vec::with_capacity(NONCE_SIZE + payload.len() + TAG_SIZE);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(payload);

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let tag = self
            .seal_key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut out[NONCE_SIZE..])
            .map_err(|_| CryptoError::SealFailed)?;
        out.extend_from_slice(tag.as_ref());

        Ok(out)
    }

    fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(&data[..NONCE_SIZE]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = data[NONCE_SIZE..].to_vec();
        let plaintext = self
            .open_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::OpenFailed)?;

        Ok(plaintext.to_vec())
    }

    /// Next nonce: monotonic big-endian counter plus 4 random bytes.
    /// The counter carries uniqueness; the random tail is defence in
    /// depth only.
    fn next_nonce(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_COUNTER_SIZE].copy_from_slice(&counter.to_be_bytes());
        self.rng
            .fill(&mut nonce[NONCE_COUNTER_SIZE..])
            .map_err(|_| CryptoError::Rng)?;

        Ok(nonce)
    }
}

fn derive_key(secret: &[u8], context: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    struct KeyLen(usize);
    impl hkdf::KeyType for KeyLen {
        fn len(&self) -> usize {
            self.0
        }
    }

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(secret);

    let mut key = [0u8; KEY_SIZE];
    prk.expand(&[context], KeyLen(KEY_SIZE))
        .map_err(|_| CryptoError::KeyDerivation)?
        .fill(&mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(key)
}

fn aead_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The nonce prefix of a sealed envelope, used for replay tracking.
pub fn envelope_nonce(data: &[u8]) -> Option<[u8; NONCE_SIZE]> {
    let slice = data.get(..NONCE_SIZE)?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(slice);
    Some(nonce)
}

/// Tracks envelope nonces seen within a sliding window.
///
/// Entries older than the window are evicted by a background sweep at
/// half the window period. Construction must happen on a tokio runtime.
pub struct ReplayCache {
    seen: Arc<Mutex<HashMap<[u8; NONCE_SIZE], Instant>>>,
    window: Duration,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ReplayCache {
    pub fn new(window: Duration) -> Self {
        let seen: Arc<Mutex<HashMap<[u8; NONCE_SIZE], Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sweep_map = Arc::clone(&seen);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Instant::now() - window;
                let mut map = sweep_map.lock().expect("replay cache poisoned");
                map.retain(|_, first_seen| *first_seen > cutoff);
            }
        });

        ReplayCache {
            seen,
            window,
            sweeper,
        }
    }

    /// Returns true if the nonce was already observed inside the
    /// window; records it on first sight.
    pub fn check(&self, nonce: &[u8; NONCE_SIZE]) -> bool {
        let now = Instant::now();
        let mut map = self.seen.lock().expect("replay cache poisoned");
        match map.get(nonce) {
            Some(first_seen) if now.duration_since(*first_seen) <= self.window => true,
            _ => {
                map.insert(*nonce, now);
                false
            }
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("replay cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ReplayCache {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Generates a fresh random 32-byte secret.
pub fn generate_key() -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| CryptoError::Rng)?;
    Ok(key)
}

/// Parses a canonical 64-hex-character secret.
pub fn parse_hex_key(hex_key: &str) -> Result<Vec<u8>, CryptoError> {
    let hex_key = hex_key.trim();
    if hex_key.len() != KEY_SIZE * 2 {
        return Err(CryptoError::InvalidKey);
    }
    hex::decode(hex_key).map_err(|_| CryptoError::InvalidKey)
}

/// Formats a secret as lowercase hex.
pub fn format_hex_key(key: &[u8]) -> String {
    hex::encode(key)
}

//! API-key issuance, verification, and rate limiting.
//!
//! A key reads `hq_<prefix>_<secret>`: the 8-character prefix is public and
//! used for lookup; only the SHA-256 of the full key is stored. Verification
//! compares digests with a constant-time fold so timing does not leak how
//! much of a guess matched.

use chrono::Utc;
use dashmap::DashMap;
use hq_core::errors::HqError;
use hq_store::{ApiKeyRecord, Store};
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::AUTH_RATE_LIMITED_TOTAL;

/// Length of the public lookup prefix.
const PREFIX_LEN: usize = 8;
/// Length of the secret tail.
const SECRET_LEN: usize = 32;
/// Default refill (and burst) per minute for new keys.
const DEFAULT_RATE_LIMIT: u32 = 120;

/// A freshly generated key; `key` is shown to the caller exactly once.
#[derive(Debug)]
pub struct GeneratedKey {
    /// The full key text.
    pub key: String,
    /// The stored record (hash only).
    pub record: ApiKeyRecord,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Verifies API keys and enforces per-key token buckets.
pub struct ApiKeyService {
    store: Arc<Store>,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl ApiKeyService {
    /// New service over the store.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            buckets: DashMap::new(),
        }
    }

    /// Issue a new key with the default rate limit.
    pub fn generate(&self, name: &str) -> Result<GeneratedKey, HqError> {
        if name.trim().is_empty() {
            return Err(HqError::validation("Key name is required"));
        }
        let prefix = random_alphanumeric(PREFIX_LEN);
        let secret = random_alphanumeric(SECRET_LEN);
        let key = format!("hq_{prefix}_{secret}");
        let record = ApiKeyRecord {
            prefix,
            hash: sha256_hex(&key),
            name: name.trim().to_string(),
            rate_limit: DEFAULT_RATE_LIMIT,
            created_at: Utc::now(),
        };
        self.store.insert_api_key(&record)?;
        Ok(GeneratedKey { key, record })
    }

    /// Verify a presented key. Returns the record on success.
    pub fn verify(&self, presented: &str) -> Result<ApiKeyRecord, HqError> {
        let Some(prefix) = parse_prefix(presented) else {
            return Err(HqError::Unauthorized);
        };
        let Some(record) = self.store.get_api_key(prefix)? else {
            return Err(HqError::Unauthorized);
        };
        let digest = sha256_hex(presented);
        if !constant_time_eq(digest.as_bytes(), record.hash.as_bytes()) {
            return Err(HqError::Unauthorized);
        }
        Ok(record)
    }

    /// Take one token from the key's bucket, or report how long to wait.
    pub fn check_rate(&self, record: &ApiKeyRecord) -> Result<(), HqError> {
        let capacity = f64::from(record.rate_limit.max(1));
        let per_second = capacity / 60.0;
        let entry = self.buckets.entry(record.prefix.clone()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = entry.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_second).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - bucket.tokens;
        let retry_after_ms = (deficit / per_second * 1000.0).ceil() as u64;
        counter!(AUTH_RATE_LIMITED_TOTAL).increment(1);
        Err(HqError::RateLimit { retry_after_ms })
    }
}

fn parse_prefix(presented: &str) -> Option<&str> {
    let rest = presented.strip_prefix("hq_")?;
    // Key material is ASCII by construction; anything else is not ours.
    if !rest.is_ascii() || rest.len() < PREFIX_LEN + 1 {
        return None;
    }
    let (prefix, tail) = rest.split_at(PREFIX_LEN);
    tail.starts_with('_').then_some(prefix)
}

fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time byte comparison: the full inputs are always walked.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

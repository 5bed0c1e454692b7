//! # Protocol Configuration & Constants
//!
//! Every magic number in the ledger core lives here, next to the runtime
//! knobs in [`EngineConfig`]. If you're hardcoding a threshold somewhere
//! else, you're doing it wrong.
//!
//! Constants are the parts that cannot change without breaking existing
//! relationships (key sizes, KDF salt, iteration counts). `EngineConfig`
//! holds the parts an operator is expected to tune per deployment:
//! trust thresholds, composite weights, decay, challenge lifetimes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Category;
use crate::trust::{DecayPolicy, TrustWeights};

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Size of the master key minted on every successful pairing.
pub const MASTER_KEY_LENGTH: usize = 64;

/// Each participant receives exactly half of the master key.
pub const KEY_HALF_LENGTH: usize = MASTER_KEY_LENGTH / 2;

/// Reconstructed session keys are SHA-256 digests.
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length. 96 bits, the only length GCM is happy with.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Fixed salt for the channel key derivation. Both sides of a relationship
/// must use the same value, so this is a protocol constant, not config.
pub const CHANNEL_KDF_SALT: &[u8] = b"lct-protocol/channel/v1";

/// PBKDF2-HMAC-SHA256 iteration count for channel keys.
pub const CHANNEL_KDF_ITERATIONS: u32 = 100_000;

/// Lower bound we refuse to go under, even in tests.
pub const MIN_KDF_ITERATIONS: u32 = 10_000;

/// How many recent nonces a channel remembers for replay detection.
pub const CHANNEL_REPLAY_WINDOW: usize = 4_096;

/// Messages one channel key may seal before it must be replaced.
///
/// Random 96-bit nonces stay collision-safe up to 2^32 messages per key;
/// re-pair (fresh halves, fresh key) well before that.
pub const CHANNEL_MESSAGE_LIMIT: u64 = 1 << 32;

/// Length of the nonces participants attach to authentication proofs.
pub const PROOF_NONCE_LENGTH: usize = 32;

/// Length of the challenge nonce issued by the pairing engine.
pub const CHALLENGE_NONCE_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Domain separation tags
// ---------------------------------------------------------------------------

/// BLAKE3 context for relationship key fingerprints.
pub const DOMAIN_KEY_FINGERPRINT: &str = "lct-protocol 2026 key fingerprint";

/// BLAKE3 context for key-half references stored on relationship tokens.
pub const DOMAIN_KEY_HALF_REFERENCE: &str = "lct-protocol 2026 key half reference";

/// BLAKE3 context for tensor identifiers.
pub const DOMAIN_TENSOR_ID: &str = "lct-protocol 2026 tensor id";

/// BLAKE3 context for trust anchors.
pub const DOMAIN_TRUST_ANCHOR: &str = "lct-protocol 2026 trust anchor";

/// BLAKE3 context for recharge token ids, derived from the backing proof.
pub const DOMAIN_RECHARGE_TOKEN: &str = "lct-protocol 2026 recharge token";

/// Prefix mixed into the degraded master-key derivation.
pub const DEGRADED_KEY_PREFIX: &[u8] = b"lct-protocol/degraded-master-key/v1";

// ---------------------------------------------------------------------------
// Trust & Resource Defaults
// ---------------------------------------------------------------------------

/// Composite trust a relationship must reach before it may touch a pool.
pub const DEFAULT_TRUST_THRESHOLD: f64 = 0.6;

/// Default composite weights: capability, consistency, reliability.
pub const DEFAULT_CAPABILITY_WEIGHT: f64 = 0.3;
pub const DEFAULT_CONSISTENCY_WEIGHT: f64 = 0.4;
pub const DEFAULT_RELIABILITY_WEIGHT: f64 = 0.3;

/// Weights must sum to 1.0 within this tolerance.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Learning-rate bounds for evidence-weighted observations.
pub const MIN_LEARNING_RATE: f64 = 0.01;
pub const MAX_LEARNING_RATE: f64 = 0.5;

/// Evidence count that halves the learning rate.
pub const LEARNING_RATE_EVIDENCE_SCALE: f64 = 10.0;

/// Default pairing challenge lifetime (one hour).
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 3_600;

/// Longest challenge lifetime we accept (one week).
pub const MAX_CHALLENGE_TTL_SECS: u64 = 7 * 24 * 3_600;

/// Default lifetime of a request parked in a proxy's pairing queue (one day).
pub const DEFAULT_QUEUE_TTL_SECS: u64 = 24 * 3_600;

/// Longest queue lifetime we accept (thirty days).
pub const MAX_QUEUE_TTL_SECS: u64 = 30 * 24 * 3_600;

/// Delivery attempts before a queued request is marked failed.
pub const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 3;

/// Requests one proxy may hold queued at a time.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Retry backoff after a failed delivery: base doubles per attempt, capped.
pub const QUEUE_RETRY_BASE_SECS: i64 = 300;
pub const QUEUE_RETRY_MAX_SECS: i64 = 4_800;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("trust weights must sum to 1.0 (got {0})")]
    WeightsDoNotSumToOne(f64),

    #[error("trust threshold {value} for '{context}' is outside [0.0, 1.0]")]
    ThresholdOutOfRange { context: String, value: f64 },

    #[error("invalid decay policy: {0}")]
    InvalidDecay(String),

    #[error("challenge ttl {0}s is outside 1..={MAX_CHALLENGE_TTL_SECS}")]
    ChallengeTtlOutOfRange(u64),

    #[error("invalid pairing queue limits: {0}")]
    InvalidQueueLimits(String),
}

/// Runtime configuration shared by every engine.
///
/// Passed explicitly into the [`Ledger`](crate::ledger::Ledger); nothing
/// in the core reaches for a global default pool or threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threshold applied when a context has no explicit override.
    pub default_trust_threshold: f64,

    /// Per-context overrides for the trust threshold.
    pub context_thresholds: HashMap<String, f64>,

    /// Weights for the composite trust score.
    pub trust_weights: TrustWeights,

    /// Decay applied to composites when they are read.
    pub decay: DecayPolicy,

    /// Per-context decay overrides.
    pub context_decay: HashMap<String, DecayPolicy>,

    /// Lifetime of a pairing challenge, in seconds.
    pub challenge_ttl_secs: u64,

    /// Lifetime of a request waiting in a proxy's pairing queue, in seconds.
    pub queue_ttl_secs: u64,

    /// Delivery attempts per queued request before it is given up on.
    pub queue_max_attempts: u32,

    /// Queued requests one proxy may hold at once.
    pub queue_capacity: usize,

    /// Identity categories allowed to attest recharge proofs.
    pub producer_categories: Vec<Category>,

    /// Attributes that must be present at registration, per category.
    pub required_attributes: HashMap<Category, Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut required_attributes = HashMap::new();
        required_attributes.insert(Category::Device, vec!["manufacturer".to_string()]);

        Self {
            default_trust_threshold: DEFAULT_TRUST_THRESHOLD,
            context_thresholds: HashMap::new(),
            trust_weights: TrustWeights::default(),
            decay: DecayPolicy::Disabled,
            context_decay: HashMap::new(),
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            queue_ttl_secs: DEFAULT_QUEUE_TTL_SECS,
            queue_max_attempts: DEFAULT_QUEUE_MAX_ATTEMPTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            producer_categories: vec![Category::Service],
            required_attributes,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields fall back to [`EngineConfig::default`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant the engines rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.trust_weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE || !self.trust_weights.all_non_negative() {
            return Err(ConfigError::WeightsDoNotSumToOne(sum));
        }

        check_threshold("<default>", self.default_trust_threshold)?;
        for (context, value) in &self.context_thresholds {
            check_threshold(context, *value)?;
        }

        self.decay.validate().map_err(ConfigError::InvalidDecay)?;
        for policy in self.context_decay.values() {
            policy.validate().map_err(ConfigError::InvalidDecay)?;
        }

        if self.challenge_ttl_secs == 0 || self.challenge_ttl_secs > MAX_CHALLENGE_TTL_SECS {
            return Err(ConfigError::ChallengeTtlOutOfRange(self.challenge_ttl_secs));
        }
        if self.queue_ttl_secs == 0 || self.queue_ttl_secs > MAX_QUEUE_TTL_SECS {
            return Err(ConfigError::InvalidQueueLimits(format!(
                "ttl {}s is outside 1..={MAX_QUEUE_TTL_SECS}",
                self.queue_ttl_secs
            )));
        }
        if self.queue_max_attempts == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueLimits(
                "attempts and capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Threshold that gates resource operations in `context`.
    pub fn threshold_for(&self, context: &str) -> f64 {
        self.context_thresholds
            .get(context)
            .copied()
            .unwrap_or(self.default_trust_threshold)
    }

    /// Decay policy that applies to tensors in `context`.
    pub fn decay_for(&self, context: &str) -> &DecayPolicy {
        self.context_decay.get(context).unwrap_or(&self.decay)
    }

    /// Challenge lifetime, clamped to the accepted range.
    pub fn challenge_ttl(&self) -> chrono::Duration {
        let secs = self.challenge_ttl_secs.clamp(1, MAX_CHALLENGE_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Queue lifetime, clamped to the accepted range.
    pub fn queue_ttl(&self) -> chrono::Duration {
        let secs = self.queue_ttl_secs.clamp(1, MAX_QUEUE_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// How long to wait before delivery attempt `attempts + 1`.
    pub fn queue_retry_delay(&self, attempts: u32) -> chrono::Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let secs = (QUEUE_RETRY_BASE_SECS << shift).min(QUEUE_RETRY_MAX_SECS);
        chrono::Duration::seconds(secs)
    }

    /// Whether members of `category` may sign recharge proofs.
    pub fn is_producer(&self, category: Category) -> bool {
        self.producer_categories.contains(&category)
    }

    /// Attributes a registration of `category` must carry.
    pub fn required_attributes_for(&self, category: Category) -> &[String] {
        self.required_attributes
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn check_threshold(context: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::ThresholdOutOfRange {
            context: context.to_string(),
            value,
        });
    }
    Ok(())
}

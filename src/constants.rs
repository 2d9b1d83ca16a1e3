//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for RiskGuard.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// ============================================================================
// Regulatory Thresholds
// ============================================================================

/// Currency Transaction Report threshold (10,000 units).
///
/// A transaction at or above this amount must be flagged `CTR_REQUIRED` for
/// regulatory reporting. This is a fixed regulatory value, distinct from the
/// configurable per-tenant ceilings in [`AmlThresholds`].
///
/// [`AmlThresholds`]: crate::aml::AmlThresholds
pub const CTR_REPORTING_THRESHOLD: Decimal = dec!(10000);

/// Suspicious Activity Report structuring threshold (10,000 units).
///
/// Transactions deliberately kept just below this value are the structuring
/// pattern the detector looks for.
pub const STRUCTURING_THRESHOLD: Decimal = dec!(10000);

/// Lower bound of the structuring band, as a fraction of the threshold.
///
/// A transaction counts toward structuring when its amount falls in
/// `[STRUCTURING_BAND_RATIO * threshold, threshold)`.
pub const STRUCTURING_BAND_RATIO: Decimal = dec!(0.8);

/// Minimum number of in-band transactions within 24 hours to flag structuring.
pub const STRUCTURING_MIN_COUNT: usize = 3;

// ============================================================================
// AML Ledger Constants
// ============================================================================

/// Maximum transaction ledger entries kept per user.
///
/// When a user's ledger grows past this size, age-based pruning is attempted
/// (entries older than [`LEDGER_RETENTION_MS`] are dropped). Eviction is by
/// age first, never a plain truncate-to-N.
pub const MAX_LEDGER_ENTRIES: usize = 1000;

/// Ledger retention window used by overflow pruning (30 days).
pub const LEDGER_RETENTION_MS: i64 = 30 * MS_PER_DAY;

/// Rolling aggregate window: one day.
pub const DAILY_WINDOW_MS: i64 = MS_PER_DAY;

/// Rolling aggregate window: seven days.
pub const WEEKLY_WINDOW_MS: i64 = 7 * MS_PER_DAY;

/// Rolling aggregate window: thirty days.
pub const MONTHLY_WINDOW_MS: i64 = 30 * MS_PER_DAY;

/// Structuring detection lookback window (24 hours).
pub const STRUCTURING_WINDOW_MS: i64 = MS_PER_DAY;

// ============================================================================
// State Store Key Namespaces
// ============================================================================

/// Key prefix for rate-limit records.
pub const RATE_LIMIT_PREFIX: &str = "rl:";

/// Key prefix for account lockout records.
pub const LOCKOUT_PREFIX: &str = "lockout:";

/// Key prefix for the circuit-breaker collaborator's records.
///
/// The trading-halt state machine persists its records under this namespace;
/// only the record shape is defined here (see [`CircuitBreakerRecord`]).
///
/// [`CircuitBreakerRecord`]: crate::store::CircuitBreakerRecord
pub const CIRCUIT_BREAKER_PREFIX: &str = "cb:";

/// Maximum key component length accepted by the stores.
pub const MAX_KEY_COMPONENT_LENGTH: usize = 255;

/// Maximum total key length accepted by the stores.
pub const MAX_KEY_LENGTH: usize = 1024;

// ============================================================================
// Rate Limiter Constants
// ============================================================================

/// Default platform-wide per-IP ceiling (requests per window).
pub const DEFAULT_GLOBAL_LIMIT: u64 = 300;

/// Default global rate-limit window (1 minute).
pub const DEFAULT_GLOBAL_WINDOW_MS: u64 = 60_000;

/// Default high-water mark for the rate-limit namespace.
///
/// When the number of live `rl:` keys exceeds this mark, an opportunistic
/// sweep deletes records whose window has already expired.
pub const DEFAULT_HIGH_WATER_MARK: u64 = 10_000;

// ============================================================================
// Lockout Constants
// ============================================================================

/// Default failed-attempt threshold before an account is locked.
pub const DEFAULT_LOCKOUT_MAX_ATTEMPTS: u64 = 5;

/// Default explicit lock duration once the threshold is crossed (15 minutes).
pub const DEFAULT_LOCK_DURATION_MS: u64 = 15 * 60 * 1000;

/// Default rolling observation window anchored at the first failure (1 hour).
pub const DEFAULT_LOCKOUT_RESET_WINDOW_MS: u64 = 60 * 60 * 1000;

// ============================================================================
// Time Conversion Constants
// ============================================================================

/// Milliseconds per second.
pub const MS_PER_SECOND: i64 = 1000;

/// Milliseconds per day.
pub const MS_PER_DAY: i64 = 86_400_000;

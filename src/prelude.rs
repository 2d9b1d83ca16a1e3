//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from RiskGuard,
//! allowing users to import them with a single `use riskguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::RiskControlConfig;
pub use crate::error::{RiskGuardError, StorageError};
pub use crate::guard::RiskGuard;

// Guards
pub use crate::aml::{AmlCheckResult, AmlComplianceEngine, AmlThresholds, TransactionKind};
pub use crate::lockout::LockoutTracker;
pub use crate::rate_limiter::{RateLimitDecision, RateLimiter, RateLimitRejection};

// State store
pub use crate::store::{MemoryStateStore, StateStore};

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::redis_store::{RedisStateStore, RedisStoreConfig};

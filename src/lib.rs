//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! RiskGuard - Request-Path Risk Control Engine
//!
//! Provides rate limiting, account lockout tracking, and AML transaction
//! compliance for a multi-tenant trading platform.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use riskguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`RiskGuard`] - Facade constructed from configuration, owns the injected
//!   state store and the three guards
//! - [`RiskControlConfig`] - Configuration (YAML/TOML loadable)
//! - [`RiskGuardError`] - Error types
//!
//! ## Guards
//!
//! - [`RateLimiter`] - Fixed-window ceilings, global per-IP and per-feature
//!   composite keys, 429 rejection shape with agreeing `Retry-After`
//! - [`LockoutTracker`] - Failure counter with dual independent expiry
//! - [`AmlComplianceEngine`] - Single-limit, velocity, structuring and rolling
//!   aggregate checks over a bounded in-process ledger
//!
//! ## State store
//!
//! [`StateStore`] abstracts the shared key/value state with TTL and atomic
//! record increment. [`MemoryStateStore`] is always available; the distributed
//! Redis backend requires the `redis` feature.
//!
//! All guards fail open: a storage failure is logged and the request is
//! allowed, never rejected.
//!
//! # Examples
//!
//! ```rust
//! use riskguard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RiskGuardError> {
//!     let guard = RiskGuard::from_config(RiskControlConfig::default()).await?;
//!
//!     let decision = guard.check_request("203.0.113.7").await;
//!     assert!(decision.is_allowed());
//!
//!     guard.close().await
//! }
//! ```

pub mod prelude;

pub mod aml;
pub mod audit;
pub mod config;
pub mod constants;
pub mod error;
pub mod guard;
pub mod lockout;
#[cfg(feature = "redis")]
pub mod lua_scripts;
pub mod rate_limiter;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

// 重新导出常用类型
pub use aml::{
    AmlCheckResult, AmlComplianceEngine, AmlThresholds, ComplianceFlag, StructuringReport,
    TransactionKind, TransactionRecord,
};
pub use audit::{AuditEvent, AuditHandle, AuditLogConfig, AuditLogStats, AuditLogger};
pub use config::{LockoutConfig, RateLimitConfig, RiskControlConfig, ScopeRule, StoreConfig};
pub use error::{RiskGuardError, StorageError};
pub use guard::RiskGuard;
pub use lockout::LockoutTracker;
pub use rate_limiter::{
    RateLimitDecision, RateLimitRejection, RateLimiter, RateLimiterConfig,
};
pub use store::{
    get_record, set_record, CircuitBreakerRecord, LockoutRecord, MemoryStateStore,
    RateLimitRecord, StateStore,
};

#[cfg(feature = "redis")]
pub use redis_store::{RedisStateStore, RedisStoreConfig, RetryStats};

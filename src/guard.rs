//! 风控守卫
//!
//! 请求路径风控的统一入口：从配置显式构造状态存储（依赖注入，
//! 不使用进程级单例），持有限流器、锁定跟踪器和合规引擎，
//! 负责审计日志的装配与关停。

use crate::aml::{AmlCheckResult, AmlComplianceEngine, TransactionKind};
use crate::audit::{AuditLogConfig, AuditLogger};
use crate::config::RiskControlConfig;
use crate::error::RiskGuardError;
use crate::lockout::LockoutTracker;
use crate::rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterConfig};
use crate::store::{MemoryStateStore, StateStore};
use std::sync::Arc;
use tracing::{info, warn};

/// 风控守卫
pub struct RiskGuard {
    config: RiskControlConfig,
    store: Arc<dyn StateStore>,
    rate_limiter: RateLimiter,
    lockout: LockoutTracker,
    aml: AmlComplianceEngine,
    audit: Option<AuditLogger>,
}

impl RiskGuard {
    /// 从配置构造（根据配置选择存储后端）
    pub async fn from_config(config: RiskControlConfig) -> Result<Self, RiskGuardError> {
        config.validate().map_err(RiskGuardError::ConfigError)?;
        let store = Self::build_state_store(&config).await?;
        Ok(Self::assemble(config, store))
    }

    /// 使用注入的存储构造（测试或自定义后端）
    ///
    /// # Panics
    ///
    /// 审计启用时会通过 `tokio::spawn` 启动写入任务，因此必须在
    /// Tokio运行时上下文内调用；审计关闭时无此要求。
    pub fn with_store(
        config: RiskControlConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, RiskGuardError> {
        config.validate().map_err(RiskGuardError::ConfigError)?;
        Ok(Self::assemble(config, store))
    }

    fn assemble(config: RiskControlConfig, store: Arc<dyn StateStore>) -> Self {
        let audit = if config.audit.enabled {
            let mut audit_config = AuditLogConfig::default();
            if let Some(path) = &config.audit.output_path {
                audit_config = audit_config.output_path(path.clone());
            }
            Some(AuditLogger::new(audit_config))
        } else {
            None
        };

        let limiter_config = RateLimiterConfig::new()
            .global_limit(config.rate_limit.global_limit)
            .global_window_ms(config.rate_limit.global_window_ms)
            .high_water_mark(config.rate_limit.high_water_mark);

        let mut rate_limiter = RateLimiter::new(Arc::clone(&store), limiter_config);
        let mut lockout = LockoutTracker::new(Arc::clone(&store));
        let mut aml = AmlComplianceEngine::new(config.aml.clone());

        if let Some(audit) = &audit {
            rate_limiter = rate_limiter.with_audit(audit.handle());
            lockout = lockout.with_audit(audit.handle());
            aml = aml.with_audit(audit.handle());
        }

        info!("风控守卫已装配: version={}", config.version);

        Self {
            config,
            store,
            rate_limiter,
            lockout,
            aml,
            audit,
        }
    }

    /// 根据配置构造状态存储
    async fn build_state_store(
        config: &RiskControlConfig,
    ) -> Result<Arc<dyn StateStore>, RiskGuardError> {
        match &config.store.redis_url {
            Some(url) => Self::build_redis_store(url, config.store.redis_db).await,
            None => {
                info!("使用内存状态存储");
                Ok(Arc::new(MemoryStateStore::new()))
            }
        }
    }

    #[cfg(feature = "redis")]
    async fn build_redis_store(url: &str, db: i64) -> Result<Arc<dyn StateStore>, RiskGuardError> {
        let redis_config = crate::redis_store::RedisStoreConfig::new(url).db(db);
        let store = crate::redis_store::RedisStateStore::new(redis_config).await?;
        info!("使用Redis状态存储: {}", url);
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_store(url: &str, _db: i64) -> Result<Arc<dyn StateStore>, RiskGuardError> {
        Err(RiskGuardError::ConfigError(format!(
            "配置了redis_url（{}）但未启用redis特性",
            url
        )))
    }

    /// 全局限流检查（按客户端IP）
    pub async fn check_request(&self, ip: &str) -> RateLimitDecision {
        self.rate_limiter.check_ip(ip).await
    }

    /// 功能维度限流检查（上限取自配置的规则）
    ///
    /// 未配置该功能的规则时放行并记录警告。
    pub async fn check_scoped(&self, feature: &str, identity: &str) -> RateLimitDecision {
        match self.config.rate_limit.scope(feature) {
            Some(rule) => {
                self.rate_limiter
                    .check_scoped(feature, identity, rule.limit, rule.window_ms)
                    .await
            }
            None => {
                warn!("未配置功能限流规则，放行: feature={}", feature);
                RateLimitDecision::Allowed { remaining: u64::MAX }
            }
        }
    }

    /// 记录一次认证失败，达到阈值时自动设置显式锁定
    ///
    /// 返回累计失败次数（存储故障时为0，不触发锁定）。
    pub async fn record_auth_failure(&self, account: &str) -> u64 {
        let count = self.lockout.record_failure(account).await;

        if count >= self.config.lockout.max_attempts && count > 0 {
            let locked_until = chrono::Utc::now().timestamp_millis()
                + self.config.lockout.lock_duration_ms as i64;
            self.lockout.set_locked_until(account, locked_until).await;
        }

        count
    }

    /// 账户是否处于锁定状态
    pub async fn is_account_locked(&self, account: &str) -> bool {
        self.lockout.is_locked(account).await
    }

    /// 交易合规检查
    pub fn check_transaction(
        &self,
        user_id: &str,
        amount: rust_decimal::Decimal,
        kind: TransactionKind,
    ) -> AmlCheckResult {
        self.aml.check_compliance(user_id, amount, kind)
    }

    /// 清理过期的锁定记录，返回删除数量
    pub async fn cleanup(&self) -> u64 {
        self.lockout
            .cleanup_expired(self.config.lockout.reset_window_ms)
            .await
    }

    /// 限流器
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// 锁定跟踪器
    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    /// 合规引擎
    pub fn aml(&self) -> &AmlComplianceEngine {
        &self.aml
    }

    /// 当前配置
    pub fn config(&self) -> &RiskControlConfig {
        &self.config
    }

    /// 关闭守卫：关闭存储并冲刷审计日志
    pub async fn close(self) -> Result<(), RiskGuardError> {
        info!("关闭风控守卫");

        let Self {
            store,
            rate_limiter,
            lockout,
            aml,
            audit,
            ..
        } = self;

        // 先释放各守卫持有的审计句柄，写入任务才能在关停时退出
        drop(rate_limiter);
        drop(lockout);
        drop(aml);

        store.close().await?;

        if let Some(audit) = audit {
            audit.shutdown().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeRule;
    use rust_decimal_macros::dec;

    async fn guard_with(mut config: RiskControlConfig) -> RiskGuard {
        config.store.redis_url = None;
        RiskGuard::from_config(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_from_config_builds_memory_store() {
        let guard = guard_with(RiskControlConfig::default()).await;
        assert!(guard.check_request("1.2.3.4").await.is_allowed());
        guard.close().await.unwrap();
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_url_without_feature_is_config_error() {
        let mut config = RiskControlConfig::default();
        config.store.redis_url = Some("redis://127.0.0.1:6379".to_string());

        let result = RiskGuard::from_config(config).await;
        assert!(matches!(result, Err(RiskGuardError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_scoped_check_uses_configured_rule() {
        let mut config = RiskControlConfig::default();
        config.rate_limit.scopes = vec![ScopeRule {
            id: "bug-report-ip".to_string(),
            feature: "bug-report".to_string(),
            limit: 2,
            window_ms: 60_000,
        }];
        let guard = guard_with(config).await;

        assert!(guard.check_scoped("bug-report", "1.2.3.4").await.is_allowed());
        assert!(guard.check_scoped("bug-report", "1.2.3.4").await.is_allowed());
        assert!(!guard.check_scoped("bug-report", "1.2.3.4").await.is_allowed());

        // 未配置的功能放行
        assert!(guard.check_scoped("unknown", "1.2.3.4").await.is_allowed());
    }

    #[tokio::test]
    async fn test_auth_failure_threshold_locks_account() {
        let mut config = RiskControlConfig::default();
        config.lockout.max_attempts = 3;
        let guard = guard_with(config).await;

        guard.record_auth_failure("alice").await;
        guard.record_auth_failure("alice").await;
        assert!(!guard.is_account_locked("alice").await);

        let count = guard.record_auth_failure("alice").await;
        assert_eq!(count, 3);
        assert!(guard.is_account_locked("alice").await);
    }

    #[test]
    #[should_panic]
    fn test_with_store_audit_enabled_requires_runtime() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let _ = RiskGuard::with_store(RiskControlConfig::default(), store);
    }

    #[test]
    fn test_with_store_audit_disabled_works_without_runtime() {
        let mut config = RiskControlConfig::default();
        config.audit.enabled = false;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        assert!(RiskGuard::with_store(config, store).is_ok());
    }

    #[tokio::test]
    async fn test_check_transaction_delegates_to_engine() {
        let guard = guard_with(RiskControlConfig::default()).await;

        let result = guard.check_transaction("user-1", dec!(100), TransactionKind::Deposit);
        assert!(result.allowed);

        let result = guard.check_transaction("user-1", dec!(50000), TransactionKind::Withdrawal);
        assert!(!result.allowed);
    }
}

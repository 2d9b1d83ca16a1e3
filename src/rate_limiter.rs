//! 固定窗口限流器
//!
//! 基于状态存储的固定窗口限流：全局按客户端IP限流，按功能维度
//! 使用组合键（`<feature>:<identity>`）限流。存储故障时失败放行，
//! 限流永远不会因为存储不可用而拒绝请求。

use crate::audit::{AuditEvent, AuditHandle};
use crate::constants::{
    DEFAULT_GLOBAL_LIMIT, DEFAULT_GLOBAL_WINDOW_MS, DEFAULT_HIGH_WATER_MARK, MS_PER_SECOND,
    RATE_LIMIT_PREFIX,
};
use crate::store::{get_record, sanitize_key_component, set_record, RateLimitRecord, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 限流决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// 允许通过
    Allowed {
        /// 当前窗口剩余配额
        remaining: u64,
    },
    /// 拒绝
    Denied {
        /// 距离窗口重置的秒数（向上取整，最小为1）
        retry_after_secs: u64,
    },
}

impl RateLimitDecision {
    /// 是否允许通过
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// 429响应体
///
/// `retry_after` 同时用于JSON响应体和 `Retry-After` 头，
/// 两者永远一致。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// 错误描述
    pub error: String,
    /// 重试等待秒数
    pub retry_after: u64,
}

impl RateLimitRejection {
    /// 从拒绝决策构造429响应体
    pub fn new(retry_after_secs: u64) -> Self {
        Self {
            error: "Too many requests, please try again later".to_string(),
            retry_after: retry_after_secs,
        }
    }

    /// `Retry-After` 头的值（与响应体中的字段同源）
    pub fn retry_after_header(&self) -> String {
        self.retry_after.to_string()
    }
}

/// 限流器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// 全局（按IP）窗口内请求上限
    pub global_limit: u64,
    /// 全局窗口长度（毫秒）
    pub global_window_ms: u64,
    /// 限流键数量高水位，超过时触发机会式清扫
    pub high_water_mark: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_limit: DEFAULT_GLOBAL_LIMIT,
            global_window_ms: DEFAULT_GLOBAL_WINDOW_MS,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置全局请求上限
    pub fn global_limit(mut self, limit: u64) -> Self {
        self.global_limit = limit;
        self
    }

    /// 设置全局窗口长度
    pub fn global_window_ms(mut self, window_ms: u64) -> Self {
        self.global_window_ms = window_ms;
        self
    }

    /// 设置清扫高水位
    pub fn high_water_mark(mut self, mark: u64) -> Self {
        self.high_water_mark = mark;
        self
    }
}

/// 固定窗口限流器
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    config: RateLimiterConfig,
    audit: Option<AuditHandle>,
}

impl RateLimiter {
    /// 创建新的限流器
    pub fn new(store: Arc<dyn StateStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            audit: None,
        }
    }

    /// 附加审计句柄（拒绝决策会上报审计日志）
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 全局限流检查（按客户端IP）
    pub async fn check_ip(&self, ip: &str) -> RateLimitDecision {
        let key = format!("ip:{}", sanitize_key_component(ip));
        self.check(&key, self.config.global_limit, self.config.global_window_ms)
            .await
    }

    /// 功能维度限流检查（组合键 `<feature>:<identity>`）
    pub async fn check_scoped(
        &self,
        feature: &str,
        identity: &str,
        limit: u64,
        window_ms: u64,
    ) -> RateLimitDecision {
        let key = format!(
            "{}:{}",
            sanitize_key_component(feature),
            sanitize_key_component(identity)
        );
        self.check(&key, limit, window_ms).await
    }

    /// 固定窗口检查
    ///
    /// 窗口内计数达到上限时拒绝，`retry_after` 为距离窗口重置的秒数
    /// （向上取整）。窗口过期或记录缺失时写入新窗口（count=1）。
    /// 存储故障时失败放行。
    pub async fn check(&self, key: &str, limit: u64, window_ms: u64) -> RateLimitDecision {
        let full_key = format!("{}{}", RATE_LIMIT_PREFIX, key);
        let now = chrono::Utc::now().timestamp_millis();

        let record: Option<RateLimitRecord> =
            match get_record(self.store.as_ref(), &full_key).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("限流检查存储失败，放行请求: key={}, 错误: {}", full_key, e);
                    return RateLimitDecision::Allowed { remaining: limit };
                }
            };

        let decision = match record {
            // 记录缺失或窗口已过期：写入新窗口
            None => self.seed_window(&full_key, limit, window_ms, now).await,
            Some(record) if now >= record.reset_at => {
                self.seed_window(&full_key, limit, window_ms, now).await
            }
            // 已达上限：拒绝
            Some(record) if record.count >= limit => {
                let retry_after_secs = Self::retry_after_secs(record.reset_at, now);
                debug!(
                    "限流拒绝: key={}, count={}, limit={}, retry_after={}s",
                    full_key, record.count, limit, retry_after_secs
                );
                RateLimitDecision::Denied { retry_after_secs }
            }
            // 窗口内递增
            Some(_) => match self.store.increment(&full_key).await {
                // 递增时键恰好过期：重新播种新窗口
                Ok(0) => self.seed_window(&full_key, limit, window_ms, now).await,
                Ok(new_count) => RateLimitDecision::Allowed {
                    remaining: limit.saturating_sub(new_count),
                },
                Err(e) => {
                    warn!("限流递增失败，放行请求: key={}, 错误: {}", full_key, e);
                    RateLimitDecision::Allowed { remaining: limit }
                }
            },
        };

        if let RateLimitDecision::Denied { retry_after_secs } = &decision {
            if let Some(audit) = &self.audit {
                audit.emit(AuditEvent::Decision {
                    timestamp: chrono::Utc::now(),
                    identifier: key.to_string(),
                    decision: "denied".to_string(),
                    reason: format!("rate limit exceeded, retry after {}s", retry_after_secs),
                    request_id: Some(uuid::Uuid::new_v4().to_string()),
                });
            }
        }

        // 服务完请求后机会式清扫，绝不用定时器
        self.maybe_sweep().await;

        decision
    }

    /// 手动撤销单个限流键（管理操作）
    pub async fn reset(&self, key: &str) {
        let full_key = format!("{}{}", RATE_LIMIT_PREFIX, key);
        if let Err(e) = self.store.delete(&full_key).await {
            warn!("限流键撤销失败: key={}, 错误: {}", full_key, e);
        } else {
            info!("限流键已撤销: key={}", full_key);
        }
    }

    /// 写入新窗口记录（count=1）
    async fn seed_window(
        &self,
        full_key: &str,
        limit: u64,
        window_ms: u64,
        now: i64,
    ) -> RateLimitDecision {
        let record = RateLimitRecord {
            count: 1,
            reset_at: now + window_ms as i64,
        };

        if let Err(e) = set_record(self.store.as_ref(), full_key, &record, Some(window_ms)).await {
            warn!("限流窗口写入失败，放行请求: key={}, 错误: {}", full_key, e);
            return RateLimitDecision::Allowed { remaining: limit };
        }

        RateLimitDecision::Allowed {
            remaining: limit.saturating_sub(1),
        }
    }

    /// 距离窗口重置的秒数（向上取整，最小为1）
    fn retry_after_secs(reset_at: i64, now: i64) -> u64 {
        let remaining_ms = (reset_at - now).max(0);
        let secs = (remaining_ms + MS_PER_SECOND - 1) / MS_PER_SECOND;
        (secs as u64).max(1)
    }

    /// 机会式清扫：限流键数量超过高水位时删除已过期窗口的记录
    ///
    /// 仅用于控制内存占用，不参与限流正确性（窗口过期由check路径
    /// 自行判断）。
    async fn maybe_sweep(&self) {
        let count = match self.store.count(RATE_LIMIT_PREFIX).await {
            Ok(count) => count,
            Err(e) => {
                warn!("限流键计数失败，跳过清扫: {}", e);
                return;
            }
        };

        if count <= self.config.high_water_mark {
            return;
        }

        debug!(
            "限流键数量超过高水位（{} > {}），开始清扫",
            count, self.config.high_water_mark
        );

        let keys = match self.store.keys(RATE_LIMIT_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("限流键列举失败，跳过清扫: {}", e);
                return;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let mut removed: u64 = 0;

        for key in keys {
            let record: Option<RateLimitRecord> =
                match get_record(self.store.as_ref(), &key).await {
                    Ok(record) => record,
                    Err(_) => continue,
                };

            let expired = match record {
                Some(record) => now >= record.reset_at,
                // 损坏的记录一并清除
                None => true,
            };

            if expired && self.store.delete(&key).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("限流清扫完成，删除 {} 个过期记录", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn limiter_with(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStateStore::new()), config)
    }

    #[tokio::test]
    async fn test_first_request_allowed_with_fresh_window() {
        let limiter = limiter_with(RateLimiterConfig::default());

        let decision = limiter.check("ip:1.2.3.4", 5, 60_000).await;
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 4 });
    }

    #[tokio::test]
    async fn test_denied_at_limit_with_retry_after() {
        let limiter = limiter_with(RateLimiterConfig::default());

        for _ in 0..3 {
            let decision = limiter.check("ip:1.2.3.4", 3, 60_000).await;
            assert!(decision.is_allowed());
        }

        let decision = limiter.check("ip:1.2.3.4", 3, 60_000).await;
        match decision {
            RateLimitDecision::Denied { retry_after_secs } => {
                // ceil((reset_at - now) / 1000)，刚写入的60秒窗口
                assert!(retry_after_secs >= 59 && retry_after_secs <= 60);
            }
            other => panic!("应当拒绝: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_rollover_resets_count() {
        let limiter = limiter_with(RateLimiterConfig::default());

        for _ in 0..2 {
            limiter.check("ip:1.2.3.4", 2, 50).await;
        }
        assert!(!limiter.check("ip:1.2.3.4", 2, 50).await.is_allowed());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        // 窗口滚动后重新从1开始计数
        let decision = limiter.check("ip:1.2.3.4", 2, 50).await;
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 1 });
    }

    #[tokio::test]
    async fn test_scoped_keys_are_independent() {
        let limiter = limiter_with(RateLimiterConfig::default());

        assert!(limiter.check_scoped("bug-report", "1.2.3.4", 1, 60_000).await.is_allowed());
        assert!(!limiter.check_scoped("bug-report", "1.2.3.4", 1, 60_000).await.is_allowed());

        // 其它功能/身份不受影响
        assert!(limiter.check_scoped("polling", "1.2.3.4", 1, 60_000).await.is_allowed());
        assert!(limiter.check_scoped("bug-report", "5.6.7.8", 1, 60_000).await.is_allowed());
    }

    #[tokio::test]
    async fn test_global_ip_check_uses_config_limit() {
        let config = RateLimiterConfig::new().global_limit(2).global_window_ms(60_000);
        let limiter = limiter_with(config);

        assert!(limiter.check_ip("9.9.9.9").await.is_allowed());
        assert!(limiter.check_ip("9.9.9.9").await.is_allowed());
        assert!(!limiter.check_ip("9.9.9.9").await.is_allowed());
    }

    #[tokio::test]
    async fn test_reset_revokes_single_key() {
        let limiter = limiter_with(RateLimiterConfig::default());

        limiter.check("apikey:k1:minute", 1, 60_000).await;
        assert!(!limiter.check("apikey:k1:minute", 1, 60_000).await.is_allowed());

        limiter.reset("apikey:k1:minute").await;
        assert!(limiter.check("apikey:k1:minute", 1, 60_000).await.is_allowed());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_records() {
        let store = Arc::new(MemoryStateStore::new());
        let config = RateLimiterConfig::new().high_water_mark(1);
        let limiter = RateLimiter::new(Arc::clone(&store) as Arc<dyn StateStore>, config);

        // 两个很快过期的窗口
        limiter.check("a", 10, 30).await;
        limiter.check("b", 10, 30).await;
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        // 内存后端的TTL会先行清除这些键；直接写入无TTL的过期记录
        // 模拟仅reset_at过期的情况
        let stale = RateLimitRecord { count: 5, reset_at: 0 };
        set_record(store.as_ref(), "rl:stale1", &stale, None).await.unwrap();
        set_record(store.as_ref(), "rl:stale2", &stale, None).await.unwrap();

        // 下一次check触发清扫（count > 1）
        limiter.check("c", 10, 60_000).await;

        assert!(store.get("rl:stale1").await.unwrap().is_none());
        assert!(store.get("rl:stale2").await.unwrap().is_none());
        // 存活窗口不受影响
        assert!(store.get("rl:c").await.unwrap().is_some());
    }

    #[test]
    fn test_rejection_body_and_header_agree() {
        let rejection = RateLimitRejection::new(42);
        assert_eq!(rejection.retry_after, 42);
        assert_eq!(rejection.retry_after_header(), "42");

        let json = serde_json::to_string(&rejection).unwrap();
        assert!(json.contains("\"retry_after\":42"));
        assert!(json.contains("Too many requests"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        // 1ms剩余也要等1秒
        assert_eq!(RateLimiter::retry_after_secs(1001, 1000), 1);
        assert_eq!(RateLimiter::retry_after_secs(2000, 1000), 1);
        assert_eq!(RateLimiter::retry_after_secs(2001, 1000), 2);
        // 已过期时最小为1
        assert_eq!(RateLimiter::retry_after_secs(500, 1000), 1);
    }
}

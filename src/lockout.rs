//! 账户锁定跟踪器
//!
//! 跟踪认证失败次数并维护显式锁定时间。两条独立的过期规则：
//! 以首次失败为锚点的滚动观察窗口，或调用方设置的显式 `locked_until`，
//! 满足任意一条即可被清理回收。没有定时器，清理是"当前时间"的纯函数。

use crate::audit::{AuditEvent, AuditHandle};
use crate::constants::LOCKOUT_PREFIX;
use crate::store::{get_record, set_record, LockoutRecord, StateStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 账户锁定跟踪器
pub struct LockoutTracker {
    store: Arc<dyn StateStore>,
    audit: Option<AuditHandle>,
}

impl LockoutTracker {
    /// 创建新的锁定跟踪器
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store, audit: None }
    }

    /// 附加审计句柄（锁定操作会上报审计日志）
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 记录一次失败，返回累计失败次数
    ///
    /// 记录不存在时创建（count=1，first_attempt=now）；存在时原子
    /// 递增并显式写回。存储故障时返回0（失败放行，调用方不得因此锁定）。
    pub async fn record_failure(&self, key: &str) -> u64 {
        let full_key = self.full_key(key);
        let now = chrono::Utc::now().timestamp_millis();

        match self.store.increment(&full_key).await {
            Ok(0) => {
                // 记录不存在（或已损坏），创建新记录
                let record = LockoutRecord {
                    count: 1,
                    first_attempt: now,
                    locked_until: None,
                };
                if let Err(e) = set_record(self.store.as_ref(), &full_key, &record, None).await {
                    warn!("锁定记录创建失败: key={}, 错误: {}", full_key, e);
                    return 0;
                }
                1
            }
            Ok(count) => {
                debug!("失败计数递增: key={}, count={}", full_key, count);
                count
            }
            Err(e) => {
                warn!("失败计数递增失败，放行: key={}, 错误: {}", full_key, e);
                0
            }
        }
    }

    /// 设置显式锁定截止时间（epoch毫秒，由调用方计算）
    pub async fn set_locked_until(&self, key: &str, locked_until: i64) {
        let full_key = self.full_key(key);
        let now = chrono::Utc::now().timestamp_millis();

        let record = match get_record::<LockoutRecord>(self.store.as_ref(), &full_key).await {
            Ok(Some(mut record)) => {
                record.locked_until = Some(locked_until);
                record
            }
            Ok(None) => LockoutRecord {
                count: 0,
                first_attempt: now,
                locked_until: Some(locked_until),
            },
            Err(e) => {
                warn!("锁定记录读取失败: key={}, 错误: {}", full_key, e);
                return;
            }
        };

        if let Err(e) = set_record(self.store.as_ref(), &full_key, &record, None).await {
            warn!("锁定时间写入失败: key={}, 错误: {}", full_key, e);
            return;
        }

        info!("账户已锁定: key={}, locked_until={}", full_key, locked_until);

        if let Some(audit) = &self.audit {
            audit.emit(AuditEvent::LockoutOperation {
                timestamp: chrono::Utc::now(),
                target: key.to_string(),
                action: "lock".to_string(),
                reason: "failure threshold exceeded".to_string(),
                expires_at: chrono::DateTime::from_timestamp_millis(locked_until),
            });
        }
    }

    /// 当前是否处于锁定状态
    ///
    /// 仅当 `locked_until` 已设置且尚未到期时为锁定。存储故障时
    /// 返回false（失败放行）。
    pub async fn is_locked(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        let now = chrono::Utc::now().timestamp_millis();

        match get_record::<LockoutRecord>(self.store.as_ref(), &full_key).await {
            Ok(Some(record)) => matches!(record.locked_until, Some(until) if now < until),
            Ok(None) => false,
            Err(e) => {
                warn!("锁定状态查询失败，放行: key={}, 错误: {}", full_key, e);
                false
            }
        }
    }

    /// 当前累计失败次数（只读，用于展示剩余尝试次数）
    pub async fn failure_count(&self, key: &str) -> u64 {
        let full_key = self.full_key(key);

        match get_record::<LockoutRecord>(self.store.as_ref(), &full_key).await {
            Ok(Some(record)) => record.count,
            Ok(None) => 0,
            Err(e) => {
                warn!("失败计数查询失败: key={}, 错误: {}", full_key, e);
                0
            }
        }
    }

    /// 清理过期的锁定记录，返回删除数量
    ///
    /// 回收条件（满足任意一条）：
    /// - 滚动窗口过期：`now > first_attempt + reset_window_ms`
    /// - 显式锁定过期：`locked_until` 已设置且 `now > locked_until`
    pub async fn cleanup_expired(&self, reset_window_ms: u64) -> u64 {
        let now = chrono::Utc::now().timestamp_millis();

        let keys = match self.store.keys(LOCKOUT_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("锁定键列举失败，跳过清理: {}", e);
                return 0;
            }
        };

        let mut removed: u64 = 0;

        for key in keys {
            let record = match get_record::<LockoutRecord>(self.store.as_ref(), &key).await {
                Ok(Some(record)) => record,
                // 损坏的记录一并清除
                Ok(None) => {
                    if self.store.delete(&key).await.is_ok() {
                        removed += 1;
                    }
                    continue;
                }
                Err(_) => continue,
            };

            let window_expired = now > record.first_attempt + reset_window_ms as i64;
            let lock_expired = matches!(record.locked_until, Some(until) if now > until);

            if (window_expired || lock_expired) && self.store.delete(&key).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("锁定记录清理完成，删除 {} 条", removed);
        }

        removed
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", LOCKOUT_PREFIX, key)
    }
}

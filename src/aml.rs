//! 反洗钱合规引擎
//!
//! 进程内交易合规检查：单笔限额、速率、拆分交易（structuring）识别
//! 和日/周/月滚动累计限额。每用户维护有上限的交易台账，按顺序
//! 短路执行检查。合规超限是结构化结果，不是错误。

use crate::audit::{AuditEvent, AuditHandle};
use crate::constants::{
    CTR_REPORTING_THRESHOLD, DAILY_WINDOW_MS, LEDGER_RETENTION_MS, MAX_LEDGER_ENTRIES,
    MONTHLY_WINDOW_MS, STRUCTURING_BAND_RATIO, STRUCTURING_MIN_COUNT, STRUCTURING_THRESHOLD,
    STRUCTURING_WINDOW_MS, WEEKLY_WINDOW_MS,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// 交易类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// 充值
    Deposit,
    /// 提现
    Withdrawal,
    /// 交易
    Trade,
}

/// 台账交易记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// 用户ID
    pub user_id: String,
    /// 金额
    pub amount: Decimal,
    /// 时间（epoch毫秒）
    pub timestamp: i64,
    /// 交易类型
    pub kind: TransactionKind,
}

/// 合规标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceFlag {
    /// 达到CTR申报门槛
    CtrRequired,
    /// 交易速率超限
    VelocityExceeded,
    /// 疑似拆分交易
    StructuringSuspected,
}

impl ComplianceFlag {
    /// 标记的线上表示
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceFlag::CtrRequired => "CTR_REQUIRED",
            ComplianceFlag::VelocityExceeded => "VELOCITY_EXCEEDED",
            ComplianceFlag::StructuringSuspected => "STRUCTURING_SUSPECTED",
        }
    }
}

/// 合规检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmlCheckResult {
    /// 是否放行
    pub allowed: bool,
    /// 拒绝原因（放行时为None）
    pub reason: Option<String>,
    /// 是否需要人工复核
    pub requires_review: bool,
    /// 累计的合规标记（短路前已累计的标记随结果一并返回）
    pub flags: Vec<ComplianceFlag>,
}

impl AmlCheckResult {
    fn allowed(flags: Vec<ComplianceFlag>) -> Self {
        let requires_review = flags.contains(&ComplianceFlag::CtrRequired);
        Self {
            allowed: true,
            reason: None,
            requires_review,
            flags,
        }
    }

    fn blocked(reason: impl Into<String>, flags: Vec<ComplianceFlag>) -> Self {
        // 被拦截的资金流动始终需要人工复核
        Self {
            allowed: false,
            reason: Some(reason.into()),
            requires_review: true,
            flags,
        }
    }
}

/// 拆分交易检测报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuringReport {
    /// 是否检测到拆分模式
    pub detected: bool,
    /// 模式描述
    pub pattern: Option<String>,
}

/// 合规阈值配置（可按租户配置的上限，区别于固定的监管常量）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmlThresholds {
    /// 单笔交易上限（含），达到即拦截
    pub single_transaction_limit: Decimal,
    /// 日累计上限
    pub daily_limit: Decimal,
    /// 周累计上限
    pub weekly_limit: Decimal,
    /// 月累计上限
    pub monthly_limit: Decimal,
    /// 速率窗口（毫秒）
    pub velocity_window_ms: i64,
    /// 速率窗口内最大交易笔数
    pub max_transactions_per_window: usize,
}

impl Default for AmlThresholds {
    fn default() -> Self {
        Self {
            single_transaction_limit: dec!(50000),
            daily_limit: dec!(100000),
            weekly_limit: dec!(250000),
            monthly_limit: dec!(500000),
            velocity_window_ms: 3_600_000,
            max_transactions_per_window: 10,
        }
    }
}

/// 反洗钱合规引擎
///
/// 台账完全在进程内（`parking_lot::RwLock`），检查是同步的纯决策；
/// 拆分交易告警通过审计句柄非阻塞单向上报。
pub struct AmlComplianceEngine {
    thresholds: AmlThresholds,
    ledger: RwLock<HashMap<String, VecDeque<TransactionRecord>>>,
    audit: Option<AuditHandle>,
}

impl AmlComplianceEngine {
    /// 创建新的合规引擎
    pub fn new(thresholds: AmlThresholds) -> Self {
        Self {
            thresholds,
            ledger: RwLock::new(HashMap::new()),
            audit: None,
        }
    }

    /// 附加审计句柄（拆分交易告警单向上报）
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 合规检查
    ///
    /// 按固定顺序短路执行：
    /// 1. CTR申报门槛（只加标记，不拦截）
    /// 2. 单笔上限（含边界，拦截）
    /// 3. 速率（拦截）
    /// 4. 拆分交易识别（只加标记并上报审计，不拦截）
    /// 5. 日/周/月累计上限，含本笔待入账金额（拦截，按窗口升序）
    ///
    /// 放行时交易计入台账；拦截的交易不计入。
    pub fn check_compliance(
        &self,
        user_id: &str,
        amount: Decimal,
        kind: TransactionKind,
    ) -> AmlCheckResult {
        let mut flags = Vec::new();

        // 1. CTR申报门槛：达到即标记，不拦截
        if amount >= CTR_REPORTING_THRESHOLD {
            flags.push(ComplianceFlag::CtrRequired);
        }

        // 2. 单笔上限（含边界）
        if amount >= self.thresholds.single_transaction_limit {
            debug!("单笔超限拦截: user={}, amount={}", user_id, amount);
            return AmlCheckResult::blocked("exceeds single transaction limit", flags);
        }

        // 3. 速率：窗口内已有笔数达到上限时拦截本笔
        let recent_count = self.count_recent(user_id, self.thresholds.velocity_window_ms);
        if recent_count >= self.thresholds.max_transactions_per_window {
            flags.push(ComplianceFlag::VelocityExceeded);
            debug!(
                "速率超限拦截: user={}, recent={}, max={}",
                user_id, recent_count, self.thresholds.max_transactions_per_window
            );
            return AmlCheckResult::blocked("transaction velocity limit exceeded", flags);
        }

        // 4. 拆分交易识别：标记并上报，不拦截
        let structuring = self.detect_structuring(user_id);
        if structuring.detected {
            flags.push(ComplianceFlag::StructuringSuspected);
            warn!(
                "检测到疑似拆分交易: user={}, pattern={:?}",
                user_id, structuring.pattern
            );

            if let Some(audit) = &self.audit {
                audit.emit(AuditEvent::StructuringDetected {
                    timestamp: chrono::Utc::now(),
                    user_id: user_id.to_string(),
                    pattern: structuring.pattern.clone().unwrap_or_default(),
                    success: false,
                });
            }
        }

        // 5. 滚动累计上限（含本笔），按窗口升序
        let period_limits = [
            (DAILY_WINDOW_MS, self.thresholds.daily_limit, "daily"),
            (WEEKLY_WINDOW_MS, self.thresholds.weekly_limit, "weekly"),
            (MONTHLY_WINDOW_MS, self.thresholds.monthly_limit, "monthly"),
        ];

        for (window_ms, limit, name) in period_limits {
            let total = self.calculate_period_total(user_id, window_ms) + amount;
            if total > limit {
                debug!(
                    "{}累计超限拦截: user={}, total={}, limit={}",
                    name, user_id, total, limit
                );
                return AmlCheckResult::blocked(format!("{} limit exceeded", name), flags);
            }
        }

        // 放行并计入台账
        self.record_transaction(user_id, amount, kind);

        AmlCheckResult::allowed(flags)
    }

    /// 将交易追加到台账
    ///
    /// 台账超过上限时先按账龄裁剪（丢弃超过保留期的记录）；裁剪后的
    /// 列表只有在确实变小时才替换原列表，绝不按条数截断。
    pub fn record_transaction(&self, user_id: &str, amount: Decimal, kind: TransactionKind) {
        let now = chrono::Utc::now().timestamp_millis();
        let record = TransactionRecord {
            user_id: user_id.to_string(),
            amount,
            timestamp: now,
            kind,
        };

        let mut ledger = self.ledger.write();
        let entries = ledger.entry(user_id.to_string()).or_default();
        entries.push_back(record);

        if entries.len() > MAX_LEDGER_ENTRIES {
            let cutoff = now - LEDGER_RETENTION_MS;
            let pruned: VecDeque<TransactionRecord> = entries
                .iter()
                .filter(|t| t.timestamp >= cutoff)
                .cloned()
                .collect();

            if pruned.len() < entries.len() {
                info!(
                    "台账按账龄裁剪: user={}, {} -> {}",
                    user_id,
                    entries.len(),
                    pruned.len()
                );
                *entries = pruned;
            }
        }
    }

    /// 计算窗口内的交易总额（不含本笔待入账金额）
    pub fn calculate_period_total(&self, user_id: &str, period_ms: i64) -> Decimal {
        let cutoff = chrono::Utc::now().timestamp_millis() - period_ms;
        let ledger = self.ledger.read();

        ledger
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|t| t.timestamp > cutoff)
                    .map(|t| t.amount)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// 拆分交易识别
    ///
    /// 对用户台账做纯统计：24小时内落在门槛带 `[0.8×T, T)` 的交易
    /// 达到3笔即判定为疑似拆分。待检金额不参与统计。
    pub fn detect_structuring(&self, user_id: &str) -> StructuringReport {
        let band_floor = STRUCTURING_THRESHOLD * STRUCTURING_BAND_RATIO;
        let cutoff = chrono::Utc::now().timestamp_millis() - STRUCTURING_WINDOW_MS;
        let ledger = self.ledger.read();

        let in_band = ledger
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|t| {
                        t.timestamp > cutoff
                            && t.amount >= band_floor
                            && t.amount < STRUCTURING_THRESHOLD
                    })
                    .count()
            })
            .unwrap_or(0);

        if in_band >= STRUCTURING_MIN_COUNT {
            StructuringReport {
                detected: true,
                pattern: Some(format!("{} transactions just under threshold", in_band)),
            }
        } else {
            StructuringReport {
                detected: false,
                pattern: None,
            }
        }
    }

    /// 用户的完整台账（测试与人工复核用）
    pub fn transaction_history(&self, user_id: &str) -> Vec<TransactionRecord> {
        let ledger = self.ledger.read();
        ledger
            .get(user_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 当前生效的阈值配置
    pub fn thresholds(&self) -> &AmlThresholds {
        &self.thresholds
    }

    /// 速率窗口内的交易笔数
    fn count_recent(&self, user_id: &str, window_ms: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - window_ms;
        let ledger = self.ledger.read();

        ledger
            .get(user_id)
            .map(|entries| entries.iter().filter(|t| t.timestamp > cutoff).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AmlComplianceEngine {
        AmlComplianceEngine::new(AmlThresholds::default())
    }

    #[test]
    fn test_normal_transaction_allowed() {
        let engine = engine();

        let result = engine.check_compliance("user-1", dec!(500), TransactionKind::Deposit);
        assert!(result.allowed);
        assert!(result.reason.is_none());
        assert!(!result.requires_review);
        assert!(result.flags.is_empty());
        assert_eq!(engine.transaction_history("user-1").len(), 1);
    }

    #[test]
    fn test_ctr_flag_at_reporting_threshold() {
        let engine = engine();

        let result = engine.check_compliance("user-1", dec!(10000), TransactionKind::Deposit);
        assert!(result.allowed);
        assert!(result.requires_review);
        assert_eq!(result.flags, vec![ComplianceFlag::CtrRequired]);
    }

    #[test]
    fn test_single_limit_inclusive_boundary() {
        let engine = engine();

        // 恰好等于上限：拦截
        let result = engine.check_compliance("user-1", dec!(50000), TransactionKind::Withdrawal);
        assert!(!result.allowed);
        assert_eq!(
            result.reason.as_deref(),
            Some("exceeds single transaction limit")
        );
        assert!(result.requires_review);
        // CTR标记在短路前已累计，随拦截结果返回
        assert!(result.flags.contains(&ComplianceFlag::CtrRequired));
        // 被拦截的交易不计入台账
        assert!(engine.transaction_history("user-1").is_empty());

        // 上限减一分：放行
        let result = engine.check_compliance("user-1", dec!(49999.99), TransactionKind::Withdrawal);
        assert!(result.allowed);
    }

    #[test]
    fn test_velocity_blocks_after_window_filled() {
        let thresholds = AmlThresholds {
            max_transactions_per_window: 3,
            ..AmlThresholds::default()
        };
        let engine = AmlComplianceEngine::new(thresholds);

        // 恰好填满窗口
        for _ in 0..3 {
            assert!(
                engine
                    .check_compliance("user-1", dec!(100), TransactionKind::Trade)
                    .allowed
            );
        }

        let result = engine.check_compliance("user-1", dec!(100), TransactionKind::Trade);
        assert!(!result.allowed);
        assert_eq!(
            result.reason.as_deref(),
            Some("transaction velocity limit exceeded")
        );
        assert_eq!(result.flags, vec![ComplianceFlag::VelocityExceeded]);
    }

    #[test]
    fn test_structuring_three_in_history_detected() {
        let engine = engine();

        // 9500 = 0.95×10000，落在 [8000, 10000) 带内
        for _ in 0..3 {
            engine.record_transaction("user-1", dec!(9500), TransactionKind::Deposit);
        }

        let report = engine.detect_structuring("user-1");
        assert!(report.detected);
        assert_eq!(
            report.pattern.as_deref(),
            Some("3 transactions just under threshold")
        );

        // 待检金额不参与统计：带外金额的下一笔同样带上标记
        let result = engine.check_compliance("user-1", dec!(100), TransactionKind::Deposit);
        assert!(result.allowed);
        assert!(result.flags.contains(&ComplianceFlag::StructuringSuspected));
    }

    #[test]
    fn test_structuring_two_in_history_not_detected() {
        let engine = engine();

        engine.record_transaction("user-1", dec!(9500), TransactionKind::Deposit);
        engine.record_transaction("user-1", dec!(9500), TransactionKind::Deposit);

        assert!(!engine.detect_structuring("user-1").detected);
        let result = engine.check_compliance("user-1", dec!(9500), TransactionKind::Deposit);
        assert!(!result.flags.contains(&ComplianceFlag::StructuringSuspected));
    }

    #[test]
    fn test_structuring_band_boundaries() {
        let engine = engine();

        // 带下界（含）与带内上沿各一笔
        engine.record_transaction("user-1", dec!(8000), TransactionKind::Deposit);
        engine.record_transaction("user-1", dec!(9999.99), TransactionKind::Deposit);
        assert!(!engine.detect_structuring("user-1").detected);

        // 带上界（不含）与带下方的金额不计入
        engine.record_transaction("user-1", dec!(10000), TransactionKind::Deposit);
        engine.record_transaction("user-1", dec!(7999.99), TransactionKind::Deposit);
        assert!(!engine.detect_structuring("user-1").detected);

        engine.record_transaction("user-1", dec!(8500), TransactionKind::Deposit);
        let report = engine.detect_structuring("user-1");
        assert!(report.detected);
        assert_eq!(
            report.pattern.as_deref(),
            Some("3 transactions just under threshold")
        );
    }

    #[test]
    fn test_daily_aggregate_includes_pending() {
        let thresholds = AmlThresholds {
            daily_limit: dec!(1000),
            ..AmlThresholds::default()
        };
        let engine = AmlComplianceEngine::new(thresholds);

        assert!(
            engine
                .check_compliance("user-1", dec!(600), TransactionKind::Deposit)
                .allowed
        );

        // 600 + 500 > 1000：拦截
        let result = engine.check_compliance("user-1", dec!(500), TransactionKind::Deposit);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("daily limit exceeded"));

        // 600 + 400 = 1000，恰好等于上限：放行（累计是严格大于才拦截）
        assert!(
            engine
                .check_compliance("user-1", dec!(400), TransactionKind::Deposit)
                .allowed
        );
    }

    #[test]
    fn test_aggregate_windows_checked_in_ascending_order() {
        let thresholds = AmlThresholds {
            daily_limit: dec!(100),
            weekly_limit: dec!(100),
            ..AmlThresholds::default()
        };
        let engine = AmlComplianceEngine::new(thresholds);

        engine.check_compliance("user-1", dec!(80), TransactionKind::Deposit);

        // 日和周同时超限时，报告的是最先检查的日窗口
        let result = engine.check_compliance("user-1", dec!(50), TransactionKind::Deposit);
        assert_eq!(result.reason.as_deref(), Some("daily limit exceeded"));
    }

    #[test]
    fn test_period_total_excludes_other_users() {
        let engine = engine();

        engine.record_transaction("user-1", dec!(100), TransactionKind::Trade);
        engine.record_transaction("user-2", dec!(999), TransactionKind::Trade);

        assert_eq!(
            engine.calculate_period_total("user-1", DAILY_WINDOW_MS),
            dec!(100)
        );
    }

    #[test]
    fn test_period_total_read_is_idempotent() {
        let engine = engine();
        engine.record_transaction("user-1", dec!(100), TransactionKind::Trade);

        let first = engine.calculate_period_total("user-1", DAILY_WINDOW_MS);
        let second = engine.calculate_period_total("user-1", DAILY_WINDOW_MS);
        assert_eq!(first, second);
        assert_eq!(engine.transaction_history("user-1").len(), 1);
    }

    #[test]
    fn test_ledger_pruning_is_age_first() {
        let engine = engine();
        let now = chrono::Utc::now().timestamp_millis();

        // 直接填充台账：一半超过保留期，一半新鲜
        {
            let mut ledger = engine.ledger.write();
            let entries = ledger.entry("user-1".to_string()).or_default();
            for i in 0..MAX_LEDGER_ENTRIES {
                let timestamp = if i < 600 {
                    now - LEDGER_RETENTION_MS - 1000
                } else {
                    now
                };
                entries.push_back(TransactionRecord {
                    user_id: "user-1".to_string(),
                    amount: dec!(1),
                    timestamp,
                    kind: TransactionKind::Trade,
                });
            }
        }

        // 追加一笔触发裁剪
        engine.record_transaction("user-1", dec!(1), TransactionKind::Trade);

        let history = engine.transaction_history("user-1");
        // 600条过期记录被裁掉，留下400 + 1条新记录
        assert_eq!(history.len(), 401);
        let cutoff = now - LEDGER_RETENTION_MS;
        assert!(history.iter().all(|t| t.timestamp >= cutoff));
    }

    #[test]
    fn test_ledger_keeps_overflow_when_all_recent() {
        let engine = engine();
        let now = chrono::Utc::now().timestamp_millis();

        // 全部新鲜：裁剪不会变小，超限也保留（按账龄优先，绝不截断）
        {
            let mut ledger = engine.ledger.write();
            let entries = ledger.entry("user-1".to_string()).or_default();
            for _ in 0..MAX_LEDGER_ENTRIES {
                entries.push_back(TransactionRecord {
                    user_id: "user-1".to_string(),
                    amount: dec!(1),
                    timestamp: now,
                    kind: TransactionKind::Trade,
                });
            }
        }

        engine.record_transaction("user-1", dec!(1), TransactionKind::Trade);
        assert_eq!(
            engine.transaction_history("user-1").len(),
            MAX_LEDGER_ENTRIES + 1
        );
    }

    #[test]
    fn test_compliance_flag_wire_names() {
        assert_eq!(ComplianceFlag::CtrRequired.as_str(), "CTR_REQUIRED");
        assert_eq!(
            ComplianceFlag::VelocityExceeded.as_str(),
            "VELOCITY_EXCEEDED"
        );
        assert_eq!(
            ComplianceFlag::StructuringSuspected.as_str(),
            "STRUCTURING_SUSPECTED"
        );

        let json = serde_json::to_string(&ComplianceFlag::CtrRequired).unwrap();
        assert_eq!(json, "\"CTR_REQUIRED\"");
    }
}

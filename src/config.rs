//! 配置模块
//!
//! 定义风控引擎的配置结构，支持从YAML/TOML文件加载。

use ahash::AHashSet as HashSet;
use serde::{Deserialize, Serialize};

use crate::aml::AmlThresholds;
use crate::constants::{
    DEFAULT_GLOBAL_LIMIT, DEFAULT_GLOBAL_WINDOW_MS, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_LOCKOUT_MAX_ATTEMPTS, DEFAULT_LOCKOUT_RESET_WINDOW_MS, DEFAULT_LOCK_DURATION_MS,
};
use crate::error::RiskGuardError;

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControlConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lockout: LockoutConfig,
    #[serde(default)]
    pub aml: AmlThresholds,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            lockout: LockoutConfig::default(),
            aml: AmlThresholds::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl RiskControlConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err("版本号不能为空".to_string());
        }

        self.rate_limit.validate()?;
        self.lockout.validate()?;
        validate_aml(&self.aml)?;

        Ok(())
    }

    /// 从YAML字符串解析
    pub fn from_yaml_str(content: &str) -> Result<Self, RiskGuardError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate().map_err(RiskGuardError::ConfigError)?;
        Ok(config)
    }

    /// 从TOML字符串解析
    pub fn from_toml_str(content: &str) -> Result<Self, RiskGuardError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(RiskGuardError::ConfigError)?;
        Ok(config)
    }

    /// 从文件加载（按扩展名选择解析器）
    pub fn load(path: &std::path::Path) -> Result<Self, RiskGuardError> {
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(RiskGuardError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }
}

/// 状态存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Redis连接URL；为空时使用内存存储
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Redis数据库索引
    #[serde(default)]
    pub redis_db: i64,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// 全局（按IP）窗口内请求上限
    pub global_limit: u64,
    /// 全局窗口长度（毫秒）
    pub global_window_ms: u64,
    /// 限流键数量高水位
    pub high_water_mark: u64,
    /// 功能维度限流规则
    #[serde(default)]
    pub scopes: Vec<ScopeRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: DEFAULT_GLOBAL_LIMIT,
            global_window_ms: DEFAULT_GLOBAL_WINDOW_MS,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            scopes: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// 校验限流配置
    pub fn validate(&self) -> Result<(), String> {
        if self.global_limit == 0 {
            return Err("全局请求上限必须大于0".to_string());
        }
        if self.global_window_ms == 0 {
            return Err("全局窗口长度必须大于0".to_string());
        }

        let mut scope_ids = HashSet::new();
        for (index, scope) in self.scopes.iter().enumerate() {
            // 检查规则ID是否唯一
            if !scope_ids.insert(&scope.id) {
                return Err(format!("限流规则ID重复: {}", scope.id));
            }

            scope
                .validate()
                .map_err(|e| format!("限流规则[{}]校验失败: {}", index, e))?;
        }

        Ok(())
    }

    /// 按功能名查找规则
    pub fn scope(&self, feature: &str) -> Option<&ScopeRule> {
        self.scopes.iter().find(|s| s.feature == feature)
    }
}

/// 功能维度限流规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeRule {
    /// 规则ID（全局唯一）
    pub id: String,
    /// 功能名（组合键前缀，如 `apikey`、`bug-report`、`polling`）
    pub feature: String,
    /// 窗口内请求上限
    pub limit: u64,
    /// 窗口长度（毫秒）
    pub window_ms: u64,
}

impl ScopeRule {
    /// 校验规则
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("规则ID不能为空".to_string());
        }
        if self.feature.is_empty() {
            return Err("功能名不能为空".to_string());
        }
        if self.limit == 0 {
            return Err("请求上限必须大于0".to_string());
        }
        if self.window_ms == 0 {
            return Err("窗口长度必须大于0".to_string());
        }
        Ok(())
    }
}

/// 账户锁定配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockoutConfig {
    /// 锁定前允许的失败次数
    pub max_attempts: u64,
    /// 显式锁定时长（毫秒）
    pub lock_duration_ms: u64,
    /// 滚动观察窗口（毫秒，以首次失败为锚点）
    pub reset_window_ms: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LOCKOUT_MAX_ATTEMPTS,
            lock_duration_ms: DEFAULT_LOCK_DURATION_MS,
            reset_window_ms: DEFAULT_LOCKOUT_RESET_WINDOW_MS,
        }
    }
}

impl LockoutConfig {
    /// 校验锁定配置
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("失败次数阈值必须大于0".to_string());
        }
        if self.lock_duration_ms == 0 {
            return Err("锁定时长必须大于0".to_string());
        }
        if self.reset_window_ms == 0 {
            return Err("观察窗口必须大于0".to_string());
        }
        Ok(())
    }
}

/// 审计日志配置（文件内的可序列化形式）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub output_path: Option<String>,
}

fn default_audit_enabled() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: None,
        }
    }
}

/// 校验AML阈值
fn validate_aml(aml: &AmlThresholds) -> Result<(), String> {
    use rust_decimal::Decimal;

    if aml.single_transaction_limit <= Decimal::ZERO {
        return Err("单笔上限必须大于0".to_string());
    }
    if aml.daily_limit <= Decimal::ZERO
        || aml.weekly_limit <= Decimal::ZERO
        || aml.monthly_limit <= Decimal::ZERO
    {
        return Err("累计上限必须大于0".to_string());
    }
    if aml.daily_limit > aml.weekly_limit || aml.weekly_limit > aml.monthly_limit {
        return Err("累计上限必须按日<=周<=月递增".to_string());
    }
    if aml.velocity_window_ms <= 0 {
        return Err("速率窗口必须大于0".to_string());
    }
    if aml.max_transactions_per_window == 0 {
        return Err("速率窗口内最大笔数必须大于0".to_string());
    }
    Ok(())
}

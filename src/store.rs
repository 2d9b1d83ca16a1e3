//! 状态存储抽象层
//!
//! 定义风控守卫共享的键值存储接口和内存实现。两个后端（内存/Redis）
//! 对调用方行为等价：带TTL的记录过期后读取返回None，increment只对
//! 已存在的记录生效。

use crate::constants::{MAX_KEY_COMPONENT_LENGTH, MAX_KEY_LENGTH};
use crate::error::StorageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 状态存储接口
///
/// 值统一为JSON序列化后的记录字符串；记录类型见 [`RateLimitRecord`]、
/// [`LockoutRecord`]。所有操作可失败，调用方必须失败放行（fail-open）。
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 获取值；不存在或TTL已过期时返回None
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// 设置值；`ttl_ms` 为可选的存活毫秒数
    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StorageError>;

    /// 原子递增记录的 `count` 字段并返回新值
    ///
    /// 键不存在（或已过期、或存储的值无法解析）时返回0，由调用方
    /// 重新写入新记录——increment永远不会创建记录。剩余TTL必须保留，
    /// 不允许因递增而重置过期时间。
    async fn increment(&self, key: &str) -> Result<u64, StorageError>;

    /// 删除值
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// 统计指定前缀下的存活键数量（仅用于清理触发，不参与正确性判断）
    async fn count(&self, prefix: &str) -> Result<u64, StorageError>;

    /// 列出指定前缀下的存活键（用于过期清扫）
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// 关闭存储：释放连接/清空内存，进程退出或测试间调用
    async fn close(&self) -> Result<(), StorageError>;
}

/// 读取并反序列化记录
///
/// 存储的值损坏（反序列化失败）时视为不存在，调用方会重建新记录。
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("存储记录损坏，视为不存在: key={}, 错误: {}", key, e);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// 序列化并写入记录
pub async fn set_record<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    record: &T,
    ttl_ms: Option<u64>,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(record)
        .map_err(|e| StorageError::QueryError(format!("记录序列化失败: {}", e)))?;
    store.set(key, &raw, ttl_ms).await
}

/// 验证键的合法性
///
/// # 参数
/// - `key`: 完整键
///
/// # 返回
/// - `Ok(())`: 验证通过
/// - `Err(StorageError)`: 验证失败
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::QueryError("键不能为空".to_string()));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::QueryError(format!(
            "键长度超过限制（最大 {} 字符）",
            MAX_KEY_LENGTH
        )));
    }

    // 检查是否包含空字节
    if key.contains('\0') {
        return Err(StorageError::QueryError("键包含非法字符".to_string()));
    }

    Ok(())
}

/// 清理键组件（移除危险字符）
pub fn sanitize_key_component(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .take(MAX_KEY_COMPONENT_LENGTH)
        .collect()
}

/// 限流记录
///
/// 固定窗口计数：窗口过期后在读取时整体重建（count回到1，reset_at重算）。
/// 由RateLimiter独占持有，每个限流键一条。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// 当前窗口内的请求计数
    pub count: u64,
    /// 窗口结束时间（epoch毫秒）
    pub reset_at: i64,
}

/// 锁定记录
///
/// `first_attempt` 锚定滚动重置窗口（从第一次失败起算，不是最后一次）；
/// `locked_until` 为调用方设置的显式硬过期，独立于重置窗口判断。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutRecord {
    /// 失败计数
    pub count: u64,
    /// 首次失败时间（epoch毫秒）
    pub first_attempt: i64,
    /// 显式锁定截止时间（epoch毫秒）
    #[serde(default)]
    pub locked_until: Option<i64>,
}

/// 熔断记录（数据模型对等体）
///
/// 交易熔断状态机在 `cb:` 命名空间下持久化的记录形状。状态机本身
/// 不在本库范围内，这里只定义共享的记录结构。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    /// 是否处于熔断（停止交易）状态
    pub tripped: bool,
    /// 触发原因
    pub reason: String,
    /// 触发时间（epoch毫秒）
    pub tripped_at: i64,
    /// 自动恢复时间（epoch毫秒）
    #[serde(default)]
    pub resume_at: Option<i64>,
}

/// 内存条目（值 + 绝对过期时间）
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    /// 过期时间（epoch毫秒）；None表示不过期
    expires_at: Option<i64>,
}

impl MemoryEntry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// 内存存储实现
///
/// 自行跟踪并遵守TTL：过期条目在读取时惰性删除，因此对调用方而言
/// 与Redis后端的过期行为一致。
pub struct MemoryStateStore {
    data: dashmap::DashMap<String, MemoryEntry>,
}

impl MemoryStateStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self {
            data: dashmap::DashMap::new(),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        let now = Self::now_ms();
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                // 过期了，惰性删除
                self.data.remove(key);
                Ok(None)
            } else {
                Ok(Some(entry.value.clone()))
            }
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StorageError> {
        validate_key(key)?;
        let expires_at = ttl_ms.map(|ttl| Self::now_ms() + ttl as i64);
        self.data.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64, StorageError> {
        validate_key(key)?;
        let now = Self::now_ms();

        // entry锁住单个key，读改写期间不会与其它increment交错
        let mut entry = match self.data.get_mut(key) {
            Some(entry) => entry,
            None => return Ok(0),
        };

        if entry.is_expired(now) {
            drop(entry);
            self.data.remove(key);
            return Ok(0);
        }

        let mut record: serde_json::Value = match serde_json::from_str(&entry.value) {
            Ok(value) => value,
            Err(e) => {
                warn!("increment遇到损坏记录: key={}, 错误: {}", key, e);
                return Ok(0);
            }
        };

        let new_count = match record.get("count").and_then(|c| c.as_u64()) {
            Some(count) => count + 1,
            None => return Ok(0),
        };

        record["count"] = serde_json::Value::from(new_count);
        // 显式写回，保留原有的过期时间
        entry.value = record.to_string();

        Ok(new_count)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn count(&self, prefix: &str) -> Result<u64, StorageError> {
        let now = Self::now_ms();
        let count = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .count();
        Ok(count as u64)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = Self::now_ms();
        let keys = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }
}

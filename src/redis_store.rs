//! Redis状态存储
//!
//! 基于Redis实现的分布式状态存储，提供连接管理、重试机制和Lua脚本支持。
//! 与内存实现行为等价：TTL由Redis原生PX过期承载，递增通过Lua脚本
//! 原子执行且保留剩余TTL。
//!
//! # 特性
//!
//! - **连接池**: 使用ConnectionManager管理连接
//! - **重试机制**: 指数退避重试，最多3次
//! - **Lua脚本**: 预加载脚本，原子性递增
//! - **降级机制**: Redis故障时标记降级，调用方失败放行

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::lua_scripts::{LuaScriptManager, LuaScriptType};
use crate::store::{validate_key, StateStore};

/// Redis配置
#[derive(Clone)]
pub struct RedisStoreConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 读写超时
    pub io_timeout: Duration,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
    /// SCAN批量大小
    pub scan_count: usize,
}

impl std::fmt::Debug for RedisStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStoreConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .field("scan_count", &self.scan_count)
            .finish()
    }
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(100),
            scan_count: 100,
        }
    }
}

impl RedisStoreConfig {
    /// 创建新的Redis配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置密码（使用 Secret）
    pub fn password_secret(mut self, password: Secret<String>) -> Self {
        self.password = Some(password);
        self
    }

    /// 设置连接超时
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 设置IO超时
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 设置重试初始退避时间
    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = backoff;
        self
    }

    /// 设置SCAN批量大小
    pub fn scan_count(mut self, count: usize) -> Self {
        self.scan_count = count;
        self
    }
}

/// 重试统计
#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    /// 总重试次数
    pub total_retries: Arc<std::sync::atomic::AtomicU64>,
    /// 成功重试次数
    pub successful_retries: Arc<std::sync::atomic::AtomicU64>,
    /// 失败重试次数
    pub failed_retries: Arc<std::sync::atomic::AtomicU64>,
}

impl RetryStats {
    /// 获取总重试次数
    pub fn total_retries(&self) -> u64 {
        self.total_retries
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// 获取成功重试次数
    pub fn successful_retries(&self) -> u64 {
        self.successful_retries
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// 获取失败重试次数
    pub fn failed_retries(&self) -> u64 {
        self.failed_retries
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// 记录重试成功
    pub fn record_success(&self) {
        self.total_retries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.successful_retries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// 记录重试失败
    pub fn record_failure(&self) {
        self.total_retries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.failed_retries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// 重置统计
    pub fn reset(&self) {
        self.total_retries
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.successful_retries
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.failed_retries
            .store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Redis状态存储实现
#[derive(Clone)]
pub struct RedisStateStore {
    /// 连接管理器
    conn_manager: Arc<Mutex<Option<ConnectionManager>>>,
    /// 配置
    config: RedisStoreConfig,
    /// Lua脚本管理器
    lua_manager: Arc<LuaScriptManager>,
    /// 重试统计
    retry_stats: RetryStats,
    /// 降级状态
    degraded: Arc<Mutex<bool>>,
    /// 最后降级时间
    last_degraded_at: Arc<Mutex<Option<Instant>>>,
}

impl RedisStateStore {
    /// 创建新的Redis存储
    pub async fn new(config: RedisStoreConfig) -> Result<Self, StorageError> {
        info!("创建Redis状态存储, URL: {}", config.url);

        let store = Self {
            conn_manager: Arc::new(Mutex::new(None)),
            config,
            lua_manager: Arc::new(LuaScriptManager::new()),
            retry_stats: RetryStats::default(),
            degraded: Arc::new(Mutex::new(false)),
            last_degraded_at: Arc::new(Mutex::new(None)),
        };

        // 初始化连接
        store.connect().await?;

        // 预加载Lua脚本
        if let Some(conn_manager) = store.conn_manager.lock().await.as_ref() {
            let mut conn = conn_manager.clone();
            store.lua_manager.preload_all_scripts(&mut conn).await?;
        }

        info!("Redis状态存储创建成功");
        Ok(store)
    }

    /// 检查Redis连接
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;

            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    error!("Redis PING失败: {}", e);
                    StorageError::QueryError(format!("PING失败: {}", e))
                })?;

            Ok(())
        })
        .await
    }

    /// 获取连接句柄
    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let conn_manager = self.conn_manager.lock().await;
        conn_manager
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::ConnectionError("连接未初始化".to_string()))
    }

    /// 建立连接
    async fn connect(&self) -> Result<(), StorageError> {
        debug!("建立Redis连接");

        // 解析地址，认证信息通过ConnectionInfo传递而不是拼进URL
        let url = self.config.url.trim_start_matches("redis://");
        let url = url.trim_start_matches("rediss://");
        let url = if let Some(at_pos) = url.find('@') {
            &url[at_pos + 1..]
        } else {
            url
        };

        let (host, port) = if let Some(colon_pos) = url.rfind(':') {
            let host = &url[..colon_pos];
            let port = url[colon_pos + 1..].parse::<u16>().unwrap_or(6379);
            (host.to_string(), port)
        } else {
            (url.to_string(), 6379)
        };

        let client_info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: self.config.db,
                username: None,
                password: self
                    .config
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().clone()),
            },
        };

        let client = Client::open(client_info).map_err(|e| {
            error!("创建Redis客户端失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("创建Redis连接管理器失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis连接管理器失败: {}", e))
        })?;

        *self.conn_manager.lock().await = Some(conn_manager);
        *self.degraded.lock().await = false;

        info!("Redis连接建立成功");
        Ok(())
    }

    /// 带重试的执行
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut last_error = None;
        let mut backoff = self.config.retry_initial_backoff;

        for attempt in 0..=self.config.max_retries {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        self.retry_stats.record_success();
                        debug!("重试成功，尝试次数: {}", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    last_error = Some(e.clone());

                    if attempt < self.config.max_retries {
                        warn!(
                            "操作失败，将在 {:?} 后重试 (尝试 {}/{}): {}",
                            backoff,
                            attempt + 1,
                            self.config.max_retries,
                            e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.mul_f32(2.0); // 指数退避

                        // 尝试重新连接
                        if matches!(e, StorageError::ConnectionError(_)) {
                            if let Err(reconnect_err) = self.reconnect().await {
                                error!("重新连接失败: {}", reconnect_err);
                            }
                        }
                    }
                }
            }
        }

        self.retry_stats.record_failure();
        error!("操作失败，已达最大重试次数: {:?}", last_error);

        // 检查是否需要降级
        if matches!(last_error, Some(StorageError::ConnectionError(_))) {
            self.set_degraded(true).await;
        }

        Err(last_error.unwrap_or(StorageError::TimeoutError("操作超时".to_string())))
    }

    /// 重新连接
    async fn reconnect(&self) -> Result<(), StorageError> {
        debug!("尝试重新连接Redis");

        // 清理旧连接
        *self.conn_manager.lock().await = None;

        // 建立新连接
        self.connect().await
    }

    /// 设置降级状态
    async fn set_degraded(&self, degraded: bool) {
        let current = *self.degraded.lock().await;
        if current != degraded {
            *self.degraded.lock().await = degraded;
            if degraded {
                *self.last_degraded_at.lock().await = Some(Instant::now());
                warn!("Redis存储已降级，调用方将失败放行");
            } else {
                info!("Redis存储已恢复正常");
            }
        }
    }

    /// 检查是否降级
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.lock().await
    }

    /// 获取重试统计
    pub fn retry_stats(&self) -> &RetryStats {
        &self.retry_stats
    }

    /// SCAN遍历指定前缀下的所有键
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}*", prefix);
        let scan_count = self.config.scan_count;

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;

            loop {
                let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(scan_count)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| {
                        error!("SCAN失败: {}", e);
                        StorageError::QueryError(format!("SCAN失败: {}", e))
                    })?;

                keys.extend(batch);
                cursor = next_cursor;
                if cursor == 0 {
                    break;
                }
            }

            Ok(keys)
        })
        .await
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;

            let value: Option<String> = conn.get(key).await.map_err(|e| {
                error!("Redis GET失败: key={}, 错误: {}", key, e);
                StorageError::QueryError(format!("GET失败: {}", e))
            })?;

            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StorageError> {
        validate_key(key)?;

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;

            match ttl_ms {
                Some(ttl) => {
                    let _: () = redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| {
                            error!("Redis SET PX失败: key={}, 错误: {}", key, e);
                            StorageError::QueryError(format!("SET失败: {}", e))
                        })?;
                }
                None => {
                    let _: () = conn.set(key, value).await.map_err(|e| {
                        error!("Redis SET失败: key={}, 错误: {}", key, e);
                        StorageError::QueryError(format!("SET失败: {}", e))
                    })?;
                }
            }

            Ok(())
        })
        .await
    }

    async fn increment(&self, key: &str) -> Result<u64, StorageError> {
        validate_key(key)?;

        // Lua脚本原子执行：解码、递增、保留PTTL写回
        let count: i64 = self
            .execute_with_retry(|| async {
                let mut conn = self.connection().await?;
                self.lua_manager
                    .execute_script(&mut conn, LuaScriptType::IncrementKeepTtl, &[key], &[])
                    .await
            })
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;

            let _: () = conn.del(key).await.map_err(|e| {
                error!("Redis DEL失败: key={}, 错误: {}", key, e);
                StorageError::QueryError(format!("DEL失败: {}", e))
            })?;

            Ok(())
        })
        .await
    }

    async fn count(&self, prefix: &str) -> Result<u64, StorageError> {
        let keys = self.scan_keys(prefix).await?;
        Ok(keys.len() as u64)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.scan_keys(prefix).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        debug!("关闭Redis连接");
        *self.conn_manager.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_builder() {
        let config = RedisStoreConfig::new("redis://localhost:6379")
            .db(2)
            .password("secret")
            .max_retries(5)
            .retry_initial_backoff(Duration::from_millis(50))
            .scan_count(200);

        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.db, 2);
        assert!(config.password.is_some());
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_initial_backoff, Duration::from_millis(50));
        assert_eq!(config.scan_count, 200);
    }

    #[test]
    fn test_redis_config_debug_redacts_password() {
        let config = RedisStoreConfig::default().password("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_retry_stats() {
        let stats = RetryStats::default();
        stats.record_success();
        stats.record_success();
        stats.record_failure();

        assert_eq!(stats.total_retries(), 3);
        assert_eq!(stats.successful_retries(), 2);
        assert_eq!(stats.failed_retries(), 1);

        stats.reset();
        assert_eq!(stats.total_retries(), 0);
    }
}

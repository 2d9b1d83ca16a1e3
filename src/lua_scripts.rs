//! Lua脚本管理器
//!
//! 提供Redis Lua脚本的预加载、SHA缓存和版本管理功能。
//!
//! # 特性
//!
//! - **脚本预加载**: 避免重复传输脚本
//! - **SHA缓存**: 缓存脚本SHA避免重复计算
//! - **原子性操作**: 使用Lua脚本保证Redis操作的原子性

use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::error::StorageError;

/// Lua脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaScriptType {
    /// 保留TTL的记录计数递增
    IncrementKeepTtl,
}

impl LuaScriptType {
    /// 获取脚本名称
    pub fn name(&self) -> &str {
        match self {
            LuaScriptType::IncrementKeepTtl => "increment_keep_ttl",
        }
    }

    /// 获取脚本版本
    pub fn version(&self) -> &str {
        match self {
            LuaScriptType::IncrementKeepTtl => "1.0",
        }
    }
}

/// 保留TTL的递增Lua脚本
///
/// 解码存储的JSON记录，递增其count字段后原样写回，剩余TTL保持不变。
/// 键不存在或记录损坏时返回0（由调用方重建记录，递增永不创建键）。
/// 参数: KEYS[1] - key
/// 返回: 新的count值，或0（键不存在/记录损坏）
pub const INCREMENT_KEEP_TTL_SCRIPT: &str = r#"
-- 获取当前值
local key = KEYS[1]
local raw = redis.call('GET', key)
if not raw then
    return 0
end

-- 解码JSON记录
local ok, record = pcall(cjson.decode, raw)
if not ok or type(record) ~= 'table' or type(record.count) ~= 'number' then
    return 0
end

-- 递增计数
record.count = record.count + 1

-- 写回，保留剩余TTL
local ttl = redis.call('PTTL', key)
if ttl > 0 then
    redis.call('SET', key, cjson.encode(record), 'PX', ttl)
else
    redis.call('SET', key, cjson.encode(record))
end

return record.count
"#;

/// Lua脚本信息
#[derive(Debug, Clone)]
pub struct LuaScriptInfo {
    /// 脚本类型
    pub script_type: LuaScriptType,
    /// 脚本内容
    pub script: &'static str,
    /// SHA哈希（计算后填充）
    pub sha: Arc<parking_lot::Mutex<Option<String>>>,
}

impl LuaScriptInfo {
    /// 创建新的脚本信息
    pub fn new(script_type: LuaScriptType, script: &'static str) -> Self {
        Self {
            script_type,
            script,
            sha: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// 获取脚本SHA，如果未计算则返回None
    pub fn get_sha(&self) -> Option<String> {
        self.sha.lock().clone()
    }

    /// 设置脚本SHA
    pub fn set_sha(&self, sha: String) {
        *self.sha.lock() = Some(sha);
    }
}

/// Lua脚本管理器
pub struct LuaScriptManager {
    /// 脚本映射
    scripts: HashMap<LuaScriptType, LuaScriptInfo>,
}

impl LuaScriptManager {
    /// 创建新的脚本管理器
    pub fn new() -> Self {
        let mut scripts = HashMap::new();

        scripts.insert(
            LuaScriptType::IncrementKeepTtl,
            LuaScriptInfo::new(LuaScriptType::IncrementKeepTtl, INCREMENT_KEEP_TTL_SCRIPT),
        );

        Self { scripts }
    }

    /// 获取脚本信息
    pub fn get_script(&self, script_type: LuaScriptType) -> Option<&LuaScriptInfo> {
        self.scripts.get(&script_type)
    }

    /// 获取所有脚本
    pub fn get_all_scripts(&self) -> Vec<&LuaScriptInfo> {
        self.scripts.values().collect()
    }

    /// 预加载所有脚本到Redis
    pub async fn preload_all_scripts<C>(&self, conn: &mut C) -> Result<(), StorageError>
    where
        C: AsyncCommands + redis::aio::ConnectionLike,
    {
        info!("开始预加载Lua脚本到Redis");

        for script_info in self.get_all_scripts() {
            self.preload_script(conn, script_info).await?;
        }

        info!("Lua脚本预加载完成");
        Ok(())
    }

    /// 预加载单个脚本
    pub async fn preload_script<C>(
        &self,
        conn: &mut C,
        script_info: &LuaScriptInfo,
    ) -> Result<(), StorageError>
    where
        C: AsyncCommands + redis::aio::ConnectionLike,
    {
        // 计算SHA
        let script = Script::new(script_info.script);
        let sha = script.get_hash().to_string();

        // 缓存SHA
        script_info.set_sha(sha.clone());

        // 执行SCRIPT LOAD预加载
        let _: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script_info.script)
            .query_async(conn)
            .await
            .map_err(|e| {
                error!("预加载脚本失败: {:?}, 错误: {}", script_info.script_type, e);
                StorageError::ConnectionError(format!("预加载脚本失败: {}", e))
            })?;

        debug!(
            "脚本预加载成功: {:?}, SHA: {}",
            script_info.script_type, sha
        );

        Ok(())
    }

    /// 执行脚本（使用SHA）
    pub async fn execute_script<C, T>(
        &self,
        conn: &mut C,
        script_type: LuaScriptType,
        keys: &[&str],
        args: &[&str],
    ) -> Result<T, StorageError>
    where
        C: AsyncCommands + redis::aio::ConnectionLike,
        T: redis::FromRedisValue,
    {
        let script_info = self
            .get_script(script_type)
            .ok_or_else(|| StorageError::QueryError(format!("未找到脚本: {:?}", script_type)))?;

        let sha = script_info
            .get_sha()
            .ok_or_else(|| StorageError::QueryError("脚本SHA未初始化".to_string()))?;

        trace!("执行脚本: {:?}, SHA: {}", script_type, sha);

        // 尝试使用SHA执行
        match redis::cmd("EVALSHA")
            .arg(&sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, T>(conn)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                // 如果SHA不存在，重新加载脚本
                if e.to_string().contains("NOSCRIPT") {
                    debug!("脚本SHA不存在，重新加载: {:?}", script_type);
                    self.preload_script(conn, script_info).await?;

                    // 重试执行
                    redis::cmd("EVALSHA")
                        .arg(&sha)
                        .arg(keys.len())
                        .arg(keys)
                        .arg(args)
                        .query_async::<_, T>(conn)
                        .await
                        .map_err(|e| {
                            error!("脚本执行失败: {:?}, 错误: {}", script_type, e);
                            StorageError::QueryError(format!("脚本执行失败: {}", e))
                        })
                } else {
                    error!("脚本执行失败: {:?}, 错误: {}", script_type, e);
                    Err(StorageError::QueryError(format!("脚本执行失败: {}", e)))
                }
            }
        }
    }

    /// 刷新所有脚本的SHA缓存
    pub fn clear_sha_cache(&self) {
        for script_info in self.get_all_scripts() {
            *script_info.sha.lock() = None;
        }
        debug!("已清除所有脚本的SHA缓存");
    }
}

impl Default for LuaScriptManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua_script_type_name() {
        assert_eq!(LuaScriptType::IncrementKeepTtl.name(), "increment_keep_ttl");
    }

    #[test]
    fn test_lua_script_type_version() {
        assert_eq!(LuaScriptType::IncrementKeepTtl.version(), "1.0");
    }

    #[test]
    fn test_lua_script_manager_new() {
        let manager = LuaScriptManager::new();
        assert!(manager.get_script(LuaScriptType::IncrementKeepTtl).is_some());
    }

    #[test]
    fn test_lua_script_info() {
        let script_info =
            LuaScriptInfo::new(LuaScriptType::IncrementKeepTtl, INCREMENT_KEEP_TTL_SCRIPT);
        assert_eq!(script_info.script_type, LuaScriptType::IncrementKeepTtl);
        assert_eq!(script_info.script, INCREMENT_KEEP_TTL_SCRIPT);
        assert!(script_info.get_sha().is_none());

        script_info.set_sha("test_sha".to_string());
        assert_eq!(script_info.get_sha(), Some("test_sha".to_string()));
    }

    #[test]
    fn test_clear_sha_cache() {
        let manager = LuaScriptManager::new();

        for script_info in manager.get_all_scripts() {
            script_info.set_sha("test_sha".to_string());
        }

        manager.clear_sha_cache();

        for script_info in manager.get_all_scripts() {
            assert!(script_info.get_sha().is_none());
        }
    }

    #[test]
    fn test_script_constants_validity() {
        // 验证脚本包含必要的Redis命令
        assert!(!INCREMENT_KEEP_TTL_SCRIPT.is_empty());
        assert!(INCREMENT_KEEP_TTL_SCRIPT.contains("GET"));
        assert!(INCREMENT_KEEP_TTL_SCRIPT.contains("PTTL"));
        assert!(INCREMENT_KEEP_TTL_SCRIPT.contains("cjson.decode"));
        assert!(INCREMENT_KEEP_TTL_SCRIPT.contains("'PX'"));
    }
}

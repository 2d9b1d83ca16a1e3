//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 审计日志模块
//!
//! 引擎侧只依赖一个窄契约：事件通过 [`AuditHandle::emit`] 统一脱敏后
//! 非阻塞投递（try_send），后台任务逐条写出JSONL。通道满时丢弃事件
//! 并记录警告，不影响请求路径。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Sender};
use tracing::{error, info, warn};

/// 审计事件类型
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// 风控决策（限流/锁定拒绝）
    Decision {
        timestamp: DateTime<Utc>,
        identifier: String,
        decision: String,
        reason: String,
        request_id: Option<String>,
    },
    /// 疑似拆分交易告警
    StructuringDetected {
        timestamp: DateTime<Utc>,
        user_id: String,
        pattern: String,
        success: bool,
    },
    /// 锁定操作
    LockoutOperation {
        timestamp: DateTime<Utc>,
        target: String,
        action: String,
        reason: String,
        expires_at: Option<DateTime<Utc>>,
    },
    /// 错误事件
    ErrorEvent {
        timestamp: DateTime<Utc>,
        error_type: String,
        message: String,
    },
}

impl AuditEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::Decision { timestamp, .. } => *timestamp,
            AuditEvent::StructuringDetected { timestamp, .. } => *timestamp,
            AuditEvent::LockoutOperation { timestamp, .. } => *timestamp,
            AuditEvent::ErrorEvent { timestamp, .. } => *timestamp,
        }
    }

    /// 脱敏事件中的主体标识字段（IP、账户、用户ID）
    fn sanitized(self) -> Self {
        match self {
            AuditEvent::Decision {
                timestamp,
                identifier,
                decision,
                reason,
                request_id,
            } => AuditEvent::Decision {
                timestamp,
                identifier: sanitize_identifier(&identifier),
                decision,
                reason,
                request_id,
            },
            AuditEvent::StructuringDetected {
                timestamp,
                user_id,
                pattern,
                success,
            } => AuditEvent::StructuringDetected {
                timestamp,
                user_id: sanitize_identifier(&user_id),
                pattern,
                success,
            },
            AuditEvent::LockoutOperation {
                timestamp,
                target,
                action,
                reason,
                expires_at,
            } => AuditEvent::LockoutOperation {
                timestamp,
                target: sanitize_identifier(&target),
                action,
                reason,
                expires_at,
            },
            event @ AuditEvent::ErrorEvent { .. } => event,
        }
    }
}

/// 审计日志统计
#[derive(Debug, Default)]
pub struct AuditLogStats {
    events_logged: AtomicU64,
    dropped_events: AtomicU64,
    write_failures: AtomicU64,
}

impl AuditLogStats {
    pub fn events_logged(&self) -> u64 {
        self.events_logged.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.events_logged.store(0, Ordering::Relaxed);
        self.dropped_events.store(0, Ordering::Relaxed);
        self.write_failures.store(0, Ordering::Relaxed);
    }
}

/// 敏感数据脱敏
///
/// 对标识符和其他敏感数据进行脱敏处理
pub(crate) fn sanitize_identifier(identifier: &str) -> String {
    // 检查是否是 IP 地址
    if identifier.contains('.') && identifier.parse::<std::net::IpAddr>().is_ok() {
        // IP 地址：保留前两段，后两段掩码
        let parts: Vec<&str> = identifier.split('.').collect();
        if parts.len() == 4 {
            return format!("{}.{}.xxx.xxx", parts[0], parts[1]);
        }
    }

    // 检查是否是邮箱
    if identifier.contains('@') {
        // 邮箱：保留用户名前3位和域名
        let parts: Vec<&str> = identifier.split('@').collect();
        if parts.len() == 2 {
            let username = parts[0];
            let masked_username = if username.len() > 3 {
                format!("{}***", &username[..3])
            } else {
                "***".to_string()
            };
            return format!("{}@{}", masked_username, parts[1]);
        }
    }

    // 其他标识符：只显示前3位和后3位
    if identifier.len() > 6 {
        format!(
            "{}***{}",
            &identifier[..3],
            &identifier[identifier.len() - 3..]
        )
    } else {
        "***".to_string()
    }
}

/// 审计日志配置
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    pub channel_capacity: usize,
    pub output_path: Option<String>,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10000,
            output_path: None,
        }
    }
}

impl AuditLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn output_path(mut self, path: String) -> Self {
        self.output_path = Some(path);
        self
    }
}

/// 非阻塞审计事件发送句柄
///
/// 所有事件的唯一入口：先脱敏主体标识，再try_send（不等待），
/// 通道满时丢弃事件并计数。
#[derive(Debug, Clone)]
pub struct AuditHandle {
    sender: Sender<AuditEvent>,
    stats: Arc<AuditLogStats>,
}

impl AuditHandle {
    /// 脱敏并非阻塞发送事件
    pub fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.sender.try_send(event.sanitized()) {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!("审计事件被丢弃（通道已满或已关闭）: {}", e);
        }
    }
}

/// 审计日志记录器
#[derive(Debug)]
pub struct AuditLogger {
    sender: Sender<AuditEvent>,
    stats: Arc<AuditLogStats>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl AuditLogger {
    /// 创建记录器并启动写入任务
    ///
    /// # Panics
    ///
    /// 写入任务通过 `tokio::spawn` 启动，必须在Tokio运行时上下文内调用。
    pub fn new(config: AuditLogConfig) -> Self {
        info!("创建审计日志记录器");

        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(AuditLogStats::default());

        let write_handle = tokio::spawn(Self::write_task(receiver, Arc::clone(&stats), config));

        Self {
            sender,
            stats,
            write_handle,
        }
    }

    /// 获取非阻塞发送句柄
    pub fn handle(&self) -> AuditHandle {
        AuditHandle {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    async fn write_task(
        mut receiver: mpsc::Receiver<AuditEvent>,
        stats: Arc<AuditLogStats>,
        config: AuditLogConfig,
    ) {
        while let Some(event) = receiver.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    info!("审计日志: {}", json);
                    stats.events_logged.fetch_add(1, Ordering::Relaxed);

                    if let Some(ref path) = config.output_path {
                        if let Err(e) = Self::append_line(path, &json) {
                            stats.write_failures.fetch_add(1, Ordering::Relaxed);
                            error!("写入审计日志文件失败: {}: {}", path, e);
                        }
                    }
                }
                Err(e) => {
                    stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!("序列化审计日志失败: {}", e);
                }
            }
        }

        info!("审计日志写入任务结束");
    }

    /// 追加模式写入，每行一条JSON记录；目录不存在时自动创建
    fn append_line(path: &str, content: &str) -> std::io::Result<()> {
        use std::fs::OpenOptions;
        use std::io::Write;

        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", content)?;

        Ok(())
    }

    pub fn stats(&self) -> &AuditLogStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        info!("停止审计日志记录器");
        // 换出sender让写入任务的通道收到关闭信号，写完剩余事件
        let (dummy_sender, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.sender, dummy_sender));
        let handle = std::mem::replace(&mut self.write_handle, tokio::spawn(async {}));
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.write_handle.abort();
    }
}

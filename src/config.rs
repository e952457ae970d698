/// 网络配置
///
/// 配置以普通值参数注入：会话超时、回环地址起始端口、邮箱执行方式。
/// 库本身不读取配置文件，调用方可以用任意 serde 格式反序列化 `NetConfig`。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::actor::Executor;
use crate::error::TransportError;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::InvalidValue { field, reason, .. } => TransportError::config_error(field, reason),
        }
    }
}

/// 邮箱排空方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// 在调度线程上直接排空
    SameThread,
    /// 在当前 tokio 运行时上排空
    Tokio,
}

impl Default for ExecutorMode {
    fn default() -> Self {
        ExecutorMode::SameThread
    }
}

/// 虚拟网络与会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// 会话存活窗口（毫秒）
    pub session_timeout_ms: u64,
    /// 回环地址工厂分配的第一个端口
    pub start_port: u16,
    /// 邮箱排空方式
    pub executor: ExecutorMode,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            start_port: 1,
            executor: ExecutorMode::SameThread,
        }
    }
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_start_port(mut self, port: u16) -> Self {
        self.start_port = port;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorMode) -> Self {
        self.executor = executor;
        self
    }

    /// 会话超时
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// 构造邮箱执行器
    ///
    /// 选择 tokio 但当前不在运行时内时退回同线程执行
    pub fn build_executor(&self) -> Executor {
        match self.executor {
            ExecutorMode::SameThread => Executor::SameThread,
            ExecutorMode::Tokio => match tokio::runtime::Handle::try_current() {
                Ok(handle) => Executor::Tokio(handle),
                Err(_) => {
                    tracing::warn!("🚨 没有可用的 tokio 运行时，邮箱改为同线程执行");
                    Executor::SameThread
                }
            },
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
                suggestion: "set a liveness window like 30000".to_string(),
            });
        }

        if self.start_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "start_port".to_string(),
                value: "0".to_string(),
                reason: "port 0 is reserved".to_string(),
                suggestion: "start minting loopback ports from 1".to_string(),
            });
        }

        Ok(())
    }

    /// 从环境变量覆盖默认值
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("ZKNET_SESSION_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(timeout) => {
                    tracing::info!("🔧 环境变量指定会话超时: {}ms", timeout);
                    config.session_timeout_ms = timeout;
                }
                Err(_) => tracing::warn!("🚨 无效的会话超时: {}, 使用默认配置", value),
            }
        }

        if let Some(value) = lookup("ZKNET_START_PORT") {
            match value.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("🔧 环境变量指定起始端口: {}", port);
                    config.start_port = port;
                }
                Err(_) => tracing::warn!("🚨 无效的起始端口: {}, 使用默认配置", value),
            }
        }

        if let Some(value) = lookup("ZKNET_EXECUTOR") {
            match value.to_lowercase().as_str() {
                "same_thread" => config.executor = ExecutorMode::SameThread,
                "tokio" => config.executor = ExecutorMode::Tokio,
                _ => tracing::warn!("🚨 未知的执行方式: {}, 使用默认配置", value),
            }
        }

        config
    }
}

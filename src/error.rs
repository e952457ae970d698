use std::net::SocketAddr;
use std::time::Duration;

use crate::event::ConnectionState;
use crate::protocol::{ErrorCode, OpCode};
use crate::SessionId;

/// 会话终止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 正常关闭（close-session 完成）
    Normal,
    /// 心跳超时
    Timeout,
    /// 错误（协议违例、连接丢失）
    Error(String),
    /// 被外部强制过期
    Forced,
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 连接已进入终止状态
    #[error("Connection closed (state: {state:?})")]
    Closed {
        state: ConnectionState,
    },

    /// 目标地址没有绑定服务端
    #[error("Connection refused: no server bound to {address}")]
    ConnectionRefused {
        address: SocketAddr,
    },

    /// 监听地址已被占用
    #[error("Address already in use: {address}")]
    AddressInUse {
        address: SocketAddr,
    },

    /// 当前状态不允许该操作
    #[error("Illegal state {state} for operation '{operation}'")]
    IllegalState {
        state: String,
        operation: String,
    },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 编解码错误
    #[error("Codec error: {reason}")]
    Codec {
        reason: String,
    },

    /// 服务端返回的错误码
    #[error("Server error for {op:?}: {code:?}")]
    Server {
        op: OpCode,
        code: ErrorCode,
    },

    /// 会话过期
    #[error("Session {session} expired")]
    SessionExpired {
        session: SessionId,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Closed { .. } => true,            // 重新建立连接即可
            TransportError::ConnectionRefused { .. } => true, // 服务端可能稍后绑定
            TransportError::AddressInUse { .. } => false,
            TransportError::IllegalState { .. } => false,
            TransportError::Protocol { .. } => false,
            TransportError::Codec { .. } => false,
            TransportError::Server { code, .. } => code.is_retryable(),
            TransportError::SessionExpired { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Timeout { .. } => true,
        }
    }

    /// 获取建议的重试延迟
    pub fn retry_delay(&self) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }

        match self {
            TransportError::Connection { .. } => Some(Duration::from_millis(1000)),
            TransportError::Closed { .. } => Some(Duration::from_millis(500)),
            TransportError::ConnectionRefused { .. } => Some(Duration::from_millis(1000)),
            TransportError::Server { .. } => Some(Duration::from_millis(100)),
            TransportError::Timeout { .. } => Some(Duration::from_millis(200)),
            _ => None,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Closed { .. } => "CONNECTION_CLOSED",
            TransportError::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            TransportError::AddressInUse { .. } => "ADDRESS_IN_USE",
            TransportError::IllegalState { .. } => "ILLEGAL_STATE",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Codec { .. } => "CODEC_ERROR",
            TransportError::Server { .. } => "SERVER_ERROR",
            TransportError::SessionExpired { .. } => "SESSION_EXPIRED",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }

    /// 添加会话上下文
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        match &mut self {
            TransportError::Connection { reason, .. } | TransportError::Protocol { reason, .. } => {
                if !reason.contains("session:") {
                    *reason = format!("{} (session: {})", reason, session_id);
                }
            }
            _ => {} // 其他错误类型不需要会话信息
        }
        self
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建连接已关闭错误
    pub fn closed(state: ConnectionState) -> Self {
        Self::Closed { state }
    }

    /// 创建连接被拒绝错误
    pub fn connection_refused(address: SocketAddr) -> Self {
        Self::ConnectionRefused { address }
    }

    /// 创建地址占用错误
    pub fn address_in_use(address: SocketAddr) -> Self {
        Self::AddressInUse { address }
    }

    /// 创建非法状态错误
    pub fn illegal_state(state: impl std::fmt::Debug, operation: impl Into<String>) -> Self {
        Self::IllegalState {
            state: format!("{:?}", state),
            operation: operation.into(),
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建编解码错误
    pub fn codec_error(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    /// 创建服务端错误
    pub fn server_error(op: OpCode, code: ErrorCode) -> Self {
        Self::Server { op, code }
    }

    /// 创建会话过期错误
    pub fn session_expired(session: SessionId) -> Self {
        Self::SessionExpired { session }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

/// 兼容性转换 - 从标准IO错误
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                TransportError::codec_error(error.to_string())
            }
            _ => TransportError::Connection {
                reason: format!("IO error: {}", error),
                retryable: matches!(
                    error.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ),
            },
        }
    }
}

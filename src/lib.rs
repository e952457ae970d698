/// zknet - 协调服务网络层
///
/// 提供进程内虚拟网络传输（IntraVm）以及构建在任意连接之上的会话协议状态机。
/// 基于 Actor 邮箱设计：每个端点串行处理自己的邮箱，连接只是成对端点之上的薄协调层。

// 传输层
pub mod transport;

// 会话协议
pub mod protocol;

// 核心类型
pub mod actor;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod promise;
pub mod stream;

/// 会话ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(i64);

impl SessionId {
    /// 尚未由服务端分配的会话ID
    pub const UNINITIALIZED: SessionId = SessionId(0);

    /// 创建新的会话ID
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// 是否已经由服务端分配
    pub fn is_initialized(&self) -> bool {
        *self != Self::UNINITIALIZED
    }

    /// 生成下一个会话ID
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<SessionId> for i64 {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

// 重新导出核心类型
pub use actor::Executor;
pub use config::{ConfigError, ExecutorMode, NetConfig};
pub use connection::{ClientConnectionFactory, Connection, ServerConnectionFactory};
pub use error::{CloseReason, TransportError};
pub use event::{ConnectionEvent, ConnectionListener, ConnectionState, SessionEvent, Transition};
pub use promise::Promise;
pub use stream::EventStream;

pub use transport::{
    IntraVmClientConnectionFactory, IntraVmConnection, IntraVmEndpoint, IntraVmNet,
    IntraVmServerConnectionFactory, LoopbackAddresses,
};

pub use protocol::{
    ClientMessage, ClientSession, OpCode, ProtocolState, ServerMessage, ServerSession, Session,
    SessionTable,
};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;

use std::sync::Arc;

use crate::error::CloseReason;
use crate::protocol::{ProtocolState, Response};
use crate::SessionId;

/// 连接生命周期状态
///
/// 顺序即生命周期：Opening < Opened < Closing < Closed，状态只能向后推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Opening,
    Opened,
    Closing,
    Closed,
}

impl ConnectionState {
    /// 是否已经开始关闭
    pub fn is_closing(&self) -> bool {
        *self >= ConnectionState::Closing
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Opening => "OPENING",
            ConnectionState::Opened => "OPENED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// 一次状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

impl<S> Transition<S> {
    pub fn new(from: S, to: S) -> Self {
        Self { from, to }
    }
}

impl<S: std::fmt::Display> std::fmt::Display for Transition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// 端点向监听器发布的事件
#[derive(Debug, Clone)]
pub enum ConnectionEvent<O> {
    /// 生命周期迁移
    State(Transition<ConnectionState>),
    /// 解码后的入站消息
    Read(O),
}

impl<O> ConnectionEvent<O> {
    /// 是否为进入 Closed 的迁移
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionEvent::State(t) if t.to == ConnectionState::Closed)
    }
}

/// 连接事件监听器
///
/// 发布方不保证串行调用，监听器内部状态需要自行同步
pub trait ConnectionListener<O>: Send + Sync {
    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        let _ = transition;
    }

    fn handle_connection_read(&self, message: &O) {
        let _ = message;
    }
}

/// 把连接事件转发到 flume 通道的监听器
pub struct ChannelListener<O> {
    sender: flume::Sender<ConnectionEvent<O>>,
}

impl<O: Clone + Send + 'static> ChannelListener<O> {
    /// 创建监听器及其接收端
    pub fn channel() -> (Arc<Self>, flume::Receiver<ConnectionEvent<O>>) {
        let (sender, receiver) = flume::unbounded();
        (Arc::new(Self { sender }), receiver)
    }
}

impl<O: Clone + Send + 'static> ConnectionListener<O> for ChannelListener<O> {
    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        let _ = self.sender.send(ConnectionEvent::State(transition));
    }

    fn handle_connection_read(&self, message: &O) {
        let _ = self.sender.send(ConnectionEvent::Read(message.clone()));
    }
}

/// 会话层事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// 协议状态迁移
    StateChanged {
        session_id: SessionId,
        transition: Transition<ProtocolState>,
    },
    /// 服务端推送的通知（watch 事件）
    Notification {
        session_id: SessionId,
        response: Response,
    },
    /// 底层连接状态迁移
    ConnectionStateChanged {
        session_id: SessionId,
        transition: Transition<ConnectionState>,
    },
    /// 会话终止
    Terminated {
        session_id: SessionId,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Notification { session_id, .. }
            | SessionEvent::ConnectionStateChanged { session_id, .. }
            | SessionEvent::Terminated { session_id, .. } => *session_id,
        }
    }

    pub fn is_state_event(&self) -> bool {
        matches!(self, SessionEvent::StateChanged { .. })
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, SessionEvent::Notification { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Terminated { .. })
    }
}

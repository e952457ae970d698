/// 会话协议消息
///
/// 只定义会话状态机需要的外壳：操作码、事务号、错误码和请求/响应信封。
/// 具体操作的负载是不透明字节，由上层自行编解码。

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// 事务ID
pub type Xid = i32;

/// 服务端事务标记
pub type Zxid = i64;

/// 服务端推送通知使用的固定 xid
pub const NOTIFICATION_XID: Xid = -1;
/// 心跳使用的固定 xid
pub const PING_XID: Xid = -2;
/// 认证使用的固定 xid
pub const AUTH_XID: Xid = -4;
/// 重设 watch 使用的固定 xid
pub const SET_WATCHES_XID: Xid = -8;

/// 协议版本
pub const PROTOCOL_VERSION: i32 = 0;

/// 操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Notification,
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    GetAcl,
    SetAcl,
    GetChildren,
    Sync,
    Ping,
    GetChildren2,
    Check,
    Multi,
    Auth,
    SetWatches,
    CreateSession,
    CloseSession,
    Error,
}

impl OpCode {
    /// 线上操作码
    pub fn code(self) -> i32 {
        match self {
            OpCode::Notification => 0,
            OpCode::Create => 1,
            OpCode::Delete => 2,
            OpCode::Exists => 3,
            OpCode::GetData => 4,
            OpCode::SetData => 5,
            OpCode::GetAcl => 6,
            OpCode::SetAcl => 7,
            OpCode::GetChildren => 8,
            OpCode::Sync => 9,
            OpCode::Ping => 11,
            OpCode::GetChildren2 => 12,
            OpCode::Check => 13,
            OpCode::Multi => 14,
            OpCode::Auth => 100,
            OpCode::SetWatches => 101,
            OpCode::CreateSession => -10,
            OpCode::CloseSession => -11,
            OpCode::Error => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let op = match code {
            0 => OpCode::Notification,
            1 => OpCode::Create,
            2 => OpCode::Delete,
            3 => OpCode::Exists,
            4 => OpCode::GetData,
            5 => OpCode::SetData,
            6 => OpCode::GetAcl,
            7 => OpCode::SetAcl,
            8 => OpCode::GetChildren,
            9 => OpCode::Sync,
            11 => OpCode::Ping,
            12 => OpCode::GetChildren2,
            13 => OpCode::Check,
            14 => OpCode::Multi,
            100 => OpCode::Auth,
            101 => OpCode::SetWatches,
            -10 => OpCode::CreateSession,
            -11 => OpCode::CloseSession,
            -1 => OpCode::Error,
            _ => return None,
        };
        Some(op)
    }

    /// 固定 xid 的操作，这类请求不进入待决队列的 xid 序列
    pub fn fixed_xid(self) -> Option<Xid> {
        match self {
            OpCode::Notification => Some(NOTIFICATION_XID),
            OpCode::Ping => Some(PING_XID),
            OpCode::Auth => Some(AUTH_XID),
            OpCode::SetWatches => Some(SET_WATCHES_XID),
            _ => None,
        }
    }

    /// 会话生命周期操作只能经由 connect/disconnect 发出
    pub fn is_session_op(self) -> bool {
        matches!(self, OpCode::CreateSession | OpCode::CloseSession)
    }
}

/// 服务端错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidAcl,
    AuthFailed,
    SessionMoved,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::SystemError => -1,
            ErrorCode::RuntimeInconsistency => -2,
            ErrorCode::DataInconsistency => -3,
            ErrorCode::ConnectionLoss => -4,
            ErrorCode::MarshallingError => -5,
            ErrorCode::Unimplemented => -6,
            ErrorCode::OperationTimeout => -7,
            ErrorCode::BadArguments => -8,
            ErrorCode::NoNode => -101,
            ErrorCode::NoAuth => -102,
            ErrorCode::BadVersion => -103,
            ErrorCode::NoChildrenForEphemerals => -108,
            ErrorCode::NodeExists => -110,
            ErrorCode::NotEmpty => -111,
            ErrorCode::SessionExpired => -112,
            ErrorCode::InvalidAcl => -114,
            ErrorCode::AuthFailed => -115,
            ErrorCode::SessionMoved => -118,
        }
    }

    /// 客户端重新发起同一操作是否可能成功
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::ConnectionLoss | ErrorCode::OperationTimeout)
    }
}

/// 建立会话请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: Zxid,
    pub timeout_ms: u32,
    pub session_id: SessionId,
    pub password: Vec<u8>,
}

/// 建立会话响应；会话ID为 UNINITIALIZED 表示拒绝（会话已过期）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: u32,
    pub session_id: SessionId,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    /// 拒绝重连的响应
    pub fn invalid() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            timeout_ms: 0,
            session_id: SessionId::UNINITIALIZED,
            password: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.session_id.is_initialized()
    }
}

/// 普通请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub xid: Xid,
    pub op: OpCode,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(xid: Xid, op: OpCode, payload: Vec<u8>) -> Self {
        Self { xid, op, payload }
    }

    pub fn ping() -> Self {
        Self::new(PING_XID, OpCode::Ping, Vec::new())
    }
}

/// 普通响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub xid: Xid,
    pub zxid: Zxid,
    pub op: OpCode,
    #[serde(default)]
    pub error: Option<ErrorCode>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(xid: Xid, zxid: Zxid, op: OpCode, payload: Vec<u8>) -> Self {
        Self {
            xid,
            zxid,
            op,
            error: None,
            payload,
        }
    }

    pub fn error(xid: Xid, zxid: Zxid, op: OpCode, code: ErrorCode) -> Self {
        Self {
            xid,
            zxid,
            op,
            error: Some(code),
            payload: Vec::new(),
        }
    }

    /// 服务端推送的通知
    pub fn notification(payload: Vec<u8>) -> Self {
        Self::ok(NOTIFICATION_XID, -1, OpCode::Notification, payload)
    }

    pub fn is_notification(&self) -> bool {
        self.xid == NOTIFICATION_XID
    }

    pub fn is_ping(&self) -> bool {
        self.xid == PING_XID
    }
}

/// 客户端发往服务端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect(ConnectRequest),
    Request(Request),
}

impl ClientMessage {
    pub fn op(&self) -> OpCode {
        match self {
            ClientMessage::Connect(_) => OpCode::CreateSession,
            ClientMessage::Request(request) => request.op,
        }
    }
}

/// 服务端发往客户端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connect(ConnectResponse),
    Response(Response),
}

impl ServerMessage {
    pub fn op(&self) -> OpCode {
        match self {
            ServerMessage::Connect(_) => OpCode::CreateSession,
            ServerMessage::Response(response) => response.op,
        }
    }
}

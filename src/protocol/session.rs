use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::protocol::message::ConnectResponse;
use crate::SessionId;

/// 服务端分配的会话信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub password: Vec<u8>,
    /// 协商后的超时
    pub timeout: Duration,
    /// 会话建立时间，未建立为 None
    pub established_at: Option<DateTime<Utc>>,
}

impl Session {
    /// 尚未建立的会话，携带客户端请求的超时
    pub fn uninitialized(timeout: Duration) -> Self {
        Self {
            id: SessionId::UNINITIALIZED,
            password: Vec::new(),
            timeout,
            established_at: None,
        }
    }

    /// 由建立会话响应得到的会话
    pub fn from_response(response: &ConnectResponse) -> Self {
        Self {
            id: response.session_id,
            password: response.password.clone(),
            timeout: Duration::from_millis(response.timeout_ms as u64),
            established_at: Some(Utc::now()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.id.is_initialized()
    }

    /// 超时的毫秒表示，溢出时截断
    pub fn timeout_ms(&self) -> u32 {
        u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({}, timeout={:?})", self.id, self.timeout)
    }
}

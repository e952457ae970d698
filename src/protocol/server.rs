/// 服务端会话应答
///
/// 挂在服务端连接上的监听器：处理建立会话、心跳与关闭会话，
/// 其余请求交给 [`RequestProcessor`]。会话表在所有连接之间共享，
/// 连接断开后会话仍保留，在超时窗口内可以在新连接上凭ID和密码恢复。

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::event::{ConnectionListener, ConnectionState, Transition};
use crate::promise::Promise;
use crate::protocol::message::{
    ClientMessage, ConnectRequest, ConnectResponse, ErrorCode, OpCode, Request, Response,
    ServerMessage, Zxid, PING_XID, PROTOCOL_VERSION,
};
use crate::protocol::session::Session;
use crate::error::TransportError;
use crate::SessionId;

/// 请求未携带超时时使用的会话超时
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    session: Session,
    touched: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.touched + self.session.timeout
    }
}

/// 会话表：分配会话ID与密码，维护全局递增的 zxid
///
/// 每个会话记录最近一次活动的时间，超过会话超时没有活动的会话
/// 由 [`expire_idle`](Self::expire_idle) 清除。
#[derive(Debug)]
pub struct SessionTable {
    next_session: AtomicI64,
    zxid: AtomicI64,
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Self::with_base(1)
    }

    /// 会话ID从 `base` 开始分配
    pub fn with_base(base: i64) -> Arc<Self> {
        Arc::new(Self {
            next_session: AtomicI64::new(base.max(1)),
            zxid: AtomicI64::new(0),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// 新建会话
    pub fn create(&self, timeout: Duration) -> Session {
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
        let timeout = if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout };
        let session = Session {
            id,
            password: Self::password(id),
            timeout,
            established_at: Some(Utc::now()),
        };
        let entry = Entry {
            session: session.clone(),
            touched: Instant::now(),
        };
        self.sessions.write().insert(id, entry);
        session
    }

    /// 凭ID和密码找回会话
    ///
    /// 已经超时的会话被移除，返回 None
    pub fn resume(&self, id: SessionId, password: &[u8]) -> Option<Session> {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        if sessions.get(&id)?.is_expired(now) {
            sessions.remove(&id);
            info!("会话 {} 已超时，拒绝恢复", id);
            return None;
        }
        let entry = sessions.get_mut(&id)?;
        if entry.session.password != password {
            return None;
        }
        entry.touched = now;
        Some(entry.session.clone())
    }

    /// 记录一次会话活动，会话不存在或已超时返回 false
    pub fn touch(&self, id: SessionId) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&id) {
            Some(entry) if !entry.is_expired(now) => {
                entry.touched = now;
                return true;
            }
            Some(_) => {}
            None => return false,
        }
        sessions.remove(&id);
        info!("会话 {} 已超时", id);
        false
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().get(&id).map(|entry| entry.session.clone())
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.write().remove(&id).map(|entry| entry.session)
    }

    /// 移除所有超时未活动的会话，返回被移除的会话ID
    pub fn expire_idle(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.sessions.write().retain(|id, entry| {
            if entry.is_expired(now) {
                expired.push(*id);
                false
            } else {
                true
            }
        });
        expired.sort();
        for id in &expired {
            info!("⏰ 会话 {} 超时，已移除", id);
        }
        expired
    }

    /// 启动过期清扫任务，每个 `tick` 清扫一次；会话表被释放后任务退出
    pub fn start_expiry(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(table) = weak.upgrade() else {
                    return;
                };
                let expired = table.expire_idle();
                trace!("会话清扫: 移除 {} 个, 剩余 {}", expired.len(), table.len());
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// 分配下一个 zxid
    pub fn next_zxid(&self) -> Zxid {
        self.zxid.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_zxid(&self) -> Zxid {
        self.zxid.load(Ordering::SeqCst)
    }

    fn password(id: SessionId) -> Vec<u8> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut password = Vec::with_capacity(16);
        password.extend_from_slice(&id.as_i64().to_be_bytes());
        password.extend_from_slice(&(nanos ^ id.as_i64().rotate_left(17)).to_le_bytes());
        password
    }
}

/// 会话生命周期以外的请求处理器
pub trait RequestProcessor: Send + Sync {
    /// 返回响应负载或错误码
    fn process(&self, session: SessionId, request: &Request) -> Result<Vec<u8>, ErrorCode>;
}

impl<F> RequestProcessor for F
where
    F: Fn(SessionId, &Request) -> Result<Vec<u8>, ErrorCode> + Send + Sync,
{
    fn process(&self, session: SessionId, request: &Request) -> Result<Vec<u8>, ErrorCode> {
        self(session, request)
    }
}

/// 所有请求都回复 Unimplemented
pub struct Unimplemented;

impl RequestProcessor for Unimplemented {
    fn process(&self, _session: SessionId, _request: &Request) -> Result<Vec<u8>, ErrorCode> {
        Err(ErrorCode::Unimplemented)
    }
}

/// 会改变数据树的操作，响应时分配新的 zxid
fn mutates(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Create | OpCode::Delete | OpCode::SetData | OpCode::SetAcl | OpCode::Multi
    )
}

pub struct ServerSession<C>
where
    C: Connection<Input = ServerMessage, Output = ClientMessage>,
{
    connection: Arc<C>,
    table: Arc<SessionTable>,
    processor: Arc<dyn RequestProcessor>,
    session: RwLock<SessionId>,
}

impl<C> ServerSession<C>
where
    C: Connection<Input = ServerMessage, Output = ClientMessage>,
{
    /// 在连接上挂接应答器
    ///
    /// 连接的发布者持有应答器，连接关闭后随监听器列表一起释放
    pub fn attach(connection: Arc<C>, table: Arc<SessionTable>, processor: Arc<dyn RequestProcessor>) -> Arc<Self> {
        let session = Arc::new(Self {
            connection,
            table,
            processor,
            session: RwLock::new(SessionId::UNINITIALIZED),
        });
        session.connection.subscribe(session.clone());
        session
    }

    /// 新连接监听器：为服务端工厂接受的每个连接挂接应答器
    pub fn acceptor(
        table: Arc<SessionTable>,
        processor: Arc<dyn RequestProcessor>,
    ) -> impl Fn(&Arc<C>) + Send + Sync + 'static {
        move |connection: &Arc<C>| {
            Self::attach(connection.clone(), table.clone(), processor.clone());
        }
    }

    pub fn session_id(&self) -> SessionId {
        *self.session.read()
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// 向客户端推送通知
    pub fn notify(&self, payload: Vec<u8>) -> Promise<Result<(), TransportError>> {
        self.connection.write(ServerMessage::Response(Response::notification(payload)))
    }

    fn respond(&self, message: ServerMessage) {
        let written = self.connection.write(message);
        if let Some(Err(error)) = written.try_get() {
            debug!("[{}] 响应未送达: {}", self.connection.local_address(), error);
        }
    }

    fn handle_connect(&self, request: &ConnectRequest) {
        let session = if request.session_id.is_initialized() {
            self.table.resume(request.session_id, &request.password)
        } else {
            Some(self.table.create(Duration::from_millis(request.timeout_ms as u64)))
        };

        match session {
            Some(session) => {
                *self.session.write() = session.id;
                info!(
                    "[{}] ✅ 会话 {} 已建立 (timeout={}ms)",
                    self.connection.local_address(),
                    session.id,
                    session.timeout_ms()
                );
                self.table.next_zxid();
                self.respond(ServerMessage::Connect(ConnectResponse {
                    protocol_version: PROTOCOL_VERSION,
                    timeout_ms: session.timeout_ms(),
                    session_id: session.id,
                    password: session.password,
                }));
            }
            None => {
                warn!(
                    "[{}] 未知会话 {}，拒绝重连",
                    self.connection.local_address(),
                    request.session_id
                );
                self.respond(ServerMessage::Connect(ConnectResponse::invalid()));
                let _ = self.connection.close();
            }
        }
    }

    fn handle_request(&self, request: &Request) {
        let session_id = self.session_id();
        match request.op {
            OpCode::Ping => {
                if session_id.is_initialized() {
                    self.table.touch(session_id);
                }
                self.respond(ServerMessage::Response(Response::ok(
                    PING_XID,
                    self.table.last_zxid(),
                    OpCode::Ping,
                    Vec::new(),
                )));
            }
            _ if !session_id.is_initialized() || !self.table.touch(session_id) => {
                self.respond(ServerMessage::Response(Response::error(
                    request.xid,
                    self.table.last_zxid(),
                    request.op,
                    ErrorCode::SessionExpired,
                )));
            }
            OpCode::CloseSession => {
                self.table.remove(session_id);
                info!("[{}] 会话 {} 已关闭", self.connection.local_address(), session_id);
                self.respond(ServerMessage::Response(Response::ok(
                    request.xid,
                    self.table.next_zxid(),
                    OpCode::CloseSession,
                    Vec::new(),
                )));
                let _ = self.connection.close();
            }
            op => {
                let zxid = if mutates(op) {
                    self.table.next_zxid()
                } else {
                    self.table.last_zxid()
                };
                let response = match self.processor.process(session_id, request) {
                    Ok(payload) => Response::ok(request.xid, zxid, op, payload),
                    Err(code) => Response::error(request.xid, zxid, op, code),
                };
                self.respond(ServerMessage::Response(response));
            }
        }
    }
}

impl<C> ConnectionListener<ClientMessage> for ServerSession<C>
where
    C: Connection<Input = ServerMessage, Output = ClientMessage>,
{
    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        if transition.to == ConnectionState::Closed {
            debug!(
                "[{}] 连接关闭，会话 {} 保留",
                self.connection.local_address(),
                self.session_id()
            );
        }
    }

    fn handle_connection_read(&self, message: &ClientMessage) {
        match message {
            ClientMessage::Connect(request) => self.handle_connect(request),
            ClientMessage::Request(request) => self.handle_request(request),
        }
    }
}

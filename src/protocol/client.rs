/// 客户端会话
///
/// 构建在任意 [`Connection`] 之上的会话协议状态机：
/// ANONYMOUS → CONNECTING → CONNECTED → DISCONNECTING → DISCONNECTED，
/// 协议违例或连接丢失进入 ERROR。请求按发送顺序进入待决队列，
/// 响应只与队首匹配。

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::error::{CloseReason, TransportError};
use crate::event::{ConnectionListener, ConnectionState, SessionEvent, Transition};
use crate::promise::Promise;
use crate::protocol::message::{
    ClientMessage, ConnectRequest, OpCode, Request, Response, ServerMessage, Xid, Zxid,
    PROTOCOL_VERSION,
};
use crate::protocol::request_manager::{
    Mismatch, PendingQueue, PendingTask, Reply, XidGenerator, ZxidTracker,
};
use crate::protocol::session::Session;
use crate::protocol::state::ProtocolState;
use crate::protocol::timeout::TimeOut;
use crate::stream::EventStream;
use crate::transport::Automaton;
use crate::SessionId;

/// 建立会话请求在待决队列中的 xid
const CONNECT_XID: Xid = 0;

const EVENT_CAPACITY: usize = 256;

pub struct ClientSession<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    connection: Arc<C>,
    listener: Arc<dyn ConnectionListener<ServerMessage>>,
    state: Automaton<ProtocolState>,
    session: RwLock<Session>,
    xids: XidGenerator,
    last_zxid: ZxidTracker,
    pending: PendingQueue,
    /// xid 分配、入队与写出必须按同一顺序发生
    send_lock: ReentrantMutex<()>,
    timeout: TimeOut,
    events: broadcast::Sender<SessionEvent>,
    close_reason: Mutex<Option<CloseReason>>,
    this: Weak<Self>,
}

/// 把连接事件转给会话，不持有会话
struct SessionListener<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    session: Weak<ClientSession<C>>,
}

impl<C> ConnectionListener<ServerMessage> for SessionListener<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        if let Some(session) = self.session.upgrade() {
            session.handle_connection_state(transition);
        }
    }

    fn handle_connection_read(&self, message: &ServerMessage) {
        if let Some(session) = self.session.upgrade() {
            session.handle_message(message);
        }
    }
}

impl<C> ClientSession<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    /// 在连接上创建一个匿名会话，`timeout` 为请求的会话超时
    pub fn new(connection: Arc<C>, timeout: Duration) -> Arc<Self> {
        Self::build(connection, Session::uninitialized(timeout), 0)
    }

    pub fn from_config(connection: Arc<C>, config: &NetConfig) -> Arc<Self> {
        Self::new(connection, config.session_timeout())
    }

    /// 在新连接上恢复已有会话，connect 时携带原会话ID和密码
    pub fn resume(connection: Arc<C>, session: Session, last_zxid: Zxid) -> Arc<Self> {
        Self::build(connection, session, last_zxid)
    }

    fn build(connection: Arc<C>, session: Session, last_zxid: Zxid) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let timeout = TimeOut::new(session.timeout);
        let client = Arc::new_cyclic(|this: &Weak<Self>| {
            let listener: Arc<dyn ConnectionListener<ServerMessage>> = Arc::new(SessionListener {
                session: this.clone(),
            });
            let last = ZxidTracker::new();
            last.advance(last_zxid);
            Self {
                connection,
                listener,
                state: Automaton::new(ProtocolState::Anonymous),
                session: RwLock::new(session),
                xids: XidGenerator::new(),
                last_zxid: last,
                pending: PendingQueue::new(),
                send_lock: ReentrantMutex::new(()),
                timeout,
                events,
                close_reason: Mutex::new(None),
                this: this.clone(),
            }
        });
        client.connection.subscribe(client.listener.clone());
        client
    }

    pub fn state(&self) -> ProtocolState {
        self.state.state()
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.session.read().id
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub fn last_zxid(&self) -> Zxid {
        self.last_zxid.get()
    }

    /// 推进最近看到的 zxid，只接受更大的值
    pub fn advance_last_zxid(&self, zxid: Zxid) -> bool {
        self.last_zxid.advance(zxid)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 会话终止原因，未终止为 None
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// 当前生效的会话超时（连接前为请求值，之后为协商值）
    pub fn timeout(&self) -> Duration {
        self.timeout.timeout()
    }

    pub fn events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// 发送建立会话请求，只允许在 ANONYMOUS 状态调用一次
    pub fn connect(&self) -> Promise<Result<Session, TransportError>> {
        let _guard = self.send_lock.lock();

        let connection_state = self.connection.state();
        if connection_state.is_closing() {
            return Promise::ready(Err(TransportError::closed(connection_state)));
        }
        if self.transition(ProtocolState::Connecting).is_none() {
            return Promise::ready(Err(TransportError::illegal_state(self.state(), "connect")));
        }

        let request = {
            let session = self.session.read();
            ConnectRequest {
                protocol_version: PROTOCOL_VERSION,
                last_zxid_seen: self.last_zxid.get(),
                timeout_ms: session.timeout_ms(),
                session_id: session.id,
                password: session.password.clone(),
            }
        };
        debug!("[{}] 🔗 建立会话 (timeout={}ms)", self, request.timeout_ms);

        let promise = Promise::new();
        self.pending.push(PendingTask {
            xid: CONNECT_XID,
            op: OpCode::CreateSession,
            reply: Reply::Session(promise.clone()),
        });
        self.send(CONNECT_XID, ClientMessage::Connect(request));
        promise
    }

    /// 提交普通请求
    ///
    /// 会话生命周期操作、通知与心跳不能经由这里发出
    pub fn submit(&self, op: OpCode, payload: Vec<u8>) -> Promise<Result<Response, TransportError>> {
        if op.is_session_op() || matches!(op, OpCode::Notification | OpCode::Ping | OpCode::Error) {
            return Promise::ready(Err(TransportError::illegal_state(
                self.state(),
                format!("submit {:?}", op),
            )));
        }

        let _guard = self.send_lock.lock();
        let state = self.state();
        if !state.accepts_requests() {
            return Promise::ready(Err(TransportError::illegal_state(state, format!("submit {:?}", op))));
        }

        let xid = op.fixed_xid().unwrap_or_else(|| self.xids.next());
        let promise = Promise::new();
        self.pending.push(PendingTask {
            xid,
            op,
            reply: Reply::Operation(promise.clone()),
        });

        // 入队与终止并发时，终止方可能已经排空了队列
        let state = self.state();
        if state.is_terminal() {
            if let Some(task) = self.pending.remove(xid) {
                task.fail(TransportError::illegal_state(state, format!("submit {:?}", op)));
            }
            return promise;
        }

        trace!("[{}] 📤 {:?} xid={}", self, op, xid);
        self.send(xid, ClientMessage::Request(Request::new(xid, op, payload)));
        promise
    }

    /// 发送关闭会话请求；成功响应后进入 DISCONNECTED 并关闭连接
    pub fn disconnect(&self) -> Promise<Result<Response, TransportError>> {
        let _guard = self.send_lock.lock();
        if self.transition(ProtocolState::Disconnecting).is_none() {
            return Promise::ready(Err(TransportError::illegal_state(self.state(), "disconnect")));
        }

        let xid = self.xids.next();
        let promise = Promise::new();
        self.pending.push(PendingTask {
            xid,
            op: OpCode::CloseSession,
            reply: Reply::Operation(promise.clone()),
        });
        self.send(xid, ClientMessage::Request(Request::new(xid, OpCode::CloseSession, Vec::new())));
        promise
    }

    /// 发送心跳，心跳不进入待决队列
    pub fn ping(&self) -> Promise<Result<(), TransportError>> {
        let state = self.state();
        if state != ProtocolState::Connected {
            return Promise::ready(Err(TransportError::illegal_state(state, "ping")));
        }
        let _guard = self.send_lock.lock();
        self.connection.write(ClientMessage::Request(Request::ping()))
    }

    /// 外部过期信号
    ///
    /// 任何非终态都进入 DISCONNECTED；待决请求以会话过期失败，连接关闭。
    /// 返回本次调用是否完成了状态迁移。
    pub fn expire(&self) -> bool {
        self.expire_with(CloseReason::Forced)
    }

    /// 启动心跳任务
    ///
    /// 每隔超时的三分之一检查一次：超时窗口内没有收到任何消息则过期，
    /// 否则在 CONNECTED 状态发送心跳。会话终止或被释放后任务退出。
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let weak = self.this.clone();
        tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(session) => session.timeout.heartbeat_interval(),
                    None => return,
                };
                tokio::time::sleep(interval).await;

                let Some(session) = weak.upgrade() else {
                    return;
                };
                let state = session.state();
                if state.is_terminal() {
                    return;
                }
                if session.timeout.is_expired() {
                    warn!("[{}] ⏰ 会话超时 ({:?})", session, session.timeout.timeout());
                    session.expire_with(CloseReason::Timeout);
                    return;
                }
                if state == ProtocolState::Connected {
                    let _ = session.ping();
                }
            }
        })
    }

    fn expire_with(&self, reason: CloseReason) -> bool {
        let id = self.session_id();
        let moved = self.transition(ProtocolState::Disconnected).is_some();
        if moved {
            info!("[{}] 会话过期 ({:?})", self, reason);
        }
        for task in self.pending.drain() {
            task.fail(TransportError::session_expired(id));
        }
        if moved {
            self.terminated(reason);
        }
        let _ = self.connection.close();
        moved
    }

    fn send(&self, xid: Xid, message: ClientMessage) {
        let written = self.connection.write(message);
        let this = self.this.clone();
        written.add_listener(move |result| {
            if let Err(error) = result {
                if let Some(session) = this.upgrade() {
                    debug!("[{}] 写出失败 xid={}: {}", session, xid, error);
                    if let Some(task) = session.pending.remove(xid) {
                        task.fail(error.clone());
                    }
                }
            }
        });
    }

    fn transition(&self, to: ProtocolState) -> Option<Transition<ProtocolState>> {
        let transition = self.state.apply(to)?;
        debug!("[{}] 会话状态 {}", self, transition);
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: self.session_id(),
            transition,
        });
        Some(transition)
    }

    fn terminated(&self, reason: CloseReason) {
        *self.close_reason.lock() = Some(reason.clone());
        let _ = self.events.send(SessionEvent::Terminated {
            session_id: self.session_id(),
            reason,
        });
    }

    /// 进入终态（ERROR 或 DISCONNECTED），以 `error` 失败所有待决请求并关闭连接
    fn terminate(&self, to: ProtocolState, error: TransportError, reason: CloseReason) {
        let moved = self.transition(to).is_some();
        for task in self.pending.drain() {
            task.fail(error.clone());
        }
        if moved {
            self.terminated(reason);
        }
        let _ = self.connection.close();
    }

    fn protocol_violation(&self, reason: String) {
        warn!("[{}] ❌ 协议违例: {}", self, reason);
        let error = TransportError::protocol_error("session", reason.clone()).with_session(self.session_id());
        self.terminate(ProtocolState::Error, error, CloseReason::Error(reason));
    }

    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        let _ = self.events.send(SessionEvent::ConnectionStateChanged {
            session_id: self.session_id(),
            transition,
        });
        if transition.to != ConnectionState::Closed {
            return;
        }
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        debug!("[{}] 连接在会话结束前关闭", self);
        let error = TransportError::connection_error("connection lost", true).with_session(self.session_id());
        // 尚未发起会话的连接丢失不是协议错误
        let to = if state == ProtocolState::Anonymous {
            ProtocolState::Disconnected
        } else {
            ProtocolState::Error
        };
        self.terminate(to, error, CloseReason::Error("connection lost".to_string()));
    }

    fn handle_message(&self, message: &ServerMessage) {
        self.timeout.touch();

        if let ServerMessage::Response(response) = message {
            if response.is_notification() {
                trace!("[{}] 📨 通知", self);
                self.observe_zxid(message);
                let _ = self.events.send(SessionEvent::Notification {
                    session_id: self.session_id(),
                    response: response.clone(),
                });
                return;
            }
            if response.is_ping() {
                trace!("[{}] 💓 心跳响应", self);
                return;
            }
        }

        if self.state().is_terminal() {
            trace!("[{}] DROPPING {:?} in {}", self, message.op(), self.state());
            return;
        }

        match self.pending.correlate(message) {
            Ok(task) => {
                self.observe_zxid(message);
                self.complete(task, message);
            }
            Err(Mismatch { expected, received }) => {
                let reason = match expected {
                    Some((xid, op)) => format!("expected {:?} (xid={}), received {:?}", op, xid, received),
                    None => format!("unsolicited {:?}", received),
                };
                self.protocol_violation(reason);
            }
        }
    }

    /// 只有被接受的响应才推进 last_zxid
    fn observe_zxid(&self, message: &ServerMessage) {
        if let ServerMessage::Response(response) = message {
            if response.zxid > 0 {
                self.last_zxid.advance(response.zxid);
            }
        }
    }

    fn complete(&self, task: PendingTask, message: &ServerMessage) {
        match (task.reply, message) {
            (Reply::Session(promise), ServerMessage::Connect(response)) => {
                if response.is_valid() {
                    let session = Session::from_response(response);
                    self.timeout.set_timeout(session.timeout);
                    *self.session.write() = session.clone();
                    self.transition(ProtocolState::Connected);
                    info!("[{}] ✅ 会话已建立", self);
                    promise.set(Ok(session));
                } else {
                    let error = TransportError::session_expired(self.session_id());
                    warn!("[{}] 服务端拒绝会话", self);
                    promise.set(Err(error.clone()));
                    self.terminate(
                        ProtocolState::Error,
                        error,
                        CloseReason::Error("session expired".to_string()),
                    );
                }
            }
            (Reply::Operation(promise), ServerMessage::Response(response)) => {
                let result = match response.error {
                    Some(code) => Err(TransportError::server_error(response.op, code)),
                    None => Ok(response.clone()),
                };
                if response.op != OpCode::CloseSession {
                    promise.set(result);
                    return;
                }

                match result {
                    Ok(response) => {
                        self.transition(ProtocolState::Disconnected);
                        info!("[{}] 会话已关闭", self);
                        self.terminated(CloseReason::Normal);
                        promise.set(Ok(response));
                        let _ = self.connection.close();
                    }
                    Err(error) => {
                        promise.set(Err(error.clone()));
                        self.terminate(
                            ProtocolState::Error,
                            error.clone(),
                            CloseReason::Error(error.to_string()),
                        );
                    }
                }
            }
            (reply, message) => {
                let reason = format!("response shape does not match {:?} (xid={})", task.op, task.xid);
                debug!("[{}] {:?}", self, message);
                reply.fail(TransportError::protocol_error("session", reason.clone()));
                self.protocol_violation(reason);
            }
        }
    }
}

impl<C> fmt::Display for ClientSession<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_id(), self.connection.local_address())
    }
}

impl<C> Drop for ClientSession<C>
where
    C: Connection<Input = ClientMessage, Output = ServerMessage>,
{
    fn drop(&mut self) {
        self.connection.unsubscribe(&self.listener);
        for task in self.pending.drain() {
            task.fail(TransportError::connection_error("session dropped", false));
        }
    }
}

/// IntraVm 虚拟连接
///
/// 本端持有自己的端点，对端只保留弱引用：连接只负责向对端发出关闭信号，
/// 不拥有对端的生命周期。关闭分两段：先把本端推进到 Closing 并通知对端，
/// 等本端端点 stopped 之后再推进到 Closed 并完成关闭 promise。

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::event::{ConnectionListener, ConnectionState};
use crate::promise::Promise;
use crate::transport::codec::Codec;
use crate::transport::connection_state::Automaton;
use crate::transport::endpoint::{IntraVmEndpoint, Peer};

pub struct IntraVmConnection<C: Codec> {
    local: Arc<IntraVmEndpoint<C>>,
    remote: Weak<dyn Peer<C::Outbound>>,
    remote_address: SocketAddr,
    state: Automaton<ConnectionState>,
    closed: Promise<Result<(), TransportError>>,
}

impl<C: Codec> IntraVmConnection<C> {
    pub fn new(local: Arc<IntraVmEndpoint<C>>, remote: &Arc<dyn Peer<C::Outbound>>) -> Arc<Self> {
        let connection = Arc::new(Self {
            remote_address: remote.address(),
            remote: Arc::downgrade(remote),
            local,
            state: Automaton::new(ConnectionState::Opening),
            closed: Promise::new(),
        });

        // 对端先关闭时，本端端点停止会把连接一起带到 Closed
        let weak = Arc::downgrade(&connection);
        connection.local.stopped().add_listener(move |_| {
            if let Some(connection) = weak.upgrade() {
                connection.on_local_stopped();
            }
        });
        // 配对即意味着连通
        connection.state.apply(ConnectionState::Opened);
        connection
    }

    pub fn local(&self) -> &Arc<IntraVmEndpoint<C>> {
        &self.local
    }

    fn run_close(&self) {
        if let Some(remote) = self.remote.upgrade() {
            if remote.state() != ConnectionState::Closed {
                // 对端可能已经在关闭，结果无所谓
                let _ = remote.close();
            }
        }
        self.local.close();
        if self.local.state() == ConnectionState::Closed {
            self.complete_close();
        }
    }

    fn on_local_stopped(&self) {
        let _ = Connection::close(self);
        self.complete_close();
    }

    fn complete_close(&self) {
        if let Some(transition) = self.state.apply(ConnectionState::Closed) {
            debug!("[{}] 连接已关闭 ({})", self, transition);
        }
        self.closed.set(Ok(()));
    }
}

impl<C: Codec> Connection for IntraVmConnection<C> {
    type Input = C::Input;
    type Output = C::Output;

    fn state(&self) -> ConnectionState {
        self.state.state()
    }

    fn local_address(&self) -> SocketAddr {
        self.local.address()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    fn write(&self, message: C::Input) -> Promise<Result<(), TransportError>> {
        let state = self.state();
        if state.is_closing() {
            return Promise::ready(Err(TransportError::closed(state)));
        }
        match self.remote.upgrade() {
            Some(remote) => self.local.write(message, &*remote),
            None => {
                debug!("[{}] 对端已释放", self);
                let _ = self.close();
                Promise::ready(Err(TransportError::closed(ConnectionState::Closed)))
            }
        }
    }

    fn read(&self) -> Result<(), TransportError> {
        let state = self.state();
        if state == ConnectionState::Closed {
            return Err(TransportError::closed(state));
        }
        self.local.flush();
        Ok(())
    }

    fn flush(&self) {
        if self.state() != ConnectionState::Closed {
            self.local.flush();
        }
    }

    fn close(&self) -> Promise<Result<(), TransportError>> {
        if let Some(transition) = self.state.apply(ConnectionState::Closing) {
            debug!("[{}] 开始关闭连接 ({})", self, transition);
            self.run_close();
        }
        self.closed.clone()
    }

    fn subscribe(&self, listener: Arc<dyn ConnectionListener<C::Output>>) {
        self.local.subscribe(listener);
    }

    fn unsubscribe(&self, listener: &Arc<dyn ConnectionListener<C::Output>>) -> bool {
        self.local.unsubscribe(listener)
    }
}

impl<C: Codec> fmt::Display for IntraVmConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.local.address(), self.remote_address)
    }
}

impl<C: Codec> fmt::Debug for IntraVmConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntraVmConnection")
            .field("local", &self.local.address())
            .field("remote", &self.remote_address)
            .field("state", &self.state.state())
            .finish()
    }
}

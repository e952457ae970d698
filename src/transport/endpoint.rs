/// IntraVm 端点
///
/// 虚拟连接的一侧。邮箱按 FIFO 保存入站的线上消息和关闭哨兵，
/// 由 [`Mailbox`] 保证同一时刻至多一个线程在排空。

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::actor::{Executor, Mailbox};
use crate::error::TransportError;
use crate::event::{ConnectionEvent, ConnectionState, Transition};
use crate::promise::Promise;
use crate::transport::address::LoopbackAddresses;
use crate::transport::codec::{Codec, Passthrough};
use crate::transport::connection_state::Automaton;
use crate::transport::publisher::{IntraVmPublisher, SharedListener};

/// 对端视角下的端点：只能投递消息和请求关闭
pub trait Peer<W>: Send + Sync {
    fn address(&self) -> SocketAddr;

    fn state(&self) -> ConnectionState;

    /// 投递一条消息，端点已开始关闭时返回 false
    fn read(&self, message: W) -> bool;

    /// 请求关闭，只有第一次调用返回 true
    fn close(&self) -> bool;
}

enum Mail<W> {
    Message(W),
    /// 关闭哨兵，携带进入 Closing 之前的状态
    Close { from: ConnectionState },
}

pub struct IntraVmEndpoint<C: Codec> {
    address: SocketAddr,
    state: Automaton<ConnectionState>,
    mailbox: Mailbox<Mail<C::Inbound>>,
    codec: Mutex<C>,
    publisher: Arc<IntraVmPublisher<C::Output>>,
    stopped: Promise<()>,
    executor: Executor,
    this: Weak<Self>,
}

impl<C: Codec> IntraVmEndpoint<C> {
    pub fn new(address: SocketAddr, codec: C, executor: Executor) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            state: Automaton::new(ConnectionState::Opening),
            mailbox: Mailbox::new(),
            codec: Mutex::new(codec),
            publisher: IntraVmPublisher::new(address, executor.clone()),
            stopped: Promise::new(),
            executor,
            this: this.clone(),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// 邮箱排空完毕且进入 Closed 时完成，恰好一次
    pub fn stopped(&self) -> Promise<()> {
        self.stopped.clone()
    }

    pub fn subscribe(&self, listener: SharedListener<C::Output>) {
        self.publisher.subscribe(listener);
    }

    pub fn unsubscribe(&self, listener: &SharedListener<C::Output>) -> bool {
        self.publisher.unsubscribe(listener)
    }

    /// 在调用线程上编码后交给对端邮箱
    ///
    /// 返回的 promise 在消息进入对端邮箱时完成，不代表对端已经处理
    pub fn write(
        &self,
        message: C::Input,
        remote: &dyn Peer<C::Outbound>,
    ) -> Promise<Result<(), TransportError>> {
        let state = self.state();
        if state.is_closing() {
            return Promise::ready(Err(TransportError::closed(state)));
        }

        let encoded = self.codec.lock().encode(message);
        let wire = match encoded {
            Ok(wire) => wire,
            Err(error) => {
                warn!("[{}] 编码失败，关闭端点: {}", self.address, error);
                self.close();
                return Promise::ready(Err(error));
            }
        };

        if remote.read(wire) {
            Promise::ready(Ok(()))
        } else {
            let remote_state = remote.state();
            debug!("[{}] 对端 {} 已关闭 ({})", self.address, remote.address(), remote_state);
            self.close();
            Promise::ready(Err(TransportError::closed(remote_state)))
        }
    }

    /// 进入 Closing 并投递关闭哨兵，只有第一次调用返回 true
    pub fn close(&self) -> bool {
        let Some(transition) = self.state.apply(ConnectionState::Closing) else {
            return false;
        };
        debug!("[{}] 关闭端点 ({})", self.address, transition);
        if self.mailbox.offer(Mail::Close { from: transition.from }).is_ok() {
            self.schedule();
        }
        true
    }

    /// 触发一次排空
    pub fn flush(&self) {
        self.schedule();
        self.publisher.flush();
    }

    fn schedule(&self) {
        if self.mailbox.schedule() {
            if let Some(this) = self.this.upgrade() {
                self.executor.execute(move || this.run());
            }
        }
    }

    fn run(&self) {
        self.mailbox.run(|mail| self.apply(mail));
    }

    fn apply(&self, mail: Mail<C::Inbound>) -> bool {
        match mail {
            Mail::Message(wire) => match self.state() {
                ConnectionState::Closed => {
                    trace!("[{}] DROPPING message after close", self.address);
                    true
                }
                ConnectionState::Opening => {
                    if let Some(transition) = self.state.apply(ConnectionState::Opened) {
                        self.publisher.publish(ConnectionEvent::State(transition));
                    }
                    self.post(wire)
                }
                ConnectionState::Opened | ConnectionState::Closing => self.post(wire),
            },
            Mail::Close { from } => {
                self.stop(from);
                false
            }
        }
    }

    /// 解码并发布，解码失败时立即终止端点
    fn post(&self, wire: C::Inbound) -> bool {
        let decoded = self.codec.lock().decode(wire);
        match decoded {
            Ok(messages) => {
                for message in messages {
                    self.publisher.publish(ConnectionEvent::Read(message));
                }
                true
            }
            Err(error) => {
                warn!("[{}] 解码失败，关闭端点: {}", self.address, error);
                let from = self.state();
                // 损坏的流无法重新同步，不再处理剩余消息
                if self.state.apply(ConnectionState::Closing).is_some() {
                    self.stop(from);
                } else {
                    self.stop(ConnectionState::Closing);
                }
                false
            }
        }
    }

    fn stop(&self, from: ConnectionState) {
        let closed = self.state.apply(ConnectionState::Closed);
        if !self.mailbox.stop() {
            return;
        }
        let mut from = from;
        for mail in self.mailbox.clear() {
            match mail {
                Mail::Message(_) => trace!("[{}] DROPPING queued message", self.address),
                Mail::Close { from: queued } => from = from.min(queued),
            }
        }

        if from < ConnectionState::Closing {
            self.publisher
                .publish(ConnectionEvent::State(Transition::new(from, ConnectionState::Closing)));
        }
        debug!("[{}] 端点已停止", self.address);
        self.stopped.set(());
        if let Some(transition) = closed {
            self.publisher.publish(ConnectionEvent::State(transition));
        }
    }
}

impl<C: Codec> Peer<C::Inbound> for IntraVmEndpoint<C> {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn state(&self) -> ConnectionState {
        self.state.state()
    }

    fn read(&self, message: C::Inbound) -> bool {
        if self.state().is_closing() {
            return false;
        }
        if self.mailbox.offer(Mail::Message(message)).is_err() {
            return false;
        }
        self.schedule();
        true
    }

    fn close(&self) -> bool {
        IntraVmEndpoint::close(self)
    }
}

impl<C: Codec> fmt::Debug for IntraVmEndpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntraVmEndpoint")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

/// 端点工厂：为每个新端点分配地址与独立的编解码器实例
pub struct EndpointFactory<C> {
    addresses: Arc<LoopbackAddresses>,
    codecs: Arc<dyn Fn() -> C + Send + Sync>,
    executor: Executor,
}

impl<C> Clone for EndpointFactory<C> {
    fn clone(&self) -> Self {
        Self {
            addresses: self.addresses.clone(),
            codecs: self.codecs.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<C: Codec> EndpointFactory<C> {
    pub fn new<F>(addresses: Arc<LoopbackAddresses>, codecs: F, executor: Executor) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            addresses,
            codecs: Arc::new(codecs),
            executor,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn get(&self) -> Arc<IntraVmEndpoint<C>> {
        IntraVmEndpoint::new(self.addresses.next(), (self.codecs)(), self.executor.clone())
    }
}

impl<I, O> EndpointFactory<Passthrough<I, O>>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
{
    pub fn passthrough(addresses: Arc<LoopbackAddresses>, executor: Executor) -> Self {
        Self::new(addresses, Passthrough::new, executor)
    }
}

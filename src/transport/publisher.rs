/// 端点事件分发
///
/// 事件先进入发布者自己的邮箱，只有在“曾经有过订阅者”之后才开始排空，
/// 这样配对与消费方注册监听器之间的竞争不会丢失最初的 OPENED 迁移。
/// 该标志一旦置位永不复位；投递到 Closed 迁移之后发布者停止并清空监听器。

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::actor::{Executor, Mailbox};
use crate::event::{ConnectionEvent, ConnectionListener, ConnectionState};

pub type SharedListener<O> = Arc<dyn ConnectionListener<O>>;

pub struct IntraVmPublisher<O> {
    address: SocketAddr,
    mailbox: Mailbox<ConnectionEvent<O>>,
    listeners: RwLock<Vec<SharedListener<O>>>,
    subscribed: AtomicBool,
    executor: Executor,
    this: Weak<Self>,
}

impl<O: Send + Sync + 'static> IntraVmPublisher<O> {
    pub fn new(address: SocketAddr, executor: Executor) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            mailbox: Mailbox::new(),
            listeners: RwLock::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            executor,
            this: this.clone(),
        })
    }

    /// 注册监听器，并放行此前积压的事件
    pub fn subscribe(&self, listener: SharedListener<O>) {
        if self.mailbox.is_terminated() {
            debug!("[{}] 发布者已停止，忽略订阅", self.address);
            return;
        }
        self.listeners.write().push(listener);
        self.subscribed.store(true, Ordering::SeqCst);
        self.schedule();
    }

    pub fn unsubscribe(&self, listener: &SharedListener<O>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.mailbox.is_terminated()
    }

    pub fn publish(&self, event: ConnectionEvent<O>) {
        if let Err(event) = self.mailbox.offer(event) {
            trace!("[{}] DROPPING {}", self.address, describe(&event));
            return;
        }
        self.schedule();
    }

    /// 触发一次排空
    pub fn flush(&self) {
        self.schedule();
    }

    fn schedule(&self) {
        if !self.subscribed.load(Ordering::SeqCst) {
            return;
        }
        if self.mailbox.schedule() {
            if let Some(this) = self.this.upgrade() {
                self.executor.execute(move || this.run());
            }
        }
    }

    fn run(&self) {
        self.mailbox.run(|event| self.deliver(event));
    }

    fn deliver(&self, event: ConnectionEvent<O>) -> bool {
        // 快照，监听器回调期间不持锁
        let listeners: Vec<SharedListener<O>> = self.listeners.read().clone();
        match &event {
            ConnectionEvent::State(transition) => {
                for listener in &listeners {
                    listener.handle_connection_state(*transition);
                }
                if transition.to == ConnectionState::Closed {
                    self.stop();
                    return false;
                }
            }
            ConnectionEvent::Read(message) => {
                for listener in &listeners {
                    listener.handle_connection_read(message);
                }
            }
        }
        true
    }

    fn stop(&self) {
        if self.mailbox.stop() {
            for event in self.mailbox.clear() {
                trace!("[{}] DROPPING {}", self.address, describe(&event));
            }
            self.listeners.write().clear();
            debug!("[{}] 发布者已停止", self.address);
        }
    }
}

/// 只比较数据指针，忽略 vtable
fn same_listener<O>(a: &SharedListener<O>, b: &SharedListener<O>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn describe<O>(event: &ConnectionEvent<O>) -> String {
    match event {
        ConnectionEvent::State(transition) => format!("state {}", transition),
        ConnectionEvent::Read(_) => "message".to_string(),
    }
}

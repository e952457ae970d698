/// 连接工厂：虚拟网络上的服务端注册表与客户端连接
///
/// `IntraVmNet` 以监听地址为键保存服务端；客户端按地址查找服务端，
/// 服务端在接受时铸造自己的端点，双方各自把连接加入存活集合。

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::connection::{ClientConnectionFactory, Connection, ConnectionsListener, ServerConnectionFactory};
use crate::error::TransportError;
use crate::event::{ConnectionListener, ConnectionState, Transition};
use crate::transport::address::LoopbackAddresses;
use crate::transport::codec::Codec;
use crate::transport::connection::IntraVmConnection;
use crate::transport::endpoint::{EndpointFactory, Peer};

/// 存活连接集合
///
/// 连接进入 Closed 时通过事件分发自动移除；停止后拒绝新连接
pub struct ConnectionRegistry<T: Connection> {
    connections: Mutex<Slab<Arc<T>>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionsListener<T>>>>,
    running: AtomicBool,
    this: Weak<Self>,
}

impl<T: Connection> ConnectionRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connections: Mutex::new(Slab::new()),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            this: this.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, listener: Arc<dyn ConnectionsListener<T>>) {
        self.listeners.write().push(listener);
    }

    /// 加入一个连接
    ///
    /// 先同步通知新连接监听器，再挂上移除监听器
    pub fn add(&self, connection: Arc<T>) -> bool {
        if !self.is_running() {
            debug!("[REGISTRY] 已停止，关闭新连接 {}", connection.local_address());
            let _ = connection.close();
            return false;
        }
        if connection.state() == ConnectionState::Closed {
            return false;
        }

        let key = self.connections.lock().insert(connection.clone());
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            listener.handle_new_connection(&connection);
        }

        connection.subscribe(Arc::new(RemoveOnClose {
            key,
            identity: identity(&connection),
            registry: self.this.clone(),
        }));

        // 停止或关闭可能与插入并发发生
        if !self.is_running() {
            let _ = connection.close();
        }
        if connection.state() == ConnectionState::Closed {
            self.remove(key, identity(&connection));
        }
        true
    }

    fn remove(&self, key: usize, identity: usize) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(key) {
            Some(existing) if self::identity(existing) == identity => {
                connections.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connections(&self) -> Vec<Arc<T>> {
        self.connections.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    /// 关闭所有连接并等待关闭完成
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<Arc<T>> = self.connections.lock().drain().collect();
        info!("[REGISTRY] 停止，关闭 {} 个连接", connections.len());

        let closing = connections.iter().map(|c| c.close().into_future());
        for result in join_all(closing).await {
            if let Err(error) = result {
                warn!("[REGISTRY] 关闭连接失败: {}", error);
            }
        }
    }
}

fn identity<T>(connection: &Arc<T>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

struct RemoveOnClose<T: Connection> {
    key: usize,
    identity: usize,
    registry: Weak<ConnectionRegistry<T>>,
}

impl<T: Connection> ConnectionListener<T::Output> for RemoveOnClose<T> {
    fn handle_connection_state(&self, transition: Transition<ConnectionState>) {
        if transition.to != ConnectionState::Closed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.key, self.identity) {
                debug!("[REGISTRY] 移除已关闭连接 #{}", self.key);
            }
        }
    }
}

/// 服务端接受入口，按监听地址注册在虚拟网络上
pub trait Acceptor<Up, Down>: Send + Sync {
    fn listen_address(&self) -> SocketAddr;

    /// 为客户端端点铸造服务端端点并建立服务端连接
    fn accept(&self, client: Arc<dyn Peer<Down>>) -> Result<Arc<dyn Peer<Up>>, TransportError>;
}

/// 进程内虚拟网络
///
/// `Up` 为客户端发往服务端的线上类型，`Down` 为反方向
pub struct IntraVmNet<Up, Down> {
    servers: RwLock<HashMap<SocketAddr, Arc<dyn Acceptor<Up, Down>>>>,
    addresses: Arc<LoopbackAddresses>,
}

impl<Up, Down> IntraVmNet<Up, Down>
where
    Up: Send + 'static,
    Down: Send + 'static,
{
    pub fn new(addresses: Arc<LoopbackAddresses>) -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            addresses,
        })
    }

    /// 按配置创建虚拟网络，端点地址从 `start_port` 开始分配
    pub fn from_config(config: &NetConfig) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        Ok(Self::new(Arc::new(LoopbackAddresses::new(config.start_port))))
    }

    pub fn addresses(&self) -> &Arc<LoopbackAddresses> {
        &self.addresses
    }

    /// 在 `listen` 上注册服务端，地址已被占用时失败
    pub fn new_server<C>(
        self: &Arc<Self>,
        listen: SocketAddr,
        endpoints: EndpointFactory<C>,
    ) -> Result<Arc<IntraVmServerConnectionFactory<C>>, TransportError>
    where
        C: Codec<Inbound = Up, Outbound = Down>,
    {
        let mut servers = self.servers.write();
        if servers.contains_key(&listen) {
            warn!("[NET] 地址已被占用: {}", listen);
            return Err(TransportError::address_in_use(listen));
        }
        let server = Arc::new(IntraVmServerConnectionFactory {
            listen_address: listen,
            endpoints,
            registry: ConnectionRegistry::new(),
            net: Arc::downgrade(self),
        });
        servers.insert(listen, server.clone() as Arc<dyn Acceptor<Up, Down>>);
        info!("[NET] 服务端已绑定 {}", listen);
        Ok(server)
    }

    pub fn new_client<C>(self: &Arc<Self>, endpoints: EndpointFactory<C>) -> Arc<IntraVmClientConnectionFactory<C>>
    where
        C: Codec<Outbound = Up, Inbound = Down>,
    {
        Arc::new(IntraVmClientConnectionFactory {
            endpoints,
            registry: ConnectionRegistry::new(),
            net: Arc::downgrade(self),
        })
    }

    pub fn lookup(&self, address: &SocketAddr) -> Option<Arc<dyn Acceptor<Up, Down>>> {
        self.servers.read().get(address).cloned()
    }

    pub fn is_bound(&self, address: &SocketAddr) -> bool {
        self.servers.read().contains_key(address)
    }

    pub fn server_count(&self) -> usize {
        self.servers.read().len()
    }

    fn unbind(&self, address: &SocketAddr) {
        if self.servers.write().remove(address).is_some() {
            info!("[NET] 服务端已解绑 {}", address);
        }
    }
}

/// 虚拟网络上的服务端工厂
pub struct IntraVmServerConnectionFactory<C: Codec> {
    listen_address: SocketAddr,
    endpoints: EndpointFactory<C>,
    registry: Arc<ConnectionRegistry<IntraVmConnection<C>>>,
    net: Weak<IntraVmNet<C::Inbound, C::Outbound>>,
}

impl<C: Codec> IntraVmServerConnectionFactory<C> {
    pub fn registry(&self) -> &Arc<ConnectionRegistry<IntraVmConnection<C>>> {
        &self.registry
    }
}

impl<C: Codec> Acceptor<C::Inbound, C::Outbound> for IntraVmServerConnectionFactory<C> {
    fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    fn accept(
        &self,
        client: Arc<dyn Peer<C::Outbound>>,
    ) -> Result<Arc<dyn Peer<C::Inbound>>, TransportError> {
        if !self.registry.is_running() {
            return Err(TransportError::connection_refused(self.listen_address));
        }
        let local = self.endpoints.get();
        debug!("[{}] 接受连接 {} => {}", self.listen_address, local.address(), client.address());
        let connection = IntraVmConnection::new(local.clone(), &client);
        if !self.registry.add(connection) {
            return Err(TransportError::connection_refused(self.listen_address));
        }
        Ok(local as Arc<dyn Peer<C::Inbound>>)
    }
}

#[async_trait]
impl<C: Codec> ServerConnectionFactory for IntraVmServerConnectionFactory<C> {
    type Connection = IntraVmConnection<C>;

    fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    fn subscribe(&self, listener: Arc<dyn ConnectionsListener<IntraVmConnection<C>>>) {
        self.registry.subscribe(listener);
    }

    async fn stop(&self) {
        if let Some(net) = self.net.upgrade() {
            net.unbind(&self.listen_address);
        }
        self.registry.stop().await;
    }

    fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    fn connections(&self) -> Vec<Arc<IntraVmConnection<C>>> {
        self.registry.connections()
    }
}

/// 虚拟网络上的客户端工厂
pub struct IntraVmClientConnectionFactory<C: Codec> {
    endpoints: EndpointFactory<C>,
    registry: Arc<ConnectionRegistry<IntraVmConnection<C>>>,
    net: Weak<IntraVmNet<C::Outbound, C::Inbound>>,
}

impl<C: Codec> IntraVmClientConnectionFactory<C> {
    pub fn registry(&self) -> &Arc<ConnectionRegistry<IntraVmConnection<C>>> {
        &self.registry
    }

    /// 同步建立连接
    ///
    /// 未注册的地址立即失败，不会创建任何连接
    pub fn connect_now(&self, remote: SocketAddr) -> Result<Arc<IntraVmConnection<C>>, TransportError> {
        if !self.registry.is_running() {
            return Err(TransportError::illegal_state("stopped", "connect"));
        }
        let server = self
            .net
            .upgrade()
            .and_then(|net| net.lookup(&remote))
            .ok_or_else(|| TransportError::connection_refused(remote))?;

        let local = self.endpoints.get();
        debug!("[{}] 连接 => {}", local.address(), remote);
        let peer = server.accept(local.clone() as Arc<dyn Peer<C::Inbound>>)?;
        let connection = IntraVmConnection::new(local, &peer);
        if !self.registry.add(connection.clone()) {
            return Err(TransportError::illegal_state("stopped", "connect"));
        }
        Ok(connection)
    }
}

#[async_trait]
impl<C: Codec> ClientConnectionFactory for IntraVmClientConnectionFactory<C> {
    type Connection = IntraVmConnection<C>;

    async fn connect(&self, remote: SocketAddr) -> Result<Arc<IntraVmConnection<C>>, TransportError> {
        self.connect_now(remote)
    }

    async fn stop(&self) {
        self.registry.stop().await;
    }

    fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    fn connections(&self) -> Vec<Arc<IntraVmConnection<C>>> {
        self.registry.connections()
    }
}

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TransportError;
use crate::event::{ConnectionListener, ConnectionState};
use crate::promise::Promise;

/// 统一的连接接口
///
/// 会话层只依赖这个接口，因此虚拟网络与真实套接字的适配器可以互换
pub trait Connection: Send + Sync + 'static {
    /// 写入的消息类型
    type Input: Send + 'static;
    /// 读到并发布给监听器的消息类型
    type Output: Send + Sync + 'static;

    fn state(&self) -> ConnectionState;

    fn local_address(&self) -> SocketAddr;

    fn remote_address(&self) -> SocketAddr;

    /// 提交一条消息
    ///
    /// 连接已处于 Closing/Closed 时立即失败；成功只表示已交给对端的排空路径
    fn write(&self, message: Self::Input) -> Promise<Result<(), TransportError>>;

    /// 触发本端的一次排空，立即返回
    fn read(&self) -> Result<(), TransportError>;

    /// 触发本端事件分发，立即返回
    fn flush(&self);

    /// 幂等关闭，重复调用返回同一个 promise
    fn close(&self) -> Promise<Result<(), TransportError>>;

    fn subscribe(&self, listener: Arc<dyn ConnectionListener<Self::Output>>);

    fn unsubscribe(&self, listener: &Arc<dyn ConnectionListener<Self::Output>>) -> bool;
}

/// 新连接监听器
///
/// 在连接加入工厂时同步回调，早于发起方拿到连接
pub trait ConnectionsListener<T>: Send + Sync {
    fn handle_new_connection(&self, connection: &Arc<T>);
}

impl<T, F> ConnectionsListener<T> for F
where
    F: Fn(&Arc<T>) + Send + Sync,
{
    fn handle_new_connection(&self, connection: &Arc<T>) {
        self(connection)
    }
}

/// 客户端连接工厂
#[async_trait]
pub trait ClientConnectionFactory: Send + Sync {
    type Connection: Connection;

    /// 连接到远端监听地址
    async fn connect(&self, remote: SocketAddr) -> Result<Arc<Self::Connection>, TransportError>;

    /// 关闭所有连接并等待其完成
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// 当前存活连接的快照
    fn connections(&self) -> Vec<Arc<Self::Connection>>;
}

/// 服务端连接工厂
#[async_trait]
pub trait ServerConnectionFactory: Send + Sync {
    type Connection: Connection;

    fn listen_address(&self) -> SocketAddr;

    fn subscribe(&self, listener: Arc<dyn ConnectionsListener<Self::Connection>>);

    /// 关闭所有连接、解除地址绑定并等待完成
    async fn stop(&self);

    fn is_running(&self) -> bool;

    fn connections(&self) -> Vec<Arc<Self::Connection>>;
}

// 进程内虚拟网络
pub mod address;
pub mod codec;
pub mod connection;
pub mod connection_factory;
pub mod connection_state;
pub mod endpoint;
pub mod publisher;

pub use address::LoopbackAddresses;
pub use codec::{Codec, FrameCodec, Passthrough};
pub use connection::IntraVmConnection;
pub use connection_factory::{
    Acceptor, ConnectionRegistry, IntraVmClientConnectionFactory, IntraVmNet,
    IntraVmServerConnectionFactory,
};
pub use connection_state::{Automaton, StateMachine};
pub use endpoint::{EndpointFactory, IntraVmEndpoint, Peer};
pub use publisher::IntraVmPublisher;

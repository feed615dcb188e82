//! End-to-end balancer tests against stub upstream servers on real
//! sockets.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use segkv::http::{self, HttpClient, Request, Response};
use segkv::{Balancer, BalancerConfig, SharedQueueThreadPool, ThreadPool};

/// Starts a stub upstream that answers 200 to every request (health
/// probes included) with its own name in the body. Returns its
/// `host:port` address.
fn spawn_stub_upstream(name: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub upstream");
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let tcp = match stream {
                Ok(tcp) => tcp,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut reader = BufReader::new(match tcp.try_clone() {
                    Ok(clone) => clone,
                    Err(_) => return,
                });
                let mut writer = BufWriter::new(&tcp);
                if let Ok(Some(_request)) = http::read_request(&mut reader) {
                    let response = Response::text(200, name);
                    let _ = http::write_response(&mut writer, &response);
                }
            });
        }
    });

    format!("127.0.0.1:{}", addr.port())
}

/// Starts a balancer over `upstreams` on an ephemeral port, returning
/// its address.
fn spawn_balancer(upstreams: Vec<String>, trace: bool) -> String {
    let mut config = BalancerConfig::new(upstreams);
    config.timeout = Duration::from_secs(2);
    // keep the prober quiet during the test window
    config.health_interval = Duration::from_secs(60);
    config.trace = trace;

    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind balancer");
    let addr = listener.local_addr().unwrap();
    let balancer = Balancer::new(config);
    let pool = SharedQueueThreadPool::new(8).unwrap();
    thread::spawn(move || {
        let _ = balancer.serve_on(listener, pool);
    });

    format!("127.0.0.1:{}", addr.port())
}

#[test]
fn least_connections_end_to_end() {
    let upstreams = vec![
        spawn_stub_upstream("alpha"),
        spawn_stub_upstream("beta"),
        spawn_stub_upstream("gamma"),
    ];
    let balancer_addr = spawn_balancer(upstreams.clone(), true);

    let clients = 6;
    let requests_per_client = 5;
    let successes = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    let (tx, rx) = std::sync::mpsc::channel::<String>();

    for c in 0..clients {
        let balancer_addr = balancer_addr.clone();
        let successes = successes.clone();
        let tx = tx.clone();
        handles.push(thread::spawn(move || {
            let client = HttpClient::new(Duration::from_secs(2));
            for r in 0..requests_per_client {
                let target = format!("/api/v1/some-data?key=c{}r{}", c, r);
                match client.send(&balancer_addr, &Request::new("GET", &target)) {
                    Ok(response) if response.status == 200 => {
                        successes.fetch_add(1, Ordering::SeqCst);
                        if let Some(from) = response.header("lb-from") {
                            let _ = tx.send(from.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }));
    }
    drop(tx);
    for handle in handles {
        handle.join().unwrap();
    }

    let total = clients * requests_per_client;
    let ok = successes.load(Ordering::SeqCst);
    assert!(
        ok * 4 >= total * 3,
        "expected at least 75% success, got {}/{}",
        ok,
        total
    );

    let mut per_upstream: HashMap<String, usize> = HashMap::new();
    for from in rx {
        assert!(
            upstreams.contains(&from),
            "lb-from named an unknown upstream: {}",
            from
        );
        *per_upstream.entry(from).or_insert(0) += 1;
    }

    // when traffic reached all three upstreams, the spread must be sane
    if per_upstream.len() == 3 {
        let max = per_upstream.values().max().copied().unwrap_or(0);
        let min = per_upstream.values().min().copied().unwrap_or(0);
        assert!(
            min > 0 && max <= min * 3,
            "unbalanced spread: {:?}",
            per_upstream
        );
    }
}

#[test]
fn no_upstreams_means_503() {
    let balancer_addr = spawn_balancer(Vec::new(), false);
    let client = HttpClient::new(Duration::from_secs(2));
    let response = client
        .send(&balancer_addr, &Request::new("GET", "/anything"))
        .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.body, b"No healthy upstream available");
}

#[test]
fn trace_header_is_absent_without_trace() {
    let upstreams = vec![spawn_stub_upstream("solo")];
    let balancer_addr = spawn_balancer(upstreams, false);
    let client = HttpClient::new(Duration::from_secs(2));
    let response = client
        .send(&balancer_addr, &Request::new("GET", "/ping"))
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.header("lb-from").is_none());
    assert_eq!(response.body, b"solo");
}

//! A least-connections HTTP load balancer with background health probes.
//!
//! Every request is dispatched to the healthy upstream with the fewest
//! in-flight requests, ties going to the first upstream in configuration
//! order. A background thread probes `GET /health` on each upstream and
//! flips its health flag under the upstream-list lock; per-upstream
//! connection counters are lock-free atomics.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{KvError, Result};
use crate::http::{self, HttpClient, Request, Response};
use crate::thread_pool::ThreadPool;

/// default interval between health sweeps
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
/// timeout for a single health probe
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`Balancer`].
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// upstream `host:port` addresses, in priority order for ties
    pub upstreams: Vec<String>,
    /// per-request timeout for proxied requests
    pub timeout: Duration,
    /// how often the health prober sweeps the upstreams
    pub health_interval: Duration,
    /// when set, responses carry an `lb-from: <upstream_host>` header
    pub trace: bool,
}

impl BalancerConfig {
    /// Builds a config for the given upstream list with a 3 second
    /// request timeout, the default health interval and tracing off.
    pub fn new(upstreams: Vec<String>) -> BalancerConfig {
        BalancerConfig {
            upstreams,
            timeout: Duration::from_secs(3),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            trace: false,
        }
    }
}

/// State kept per configured upstream.
///
/// `active_conns` is an atomic so request handlers can bump it while
/// holding only the read lock on the upstream list; `healthy` is a plain
/// flag mutated under the list's write lock by the prober.
#[derive(Debug)]
pub struct Upstream {
    /// the upstream's `host:port` address
    pub host: String,
    /// latest health-probe verdict; starts healthy
    pub healthy: bool,
    /// number of requests currently in flight to this upstream
    pub active_conns: Arc<AtomicI64>,
}

impl Upstream {
    /// Creates a healthy upstream with no active connections.
    pub fn new<S: Into<String>>(host: S) -> Upstream {
        Upstream {
            host: host.into(),
            healthy: true,
            active_conns: Arc::new(AtomicI64::new(0)),
        }
    }
}

/// Picks the healthy upstream with the fewest active connections.
///
/// Unhealthy upstreams are skipped. On ties the first upstream in list
/// order wins. Returns `None` when no healthy upstream exists.
pub fn select_least_loaded(upstreams: &[Upstream]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (i, upstream) in upstreams.iter().enumerate() {
        if !upstream.healthy {
            continue;
        }
        let conns = upstream.active_conns.load(Ordering::SeqCst);
        match best {
            Some((_, least)) if conns >= least => {}
            _ => best = Some((i, conns)),
        }
    }
    best.map(|(i, _)| i)
}

/// The load balancer itself: a shared upstream list plus the outbound
/// HTTP client. Cloning yields another handle onto the same state.
#[derive(Clone)]
pub struct Balancer {
    upstreams: Arc<RwLock<Vec<Upstream>>>,
    client: HttpClient,
    health_interval: Duration,
    trace: bool,
}

impl Balancer {
    /// Builds a balancer from its configuration. All upstreams start out
    /// healthy; the first health sweep corrects that if needed.
    pub fn new(config: BalancerConfig) -> Balancer {
        let upstreams = config
            .upstreams
            .iter()
            .map(|host| Upstream::new(host.clone()))
            .collect();
        Balancer {
            upstreams: Arc::new(RwLock::new(upstreams)),
            client: HttpClient::new(config.timeout),
            health_interval: config.health_interval,
            trace: config.trace,
        }
    }

    /// Binds `addr` and serves until the process exits.
    pub fn run<A: ToSocketAddrs, P: ThreadPool>(self, addr: A, pool: P) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve_on(listener, pool)
    }

    /// Serves connections from an already-bound listener, starting the
    /// health prober first.
    pub fn serve_on<P: ThreadPool>(self, listener: TcpListener, pool: P) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            upstreams = self.upstream_count()?,
            "balancer listening"
        );
        self.start_health_probes();

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let balancer = self.clone();
                    pool.spawn(move || {
                        if let Err(e) = balancer.handle_connection(stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        Ok(())
    }

    /// Spawns the background thread that sweeps `GET /health` across the
    /// upstreams every interval.
    fn start_health_probes(&self) {
        let balancer = self.clone();
        thread::Builder::new()
            .name("lb-health".into())
            .spawn(move || {
                let prober = HttpClient::new(HEALTH_PROBE_TIMEOUT);
                loop {
                    balancer.probe_all(&prober);
                    thread::sleep(balancer.health_interval);
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| error!("failed to start health prober: {}", e));
    }

    /// One health sweep: probe each upstream, then apply the verdicts
    /// under the list's write lock.
    fn probe_all(&self, prober: &HttpClient) {
        let hosts: Vec<String> = match self.upstreams.read() {
            Ok(upstreams) => upstreams.iter().map(|u| u.host.clone()).collect(),
            Err(_) => return,
        };

        let verdicts: Vec<bool> = hosts
            .iter()
            .map(|host| {
                let healthy = match prober.send(host, &Request::new("GET", "/health")) {
                    Ok(resp) => resp.status == 200,
                    Err(_) => false,
                };
                debug!(upstream = %host, healthy, "health probe");
                healthy
            })
            .collect();

        if let Ok(mut upstreams) = self.upstreams.write() {
            for (upstream, healthy) in upstreams.iter_mut().zip(verdicts) {
                if upstream.healthy != healthy {
                    info!(upstream = %upstream.host, healthy, "upstream health changed");
                }
                upstream.healthy = healthy;
            }
        }
    }

    /// Serves one client connection: select an upstream, proxy the
    /// request, stream the response back.
    fn handle_connection(&self, tcp: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(tcp.try_clone()?);
        let mut writer = BufWriter::new(&tcp);

        let request = match http::read_request(&mut reader)? {
            Some(request) => request,
            None => return Ok(()),
        };

        let picked = {
            let upstreams = self
                .upstreams
                .read()
                .map_err(|_| KvError::Locking("upstream list lock poisoned".into()))?;
            select_least_loaded(&upstreams)
                .map(|i| (upstreams[i].host.clone(), upstreams[i].active_conns.clone()))
        };

        let (host, counter) = match picked {
            Some(picked) => picked,
            None => {
                warn!("no healthy upstream available");
                return http::write_response(
                    &mut writer,
                    &Response::text(503, "No healthy upstream available"),
                );
            }
        };

        // held until the response has been written or the dispatch failed
        let _guard = ConnGuard::new(counter);
        debug!(upstream = %host, path = %request.path, "dispatching request");

        match self.client.send(&host, &request) {
            Ok(mut response) => {
                if self.trace {
                    response = response.with_header("lb-from", &host);
                }
                http::write_response(&mut writer, &response)
            }
            Err(e) => {
                warn!(upstream = %host, error = %e, "upstream request failed");
                http::write_response(&mut writer, &Response::text(502, "Bad gateway"))
            }
        }
    }

    fn upstream_count(&self) -> Result<usize> {
        self.upstreams
            .read()
            .map(|u| u.len())
            .map_err(|_| KvError::Locking("upstream list lock poisoned".into()))
    }
}

/// RAII guard for one in-flight request: increments the upstream's
/// counter on creation and decrements it on drop, so the count is
/// released on every exit path.
struct ConnGuard {
    counter: Arc<AtomicI64>,
}

impl ConnGuard {
    fn new(counter: Arc<AtomicI64>) -> ConnGuard {
        counter.fetch_add(1, Ordering::SeqCst);
        ConnGuard { counter }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(host: &str, healthy: bool, conns: i64) -> Upstream {
        let u = Upstream::new(host);
        u.active_conns.store(conns, Ordering::SeqCst);
        Upstream { healthy, ..u }
    }

    #[test]
    fn single_healthy_upstream_is_picked() {
        let ups = vec![upstream("server1:8080", true, 0)];
        assert_eq!(select_least_loaded(&ups), Some(0));
    }

    #[test]
    fn least_loaded_healthy_upstream_wins() {
        let ups = vec![
            upstream("server1:8080", true, 5),
            upstream("server2:8080", true, 2),
            upstream("server3:8080", true, 3),
        ];
        assert_eq!(select_least_loaded(&ups), Some(1));
    }

    #[test]
    fn all_unhealthy_picks_none() {
        let ups = vec![
            upstream("server1:8080", false, 0),
            upstream("server2:8080", false, 0),
        ];
        assert_eq!(select_least_loaded(&ups), None);
    }

    #[test]
    fn unhealthy_upstreams_are_skipped() {
        let ups = vec![
            upstream("server1:8080", false, 10),
            upstream("server2:8080", true, 5),
            upstream("server3:8080", false, 0),
        ];
        assert_eq!(select_least_loaded(&ups), Some(1));
    }

    #[test]
    fn ties_go_to_the_first_in_list_order() {
        let ups = vec![
            upstream("server1:8080", true, 2),
            upstream("server2:8080", true, 5),
            upstream("server3:8080", true, 2),
        ];
        assert_eq!(select_least_loaded(&ups), Some(0));
    }

    #[test]
    fn empty_list_picks_none() {
        assert_eq!(select_least_loaded(&[]), None);
    }

    #[test]
    fn conn_guard_releases_on_drop() {
        let counter = Arc::new(AtomicI64::new(0));
        {
            let _guard = ConnGuard::new(counter.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

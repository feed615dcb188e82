//! this binary starts the least-connections load balancer
//! to see the list of options, type: `segkv-lb --help`

use std::process::exit;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg};
use segkv::{Balancer, BalancerConfig, Result, SharedQueueThreadPool, ThreadPool};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_PORT: &str = "8090";
const DEFAULT_TIMEOUT_SEC: &str = "3";
const DEFAULT_THREADS: u32 = 16;

/// [`Opt`] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    upstreams: Vec<String>,
    port: u16,
    timeout: Duration,
    trace: bool,
    https: bool,
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("segkv-lb")
        .version(crate_version!())
        .about("a least-connections HTTP load balancer with health probing")
        .arg(
            Arg::with_name("UPSTREAMS")
                .help("upstream host:port addresses, in priority order")
                .required(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("port the balancer listens on")
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("timeout-sec")
                .long("timeout-sec")
                .value_name("SECONDS")
                .help("per-request timeout towards an upstream")
                .default_value(DEFAULT_TIMEOUT_SEC),
        )
        .arg(
            Arg::with_name("trace")
                .long("trace")
                .help("adds an lb-from header naming the chosen upstream"),
        )
        .arg(
            Arg::with_name("https")
                .long("https")
                .help("advertise https as the upstream scheme"),
        )
        .get_matches();

    let upstreams: Vec<String> = matches
        .values_of("UPSTREAMS")
        .map(|vals| vals.map(String::from).collect())
        .unwrap_or_default();
    let port = match matches.value_of("port").unwrap_or(DEFAULT_PORT).parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("could not parse the port number");
            exit(1);
        }
    };
    let timeout_sec = value_t!(matches, "timeout-sec", u64).unwrap_or(3);

    let opt = Opt {
        upstreams,
        port,
        timeout: Duration::from_secs(timeout_sec),
        trace: matches.is_present("trace"),
        https: matches.is_present("https"),
    };
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("segkv-lb {}", env!("CARGO_PKG_VERSION"));
    info!("Upstreams: {:?}", opt.upstreams);
    info!("Listening on 0.0.0.0:{}", opt.port);
    if opt.https {
        // upstream transport stays plain TCP; the flag only renames the scheme
        warn!("https scheme requested; upstream transport remains plain http");
    }

    let mut config = BalancerConfig::new(opt.upstreams);
    config.timeout = opt.timeout;
    config.trace = opt.trace;

    let balancer = Balancer::new(config);
    let pool = SharedQueueThreadPool::new(DEFAULT_THREADS)?;
    balancer.run(("0.0.0.0", opt.port), pool)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}

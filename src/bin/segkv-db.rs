//! this binary starts the segkv store behind its HTTP surface
//! to see the list of options, type: `segkv-db --help`

use std::env;
use std::process::exit;
use std::time::Duration;

use clap::{arg_enum, crate_version, value_t, App, Arg};
use segkv::{
    DbServer, NaiveThreadPool, RayonThreadPool, Result, SharedQueueThreadPool, Store, StoreConfig,
    ThreadPool,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

arg_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Pool {
        shared,
        rayon,
        naive
    }
}

const DEFAULT_DIR: &str = "./database_data";
const DEFAULT_PORT: &str = "8081";
const DEFAULT_THREADS: &str = "8";

/// [`Opt`] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    dir: String,
    port: u16,
    pool: Pool,
    threads: u32,
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // env overrides take precedence over built-in defaults; explicit
    // flags take precedence over both
    let default_dir = env::var("DB_DIR").unwrap_or_else(|_| DEFAULT_DIR.to_string());
    let default_port = env::var("DB_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());

    let matches = App::new("segkv-db")
        .version(crate_version!())
        .about("an append-only segmented key-value store with an HTTP surface")
        .arg(
            Arg::with_name("dir")
                .long("dir")
                .value_name("PATH")
                .help("directory holding the segment files")
                .default_value(&default_dir),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("port the HTTP surface listens on")
                .default_value(&default_port),
        )
        .arg(
            Arg::with_name("pool")
                .long("pool")
                .value_name("POOL_NAME")
                .help("thread pool used for connections: 'shared', 'rayon' or 'naive'")
                .default_value("shared"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .value_name("N")
                .help("number of threads serving connections")
                .default_value(DEFAULT_THREADS),
        )
        .get_matches();

    let dir = matches.value_of("dir").unwrap_or(DEFAULT_DIR).to_string();
    let port = match matches.value_of("port").unwrap_or(DEFAULT_PORT).parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("could not parse the port number");
            exit(1);
        }
    };
    let pool = value_t!(matches, "pool", Pool).unwrap_or(Pool::shared);
    let threads = value_t!(matches, "threads", u32).unwrap_or(8);

    let opt = Opt {
        dir,
        port,
        pool,
        threads,
    };
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("segkv-db {}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", opt.dir);
    info!("Listening on 0.0.0.0:{}", opt.port);

    let mut config = StoreConfig::new(&opt.dir);
    // test suites shorten the merge interval through the environment
    if let Ok(ms) = env::var("TEST_MERGE_INTERVAL_MS") {
        match ms.parse::<u64>() {
            Ok(ms) if ms > 0 => config.merge_interval = Duration::from_millis(ms),
            _ => warn!("ignoring invalid TEST_MERGE_INTERVAL_MS value: {}", ms),
        }
    }

    let store = Store::open(config)?;
    let addr = ("0.0.0.0", opt.port);
    match opt.pool {
        Pool::shared => run_with_pool(store, addr, SharedQueueThreadPool::new(opt.threads)?),
        Pool::rayon => run_with_pool(store, addr, RayonThreadPool::new(opt.threads)?),
        Pool::naive => run_with_pool(store, addr, NaiveThreadPool::new(opt.threads)?),
    }
}

fn run_with_pool<P: ThreadPool>(store: Store, addr: (&str, u16), pool: P) -> Result<()> {
    let server = DbServer::new(store, pool);
    server.run(addr)
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

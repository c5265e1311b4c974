mod api;
mod config;
mod listen;
mod metrics;
mod reload;
mod respond;
mod server;

use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::Server;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
#[clap(version)]
/// A container-aware split-horizon DNS server.
///
/// horizoned answers each client out of its own slice of the answer
/// view the orchestrator's metadata generator produces, falls back to
/// upstream recursive resolvers for everything else, and caches both
/// in a two-tier TTL cache.
///
/// The answer view is reloaded, without dropping queries, by POSTing
/// to /v1/reload on the reload address, by sending SIGHUP, or
/// automatically when a metadata server is configured and the
/// answers file changes.
///
/// Prometheus metrics are served at "http://{listen_reload}/metrics".
struct Args {
    /// Address to listen on for DNS queries, UDP and TCP both
    #[clap(long, value_parser, default_value = "0.0.0.0:53")]
    listen: SocketAddr,

    /// Address to listen on for the reload and metrics HTTP endpoint
    #[clap(long, value_parser, default_value = "127.0.0.1:8113")]
    listen_reload: SocketAddr,

    /// File containing the answers to respond with
    #[clap(long, value_parser, default_value = "./answers.json")]
    answers: PathBuf,

    /// TTL, in seconds, for answers which don't carry their own
    #[clap(long, value_parser, default_value_t = 600)]
    ttl: u32,

    /// Seconds to wait for each upstream resolver exchange
    #[clap(long, value_parser, default_value_t = 2)]
    recurser_timeout: u64,

    /// Names with fewer dots than this are tried with search suffixes
    /// appended; 0 means always
    #[clap(long, value_parser, default_value_t = 0)]
    ndots: u32,

    /// How many entries the global cache and each per-client cache hold
    #[clap(long, value_parser, default_value_t = 1000)]
    cache_capacity: usize,

    /// Metadata server address; when set, the answers file is watched
    /// for changes and reloaded automatically
    #[clap(long, value_parser)]
    metadata_server: Option<String>,

    /// Comma-separated addresses to answer for metadata.<zone> under
    /// every authoritative zone
    #[clap(long, value_parser, value_delimiter = ',')]
    metadata_answer: Vec<Ipv4Addr>,

    /// Comma-separated addresses queries must never be forwarded to
    #[clap(long, value_parser, value_delimiter = ',')]
    never_recurse_to: Vec<IpAddr>,

    /// File to log to instead of stderr
    #[clap(long, value_parser)]
    log: Option<PathBuf>,

    /// File to write the process id to
    #[clap(long, value_parser)]
    pid_file: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(long, action(clap::ArgAction::SetTrue))]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            listen: self.listen,
            listen_reload: self.listen_reload,
            answers_file: self.answers,
            default_ttl: self.ttl,
            recurser_timeout: Duration::from_secs(self.recurser_timeout),
            ndots: self.ndots,
            cache_capacity: std::cmp::max(1, self.cache_capacity),
            metadata_server: self.metadata_server,
            metadata_answer: self.metadata_answer,
            never_recurse_to: self.never_recurse_to,
        }
    }
}

fn begin_logging(log_file: Option<&PathBuf>, debug: bool) {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        var.split(',').map(str::to_string).collect()
    } else {
        HashSet::new()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    if let Some(path) = log_file {
        let file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(error) => {
                eprintln!("could not open log file {}: {error}", path.display());
                process::exit(1);
            }
        };
        let logger = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false);
        if log_format.contains("json") {
            logger.json().init();
        } else {
            logger.init();
        }
    } else {
        let logger = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(!log_format.contains("no-ansi"));
        if log_format.contains("json") {
            logger.json().init();
        } else {
            logger.init();
        }
    }
}

fn write_pid_file(path: &PathBuf) {
    if let Err(error) = std::fs::write(path, format!("{}\n", process::id())) {
        tracing::error!(path = %path.display(), ?error, "could not write pid file");
        process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging(args.log.as_ref(), args.debug);

    if let Some(path) = &args.pid_file {
        write_pid_file(path);
    }

    let config = args.into_config();

    tracing::info!(path = %config.answers_file.display(), "loading answers");
    let view = match reload::load_view(&config).await {
        Ok(view) => view,
        Err(error) => {
            tracing::error!(%error, "could not load answers");
            process::exit(1);
        }
    };
    tracing::info!(clients = %view.len(), "loaded answers");

    tracing::info!(address = %config.listen, "binding DNS UDP socket");
    let udp = match UdpSocket::bind(config.listen).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(address = %config.listen, "binding DNS TCP socket");
    let tcp = match TcpListener::bind(config.listen).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let listen_reload = config.listen_reload;
    let watch_answers = config.metadata_server.is_some();
    let answers_file = config.answers_file.clone();
    if let Some(metadata_server) = &config.metadata_server {
        tracing::info!(%metadata_server, "metadata-driven reloads enabled");
    }

    let server = Arc::new(Server::new(config, view));

    let (reload_tx, reload_rx) = mpsc::channel(8);
    tokio::spawn(listen::listen_udp_task(server.clone(), udp));
    tokio::spawn(listen::listen_tcp_task(server.clone(), tcp));
    tokio::spawn(reload::reload_task(server.clone(), reload_rx));
    tokio::spawn(reload::sighup_task(reload_tx.clone()));
    if watch_answers {
        tokio::spawn(reload::watch_answers_task(reload_tx.clone(), answers_file));
    }

    tracing::info!(address = %listen_reload, "binding reload HTTP socket");
    if let Err(error) = api::serve_admin_endpoint_task(listen_reload, reload_tx).await {
        tracing::error!(?error, "could not bind reload HTTP socket");
        process::exit(1);
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use view_resolver::resolve::ResolveOpts;

/// Runtime configuration, built once from the command line and then
/// passed around by reference.  Tests construct it directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the DNS listeners bind, UDP and TCP both.
    pub listen: SocketAddr,

    /// Address the reload/metrics HTTP endpoint binds.
    pub listen_reload: SocketAddr,

    /// Path of the answer snapshot file written by the generator.
    pub answers_file: PathBuf,

    /// TTL, in seconds, for answers without their own.
    pub default_ttl: u32,

    /// Bound on each upstream exchange.
    pub recurser_timeout: Duration,

    /// Dot threshold for search-suffix expansion; zero means short
    /// names are always expanded.
    pub ndots: u32,

    /// Entry cap for the global cache and for each per-client cache.
    pub cache_capacity: usize,

    /// Metadata server address.  When set, the answers file is
    /// watched and reloaded as the generator rewrites it.
    pub metadata_server: Option<String>,

    /// Addresses to answer for `metadata.<zone>` under every
    /// authoritative zone.
    pub metadata_answer: Vec<Ipv4Addr>,

    /// Addresses queries must never be forwarded to, whatever the
    /// view says.
    pub never_recurse_to: Vec<IpAddr>,
}

impl Config {
    pub fn resolve_opts(&self) -> ResolveOpts {
        ResolveOpts {
            default_ttl: self.default_ttl,
            ndots: self.ndots,
        }
    }

    pub fn default_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.default_ttl.into())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            listen_reload: SocketAddr::from(([127, 0, 0, 1], 8113)),
            answers_file: PathBuf::from("./answers.json"),
            default_ttl: 600,
            recurser_timeout: Duration::from_secs(2),
            ndots: 0,
            cache_capacity: 1000,
            metadata_server: None,
            metadata_answer: Vec::new(),
            never_recurse_to: Vec::new(),
        }
    }
}

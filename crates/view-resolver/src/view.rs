//! The per-client answer view: an immutable snapshot of the answer
//! configuration, addressable by client key.  A view is built by the
//! external metadata generator (or read back from its JSON snapshot
//! file), installed atomically, and never mutated afterwards.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use dns_wire::types::DomainName;

/// The top-level key holding the answers used when no client-specific
/// entry matches.
pub const DEFAULT_KEY: &str = "default";

/// A set of IPv4 addresses for one name.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct ARecord {
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub answer: Vec<Ipv4Addr>,
}

/// A single alias target.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct CnameRecord {
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub answer: String,
}

/// A single reverse-lookup target.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct PtrRecord {
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub answer: String,
}

/// A set of text strings for one name, each at most 255 octets.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct TxtRecord {
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub answer: Vec<String>,
}

/// Grouped records and policy for one client key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientAnswers {
    /// Search suffixes, in the order they are tried.
    pub search: Vec<String>,

    /// Upstream resolver addresses, tried in order.  An address
    /// without a port gets port 53.
    pub recurse: Vec<String>,

    /// Domain suffixes this server claims authority over.  Only
    /// meaningful on the `default` client; ignored elsewhere.
    // the generator historically wrote this key misspelt
    #[serde(alias = "authorative")]
    pub authoritative: Vec<String>,

    pub a: HashMap<String, ARecord>,
    pub cname: HashMap<String, CnameRecord>,
    pub ptr: HashMap<String, PtrRecord>,
    pub txt: HashMap<String, TxtRecord>,
}

/// A mapping from client key (source IP, truncated container id, or
/// `default`) to that client's answers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct AnswerView {
    clients: HashMap<String, ClientAnswers>,
}

/// An error reading a snapshot file into a view.
#[derive(Debug)]
pub enum ViewError {
    Parse(serde_json::Error),
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ViewError::Parse(error) => write!(f, "could not parse answer snapshot: {error}"),
        }
    }
}

impl std::error::Error for ViewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ViewError::Parse(error) => Some(error),
        }
    }
}

impl AnswerView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a view from its JSON snapshot form and normalise it.
    pub fn from_json(data: &str) -> Result<Self, ViewError> {
        let mut view: AnswerView = serde_json::from_str(data).map_err(ViewError::Parse)?;
        view.normalise();
        Ok(view)
    }

    /// Add a client to the view.  Callers building a view by hand
    /// must pass keys and names in normalised form (lowercase,
    /// trailing dot); `from_json` does this itself.
    pub fn insert_client(&mut self, key: impl Into<String>, answers: ClientAnswers) {
        self.clients.insert(key.into(), answers);
    }

    pub fn client(&self, key: &str) -> Option<&ClientAnswers> {
        self.clients.get(key)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The upstream resolvers to try for a client: its own `recurse`
    /// list followed by the default one.  Empty lists are skipped.
    pub fn recursers(&self, client_key: &str) -> Vec<String> {
        let mut hosts = Vec::new();
        if let Some(client) = self.clients.get(client_key) {
            hosts.extend(client.recurse.iter().cloned());
        }
        if client_key != DEFAULT_KEY {
            if let Some(client) = self.clients.get(DEFAULT_KEY) {
                hosts.extend(client.recurse.iter().cloned());
            }
        }
        hosts
    }

    pub fn search_suffixes(&self, client_key: &str) -> &[String] {
        self.clients
            .get(client_key)
            .map_or(&[], |client| &client.search)
    }

    /// The authoritative suffixes, from the default client only, in
    /// leading-and-trailing-dot form (`.example.`).
    pub fn authoritative_suffixes(&self) -> &[String] {
        self.clients
            .get(DEFAULT_KEY)
            .map_or(&[], |client| &client.authoritative)
    }

    /// Whether the name falls under a domain this server is
    /// authoritative for.  Returns the longest matching domain, in
    /// trailing-dot form without the leading dot.
    pub fn is_authoritative_domain(&self, fqdn: &str) -> Option<&str> {
        self.authoritative_suffixes()
            .iter()
            .filter(|suffix| fqdn.ends_with(suffix.as_str()))
            .max_by_key(|suffix| suffix.len())
            .map(|suffix| suffix.trim_start_matches('.'))
    }

    /// Remove blocked addresses from every client's `recurse` list.
    pub fn strip_recursers(&mut self, blocked: &[IpAddr]) {
        if blocked.is_empty() {
            return;
        }

        for client in self.clients.values_mut() {
            client.recurse.retain(|resolver| {
                let host = if resolver.parse::<IpAddr>().is_ok() {
                    resolver.as_str()
                } else {
                    resolver.rsplit_once(':').map_or(resolver.as_str(), |(host, _)| host)
                };
                match host.parse::<IpAddr>() {
                    Ok(address) => !blocked.contains(&address),
                    Err(_) => true,
                }
            });
        }
    }

    /// Add an A entry to the default client, overriding any existing
    /// entry for that name.  Used to pin well-known service names,
    /// like the metadata address, into every view.
    pub fn add_default_a(&mut self, fqdn: &str, addresses: Vec<Ipv4Addr>) {
        let Some(key) = normalise_fqdn(fqdn) else {
            tracing::warn!(%fqdn, "dropping static answer with unparseable name");
            return;
        };

        self.clients.entry(DEFAULT_KEY.to_string()).or_default().a.insert(
            key,
            ARecord {
                ttl: None,
                answer: addresses,
            },
        );
    }

    /// Bring a freshly-parsed view into canonical form: record keys
    /// lowercased and dot-terminated, alias targets likewise,
    /// authoritative suffixes in `.example.` form, and bare-IP PTR
    /// keys rewritten to `in-addr.arpa.` names.  Entries whose names
    /// do not parse are dropped.
    fn normalise(&mut self) {
        for (client_key, client) in &mut self.clients {
            client.authoritative = client
                .authoritative
                .iter()
                .map(|suffix| format!(".{}.", suffix.trim_matches('.').to_lowercase()))
                .collect();

            for suffix in &mut client.search {
                *suffix = suffix.to_lowercase();
            }

            client.a = std::mem::take(&mut client.a)
                .into_iter()
                .filter_map(|(fqdn, record)| match normalise_fqdn(&fqdn) {
                    Some(key) => Some((key, record)),
                    None => {
                        tracing::warn!(client = %client_key, %fqdn, "dropping A entry with unparseable name");
                        None
                    }
                })
                .collect();

            client.cname = std::mem::take(&mut client.cname)
                .into_iter()
                .filter_map(|(fqdn, mut record)| {
                    match (normalise_fqdn(&fqdn), normalise_fqdn(&record.answer)) {
                        (Some(key), Some(target)) => {
                            record.answer = target;
                            Some((key, record))
                        }
                        _ => {
                            tracing::warn!(client = %client_key, %fqdn, "dropping CNAME entry with unparseable name");
                            None
                        }
                    }
                })
                .collect();

            client.ptr = std::mem::take(&mut client.ptr)
                .into_iter()
                .filter_map(|(fqdn, mut record)| {
                    match (normalise_ptr_key(&fqdn), normalise_fqdn(&record.answer)) {
                        (Some(key), Some(target)) => {
                            record.answer = target;
                            Some((key, record))
                        }
                        _ => {
                            tracing::warn!(client = %client_key, %fqdn, "dropping PTR entry with unparseable name");
                            None
                        }
                    }
                })
                .collect();

            client.txt = std::mem::take(&mut client.txt)
                .into_iter()
                .filter_map(|(fqdn, record)| match normalise_fqdn(&fqdn) {
                    Some(key) => Some((key, record)),
                    None => {
                        tracing::warn!(client = %client_key, %fqdn, "dropping TXT entry with unparseable name");
                        None
                    }
                })
                .collect();
        }
    }
}

/// Lowercase a name, give it a trailing dot, and check it parses.
fn normalise_fqdn(fqdn: &str) -> Option<String> {
    DomainName::from_dotted_string(fqdn).map(|name| name.to_dotted_string())
}

/// PTR keys which are bare IPv4 addresses become reverse-form names,
/// so `1.2.3.4` is looked up as `4.3.2.1.in-addr.arpa.`.
fn normalise_ptr_key(key: &str) -> Option<String> {
    if let Ok(address) = key.trim_end_matches('.').parse::<Ipv4Addr>() {
        let [a, b, c, d] = address.octets();
        return Some(format!("{d}.{c}.{b}.{a}.in-addr.arpa."));
    }
    normalise_fqdn(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_normalises_names() {
        let view = AnswerView::from_json(
            r#"{
                "default": {
                    "search": ["Rancher.INTERNAL"],
                    "authoritative": ["Example"],
                    "a": {"WEB.Example": {"answer": ["10.0.0.1"]}},
                    "cname": {"alias.example.": {"answer": "WEB.example"}}
                }
            }"#,
        )
        .unwrap();

        let default = view.client(DEFAULT_KEY).unwrap();
        assert!(default.a.contains_key("web.example."));
        assert_eq!("web.example.", default.cname["alias.example."].answer);
        assert_eq!(vec![".example.".to_string()], default.authoritative);
        assert_eq!(vec!["rancher.internal".to_string()], default.search);
    }

    #[test]
    fn from_json_accepts_the_misspelt_authoritative_key() {
        let view =
            AnswerView::from_json(r#"{"default": {"authorative": ["example."]}}"#).unwrap();

        assert_eq!(&[".example.".to_string()], view.authoritative_suffixes());
    }

    #[test]
    fn from_json_rewrites_bare_ip_ptr_keys() {
        let view = AnswerView::from_json(
            r#"{"default": {"ptr": {"10.1.2.3": {"answer": "web.example."}}}}"#,
        )
        .unwrap();

        let default = view.client(DEFAULT_KEY).unwrap();
        assert_eq!(
            "web.example.",
            default.ptr["3.2.1.10.in-addr.arpa."].answer
        );
    }

    #[test]
    fn from_json_drops_unparseable_names() {
        let view = AnswerView::from_json(
            r#"{"default": {"a": {
                "ok.example.": {"answer": ["10.0.0.1"]},
                "bad..example.": {"answer": ["10.0.0.2"]}
            }}}"#,
        )
        .unwrap();

        assert_eq!(1, view.client(DEFAULT_KEY).unwrap().a.len());
    }

    #[test]
    fn recursers_concatenates_client_then_default() {
        let mut view = AnswerView::new();
        view.insert_client(
            "10.0.0.9",
            ClientAnswers {
                recurse: vec!["1.1.1.1".to_string()],
                ..ClientAnswers::default()
            },
        );
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                recurse: vec!["8.8.8.8:53".to_string(), "9.9.9.9".to_string()],
                ..ClientAnswers::default()
            },
        );

        assert_eq!(
            vec![
                "1.1.1.1".to_string(),
                "8.8.8.8:53".to_string(),
                "9.9.9.9".to_string()
            ],
            view.recursers("10.0.0.9")
        );
        assert_eq!(
            vec!["8.8.8.8:53".to_string(), "9.9.9.9".to_string()],
            view.recursers("10.9.9.9")
        );
    }

    #[test]
    fn is_authoritative_domain_returns_the_longest_match() {
        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                authoritative: vec![".example.".to_string(), ".svc.example.".to_string()],
                ..ClientAnswers::default()
            },
        );

        assert_eq!(
            Some("svc.example."),
            view.is_authoritative_domain("web.svc.example.")
        );
        assert_eq!(Some("example."), view.is_authoritative_domain("web.example."));
        assert_eq!(None, view.is_authoritative_domain("web.other."));
        // the apex itself is not a match of its own suffix
        assert_eq!(None, view.is_authoritative_domain("example."));
    }

    #[test]
    fn authoritative_is_read_from_the_default_client_only() {
        let mut view = AnswerView::new();
        view.insert_client(
            "10.0.0.9",
            ClientAnswers {
                authoritative: vec![".example.".to_string()],
                ..ClientAnswers::default()
            },
        );

        assert!(view.authoritative_suffixes().is_empty());
    }

    #[test]
    fn strip_recursers_removes_blocked_addresses() {
        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                recurse: vec![
                    "169.254.169.250".to_string(),
                    "8.8.8.8:5353".to_string(),
                    "1.1.1.1".to_string(),
                ],
                ..ClientAnswers::default()
            },
        );

        view.strip_recursers(&[
            "169.254.169.250".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
        ]);

        assert_eq!(vec!["1.1.1.1".to_string()], view.recursers(DEFAULT_KEY));
    }

    #[test]
    fn add_default_a_overrides_and_normalises() {
        let mut view = AnswerView::new();
        view.add_default_a("Metadata.Example", vec![Ipv4Addr::new(169, 254, 169, 250)]);

        let default = view.client(DEFAULT_KEY).unwrap();
        assert_eq!(
            vec![Ipv4Addr::new(169, 254, 169, 250)],
            default.a["metadata.example."].answer
        );
    }
}

//! The per-query router and the process-wide state it runs against:
//! the live answer view, both cache tiers, the recurser, and the SOA
//! serial.  Everything lives in one `Server` value, so tests can
//! stand one up around a fabricated view.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use dns_wire::types::{
    Message, QueryType, Rcode, RecordClass, RecordType,
};
use view_resolver::cache::{rewrite_ttls, CacheKey, ClientCaches, SharedCache};
use view_resolver::recurse::Recurser;
use view_resolver::resolve::{addresses, matching, shuffle_answers};
use view_resolver::view::{AnswerView, DEFAULT_KEY};

use crate::config::Config;
use crate::metrics::*;
use crate::respond::synthesise_soa;

pub struct Server {
    config: Config,

    /// The live view.  Queries read it, reloads replace it; a query
    /// in flight keeps the view it started with.
    view: RwLock<Arc<AnswerView>>,

    /// Upstream responses, shared across clients.  Survives reloads.
    global_cache: SharedCache,

    /// Locally-resolved responses, one cache per client key.
    /// Cleared on every reload.
    client_caches: ClientCaches,

    recurser: Recurser,

    /// Serial for synthesised SOA records.
    soa_serial: AtomicU32,
}

impl Server {
    pub fn new(config: Config, view: AnswerView) -> Self {
        let global_cache = SharedCache::new(config.cache_capacity, config.default_ttl_duration());
        let client_caches = ClientCaches::new(config.cache_capacity, config.default_ttl_duration());
        let recurser = Recurser::new(config.recurser_timeout);

        Self {
            config,
            view: RwLock::new(Arc::new(view)),
            global_cache,
            client_caches,
            recurser,
            soa_serial: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn current_view(&self) -> Arc<AnswerView> {
        self.view.read().await.clone()
    }

    /// Swap in a freshly-generated view and drop every per-client
    /// cache, since any of their answers may now be stale.  The
    /// global cache only holds upstream answers, which a reload does
    /// not invalidate.
    pub async fn install_view(&self, view: AnswerView) {
        let clients = view.len();
        {
            let mut lock = self.view.write().await;
            *lock = Arc::new(view);
        }
        self.client_caches.clear();
        tracing::info!(%clients, "installed new answer view");
    }

    /// Answer one query.  This is the whole per-query pipeline:
    /// validation, the per-client cache, the view resolver, the
    /// global cache, the authoritative NXDOMAIN gate, and finally the
    /// upstream recursers.
    pub async fn handle_query(&self, request: &Message, peer: SocketAddr) -> Message {
        let view = self.current_view().await;

        let mut response = request.make_response();
        response.header.is_authoritative = true;

        let client_key = peer.ip().to_string();

        if request.questions.len() != 1 {
            DNS_REQUESTS_REFUSED_TOTAL
                .with_label_values(&[REFUSED_FOR_MULTIPLE_QUESTIONS])
                .inc();
            tracing::info!(client = %client_key, count = %request.questions.len(), "refused: question count");
            return servfail(response);
        }
        let question = &request.questions[0];
        tracing::debug!(%question, client = %client_key, "query");

        if question.qclass != RecordClass::IN {
            DNS_REQUESTS_REFUSED_TOTAL
                .with_label_values(&[REFUSED_FOR_QCLASS])
                .inc();
            tracing::info!("refused: query class");
            return not_implemented(response);
        }

        let qtype = match question.qtype {
            QueryType::Any => {
                DNS_REQUESTS_REFUSED_TOTAL
                    .with_label_values(&[REFUSED_FOR_QTYPE_ANY])
                    .inc();
                tracing::info!("refused: ANY query");
                return not_implemented(response);
            }
            QueryType::Record(rtype) => rtype,
        };

        // wire names come out of the parser lowercased, so this is
        // the canonical form
        let qname = question.name.to_dotted_string();
        let cache_key = CacheKey::for_question(question);

        let client_cache = self.client_caches.for_client(&client_key);
        if let Some((cached, expires_at)) = client_cache.get(&cache_key) {
            RESOLVER_CACHE_HIT_TOTAL.with_label_values(&["client"]).inc();
            tracing::debug!("client cache HIT");
            return finish_cached(request, cached, expires_at);
        }
        RESOLVER_CACHE_MISS_TOTAL.with_label_values(&["client"]).inc();

        let opts = self.config.resolve_opts();

        match qtype {
            RecordType::A => {
                if let Some(records) = addresses(
                    &view,
                    opts,
                    &self.recurser,
                    RecordType::A,
                    &client_key,
                    &qname,
                    &[],
                    1,
                )
                .await
                {
                    RESOLVER_VIEW_HIT_TOTAL.inc();
                    tracing::debug!(found = %records.len(), "answered from view");
                    response.answers = records;
                    client_cache.insert(cache_key, response.clone());
                    return response;
                }
            }
            RecordType::AAAA => {
                // the view carries no AAAA data, so this is purely an
                // existence probe: a known name gets an empty NOERROR
                // instead of whatever upstream would say about it
                if addresses(
                    &view,
                    opts,
                    &self.recurser,
                    RecordType::AAAA,
                    &client_key,
                    &qname,
                    &[],
                    1,
                )
                .await
                .is_some()
                {
                    RESOLVER_VIEW_HIT_TOTAL.inc();
                    tracing::debug!("known name, no AAAA data");
                    client_cache.insert(cache_key, response.clone());
                    return response;
                }
            }
            _ => {
                for scope in [client_key.as_str(), DEFAULT_KEY] {
                    if let Some(records) = matching(&view, opts, qtype, scope, &qname) {
                        if !records.is_empty() {
                            RESOLVER_VIEW_HIT_TOTAL.inc();
                            tracing::debug!(%scope, found = %records.len(), "answered from view");
                            response.answers = records;
                            client_cache.insert(cache_key, response.clone());
                            return response;
                        }
                    }
                }
            }
        }

        if let Some((cached, expires_at)) = self.global_cache.get(&cache_key) {
            RESOLVER_CACHE_HIT_TOTAL.with_label_values(&["global"]).inc();
            tracing::debug!("global cache HIT");
            return finish_cached(request, cached, expires_at);
        }
        RESOLVER_CACHE_MISS_TOTAL.with_label_values(&["global"]).inc();

        // Names under our zones never go upstream: a miss there is an
        // authoritative NXDOMAIN.
        if let Some(zone) = view.is_authoritative_domain(&qname) {
            AUTHORITATIVE_NXDOMAIN_TOTAL.inc();
            tracing::info!(%zone, "authoritative NXDOMAIN");
            response.header.rcode = Rcode::NameError;
            let serial = self.soa_serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(soa) = synthesise_soa(zone, serial, self.config.default_ttl) {
                response.authority.push(soa);
            }
            return response;
        }

        let resolvers = view.recursers(&client_key);
        match self.recurser.resolve_try_all(request, &resolvers).await {
            Ok(mut upstream) => {
                RESOLVER_UPSTREAM_HIT_TOTAL.inc();
                tracing::debug!("answered from upstream");
                upstream.header.id = request.header.id;

                // a local name has no AAAA data rather than not
                // existing, and upstream cannot know that
                if qtype == RecordType::AAAA && upstream.header.rcode == Rcode::NameError {
                    upstream.header.rcode = Rcode::NoError;
                }

                self.global_cache.insert(cache_key, upstream.clone());
                upstream
            }
            Err(error) => {
                RESOLVER_UPSTREAM_MISS_TOTAL.inc();
                tracing::warn!(%error, "could not answer query");
                servfail(response)
            }
        }
    }
}

/// Reject a query with SERVFAIL.  Not cached.
fn servfail(mut response: Message) -> Message {
    response.header.rcode = Rcode::ServerFailure;
    response.header.is_authoritative = false;
    response
}

/// Reject a query with NotImplemented, clearing the RD flag.
fn not_implemented(mut response: Message) -> Message {
    response.header.rcode = Rcode::NotImplemented;
    response.header.is_authoritative = false;
    response.header.recursion_desired = false;
    response
}

/// Turn a cache entry back into a response for this particular
/// request: its id and RD flag, TTLs counted down to the remaining
/// lifetime, and a fresh round-robin shuffle.
fn finish_cached(request: &Message, mut cached: Message, expires_at: Instant) -> Message {
    cached.header.id = request.header.id;
    cached.header.recursion_desired = request.header.recursion_desired;
    rewrite_ttls(&mut cached, expires_at, Instant::now());
    shuffle_answers(&mut cached.answers);
    cached
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::types::test_util::*;
    use dns_wire::types::{RecordData, ResourceRecord};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use view_resolver::view::{ARecord, ClientAnswers, CnameRecord};

    const PEER: &str = "10.0.0.9:53531";

    fn test_config() -> Config {
        Config {
            ndots: 1,
            recurser_timeout: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn a_entry(addresses: &[&str]) -> ARecord {
        ARecord {
            ttl: None,
            answer: addresses.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    fn test_view() -> AnswerView {
        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                search: vec!["foo".to_string()],
                authoritative: vec![".example.".to_string()],
                a: HashMap::from([
                    ("svc.example.".to_string(), a_entry(&["10.0.0.1"])),
                    ("host.foo.".to_string(), a_entry(&["10.1.1.1"])),
                ]),
                cname: HashMap::from([
                    (
                        "alias.example.".to_string(),
                        CnameRecord {
                            ttl: None,
                            answer: "svc.example.".to_string(),
                        },
                    ),
                    (
                        "a.".to_string(),
                        CnameRecord {
                            ttl: None,
                            answer: "a.".to_string(),
                        },
                    ),
                ]),
                ..ClientAnswers::default()
            },
        );
        view
    }

    fn server() -> Server {
        Server::new(test_config(), test_view())
    }

    fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    fn query(name: &str, qtype: QueryType) -> Message {
        let mut request = Message::from_question(7, question(name, qtype));
        request.header.recursion_desired = true;
        request
    }

    fn answer_addresses(response: &Message) -> Vec<Ipv4Addr> {
        response
            .answers
            .iter()
            .filter_map(|rr: &ResourceRecord| match rr.data {
                RecordData::A { address } => Some(address),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn exact_a_is_answered_authoritatively() {
        let request = query("svc.example.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 1)], answer_addresses(&response));
        assert_eq!(600, response.answers[0].ttl);
        assert_eq!(7, response.header.id);
    }

    #[tokio::test]
    async fn cname_chains_come_back_in_order() {
        let request = query("alias.example.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(2, response.answers.len());
        assert_eq!(
            RecordData::CNAME {
                target: domain("svc.example.")
            },
            response.answers[0].data
        );
        assert_eq!(domain("alias.example."), response.answers[0].name);
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 1)], answer_addresses(&response));
    }

    #[tokio::test]
    async fn cname_self_loop_without_recursers_is_servfail() {
        let request = query("a.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::ServerFailure, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn search_expansion_answers_with_the_original_name() {
        let request = query("host.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(domain("host."), response.answers[0].name);
        assert_eq!(vec![Ipv4Addr::new(10, 1, 1, 1)], answer_addresses(&response));
    }

    #[tokio::test]
    async fn authoritative_miss_is_nxdomain_with_soa() {
        let request = query("ghost.example.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
        assert_eq!(1, response.authority.len());
        assert_eq!(domain("example."), response.authority[0].name);
        assert_eq!(RecordType::SOA, response.authority[0].data.rtype());
    }

    #[tokio::test]
    async fn soa_serial_increases_per_synthesis() {
        let server = server();
        let request = query("ghost.example.", QueryType::Record(RecordType::A));

        let first = server.handle_query(&request, peer()).await;
        let second = server.handle_query(&request, peer()).await;

        let serial_of = |response: &Message| match response.authority[0].data {
            RecordData::SOA { serial, .. } => serial,
            _ => panic!("expected SOA"),
        };
        assert!(serial_of(&second) > serial_of(&first));
    }

    #[tokio::test]
    async fn aaaa_for_a_known_name_is_an_empty_noerror() {
        let request = query("svc.example.", QueryType::Record(RecordType::AAAA));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.answers.is_empty());
        assert!(response.header.is_authoritative);
    }

    #[tokio::test]
    async fn multiple_questions_are_refused() {
        let mut request = query("svc.example.", QueryType::Record(RecordType::A));
        request
            .questions
            .push(question("other.example.", QueryType::Record(RecordType::A)));

        let response = server().handle_query(&request, peer()).await;
        assert_eq!(Rcode::ServerFailure, response.header.rcode);
        assert!(!response.header.is_authoritative);
    }

    #[tokio::test]
    async fn non_in_classes_are_not_implemented() {
        let mut request = query("svc.example.", QueryType::Record(RecordType::A));
        request.questions[0].qclass = RecordClass::Other(3);

        let response = server().handle_query(&request, peer()).await;
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert!(!response.header.is_authoritative);
        assert!(!response.header.recursion_desired);
    }

    #[tokio::test]
    async fn any_queries_are_not_implemented() {
        let request = query("svc.example.", QueryType::Any);

        let response = server().handle_query(&request, peer()).await;
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert!(!response.header.is_authoritative);
    }

    #[tokio::test]
    async fn unmatched_names_without_recursers_are_servfail() {
        let request = query("www.elsewhere.net.", QueryType::Record(RecordType::A));
        let response = server().handle_query(&request, peer()).await;

        assert_eq!(Rcode::ServerFailure, response.header.rcode);
    }

    #[tokio::test]
    async fn install_view_clears_client_answers() {
        let server = server();
        let request = query("svc.example.", QueryType::Record(RecordType::A));

        let first = server.handle_query(&request, peer()).await;
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 1)], answer_addresses(&first));

        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                a: HashMap::from([("svc.example.".to_string(), a_entry(&["10.0.0.2"]))]),
                ..ClientAnswers::default()
            },
        );
        server.install_view(view).await;

        let second = server.handle_query(&request, peer()).await;
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 2)], answer_addresses(&second));
    }

    #[tokio::test]
    async fn repeat_queries_are_served_from_the_client_cache() {
        let server = server();
        let request = query("svc.example.", QueryType::Record(RecordType::A));

        let first = server.handle_query(&request, peer()).await;
        let second = server.handle_query(&request, peer()).await;

        // same answer, and the cached TTL can only have counted down
        assert_eq!(answer_addresses(&first), answer_addresses(&second));
        assert!(second.answers[0].ttl <= first.answers[0].ttl);
    }

    #[tokio::test]
    async fn upstream_answers_are_cached_globally_and_rewritten_for_aaaa() {
        use tokio::net::UdpSocket;

        // an upstream which answers NXDOMAIN, once
        let upstream_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = upstream_socket.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (size, from) = upstream_socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            let mut response = request.make_response();
            response.header.rcode = Rcode::NameError;
            upstream_socket
                .send_to(&response.to_octets().unwrap(), from)
                .await
                .unwrap();
        });

        let mut view = test_view();
        let mut default = view.client(DEFAULT_KEY).unwrap().clone();
        default.recurse = vec![upstream];
        view.insert_client(DEFAULT_KEY, default);

        let server = Server::new(test_config(), view);
        let request = query("www.elsewhere.net.", QueryType::Record(RecordType::AAAA));

        // NXDOMAIN from upstream comes back rewritten to NOERROR
        let first = server.handle_query(&request, peer()).await;
        assert_eq!(Rcode::NoError, first.header.rcode);
        assert!(first.answers.is_empty());

        // the upstream is gone now, so only the global cache can
        // answer the repeat
        let second = server.handle_query(&request, peer()).await;
        assert_eq!(Rcode::NoError, second.header.rcode);
    }

    #[tokio::test]
    async fn other_record_types_use_client_then_default_scopes() {
        let mut view = test_view();
        view.insert_client(
            "10.0.0.9",
            ClientAnswers {
                txt: HashMap::from([(
                    "svc.example.".to_string(),
                    view_resolver::view::TxtRecord {
                        ttl: None,
                        answer: vec!["client-scoped".to_string()],
                    },
                )]),
                ..ClientAnswers::default()
            },
        );

        let server = Server::new(test_config(), view);
        let request = query("svc.example.", QueryType::Record(RecordType::TXT));
        let response = server.handle_query(&request, peer()).await;

        assert_eq!(1, response.answers.len());
        assert_eq!(
            RecordData::TXT {
                strings: vec![b"client-scoped".to_vec()]
            },
            response.answers[0].data
        );
    }
}

//! The answer-view resolver: multi-scope matching with search-suffix
//! expansion, CNAME chaining, and upstream fallback for chain links
//! the view cannot supply itself.

use async_recursion::async_recursion;
use rand::Rng;

use dns_wire::types::{
    DomainName, Message, Question, QueryType, RecordClass, RecordData, RecordType, ResourceRecord,
};

use crate::recurse::Recurser;
use crate::view::{AnswerView, DEFAULT_KEY};

/// Maximum recursion when resolving CNAMEs.  Bounds chains the view's
/// generator should never produce, but a hand-edited snapshot can.
pub const MAX_DEPTH: usize = 10;

/// Knobs the resolver needs from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOpts {
    /// TTL for records whose view entry does not carry one.
    pub default_ttl: u32,

    /// Names with at least this many dots skip search-suffix
    /// expansion.  Zero means short names are always expanded.
    pub ndots: u32,
}

/// Resolve a name against the view, following CNAMEs.
///
/// The result is the full answer section: the CNAME chain walked so
/// far, then the records the final target resolved to.  `None` means
/// the name is unknown to the view; `Some` with an empty vector means
/// the name exists but has no records of the requested type.
///
/// A chain link the view cannot resolve locally is handed to the
/// upstream resolvers, but only when we are actually inside a chain:
/// a top-level miss is the router's business, not ours.
#[async_recursion]
pub async fn addresses(
    view: &AnswerView,
    opts: ResolveOpts,
    recurser: &Recurser,
    qtype: RecordType,
    client_key: &str,
    fqdn: &str,
    cname_parents: &[ResourceRecord],
    depth: usize,
) -> Option<Vec<ResourceRecord>> {
    tracing::debug!(%fqdn, %qtype, client = %client_key, %depth, "resolving");

    // Limit recursing for non-obvious loops
    if cname_parents.len() >= MAX_DEPTH {
        tracing::warn!(%fqdn, client = %client_key, %depth, "followed CNAME too many times");
        return None;
    }

    if let Some(result) = matching(view, opts, RecordType::CNAME, client_key, fqdn) {
        if let Some(cname_rr) = result.into_iter().next() {
            if let RecordData::CNAME { target } = &cname_rr.data {
                let target = target.to_dotted_string();

                // Stop obvious loops
                if target == fqdn {
                    tracing::warn!(%fqdn, client = %client_key, %depth, "CNAME is a loop");
                    return None;
                }

                let mut parents = cname_parents.to_vec();
                parents.push(cname_rr.clone());

                if let Some(children) = addresses(
                    view,
                    opts,
                    recurser,
                    qtype,
                    client_key,
                    &target,
                    &parents,
                    depth + 1,
                )
                .await
                {
                    tracing::debug!(%fqdn, %target, client = %client_key, %depth, "resolved CNAME");
                    let mut records = vec![cname_rr];
                    records.extend(children);
                    return Some(records);
                }

                // a broken chain fails as a whole, never as the
                // walked prefix alone
                tracing::debug!(%fqdn, %target, client = %client_key, %depth, "CNAME target did not resolve");
                return None;
            }
        }
    }

    if let Some(mut records) = matching(view, opts, qtype, client_key, fqdn) {
        if records.is_empty() {
            tracing::debug!(%fqdn, %qtype, client = %client_key, "matched name but not type");
        } else {
            shuffle_answers(&mut records);
        }
        return Some(records);
    }

    // Mid-chain targets the view does not know are resolved upstream.
    if !cname_parents.is_empty() {
        tracing::debug!(%fqdn, %qtype, client = %client_key, "trying recursive servers for chain target");

        let name = DomainName::from_dotted_string(fqdn)?;
        let mut request = Message::from_question(
            rand::thread_rng().gen(),
            Question {
                name,
                qtype: QueryType::Record(qtype),
                qclass: RecordClass::IN,
            },
        );
        request.header.recursion_desired = true;

        let resolvers = view.recursers(client_key);
        if let Ok(response) = recurser.resolve_try_all(&request, &resolvers).await {
            return Some(response.answers);
        }
    }

    tracing::debug!(%fqdn, %qtype, client = %client_key, "did not match anything");
    None
}

/// Multi-scope matching: client answers with client search suffixes,
/// then default answers with client search suffixes, then default
/// answers with default search suffixes.  The first scope to produce
/// anything wins.
///
/// Names under an authoritative domain belong to us, so they are
/// never rewritten by search suffixes.
pub fn matching(
    view: &AnswerView,
    opts: ResolveOpts,
    qtype: RecordType,
    client_key: &str,
    label: &str,
) -> Option<Vec<ResourceRecord>> {
    let authoritative = view
        .authoritative_suffixes()
        .iter()
        .any(|suffix| label.ends_with(suffix.as_str()));

    let (client_searches, default_searches) = if authoritative {
        (&[][..], &[][..])
    } else {
        (
            view.search_suffixes(client_key),
            view.search_suffixes(DEFAULT_KEY),
        )
    };

    if let Some(records) = matching_search(view, opts, qtype, client_key, label, client_searches) {
        return Some(records);
    }
    if let Some(records) = matching_search(view, opts, qtype, DEFAULT_KEY, label, client_searches) {
        return Some(records);
    }
    matching_search(view, opts, qtype, DEFAULT_KEY, label, default_searches)
}

/// Exact match first, then the label with each search suffix
/// appended, provided the label is short enough to qualify.
fn matching_search(
    view: &AnswerView,
    opts: ResolveOpts,
    qtype: RecordType,
    client_key: &str,
    label: &str,
    searches: &[String],
) -> Option<Vec<ResourceRecord>> {
    if let Some(records) = matching_exact(view, opts, qtype, client_key, label, label) {
        return Some(records);
    }

    let base = label.trim_end_matches('.');
    let limit = opts.ndots as usize;
    if limit == 0 || base.matches('.').count() < limit {
        for suffix in searches {
            let expanded = format!("{}.{}.", base, suffix.trim_end_matches('.'));
            tracing::debug!(fqdn = %expanded, client = %client_key, "trying alternate suffix");

            if let Some(records) = matching_exact(view, opts, qtype, client_key, &expanded, label) {
                return Some(records);
            }
        }
    }

    None
}

/// Look up one record type for one exact name in one client's
/// answers.
///
/// Synthesised records carry `answer_fqdn` as their name, which is
/// the label the client originally asked about, not whatever
/// search-expanded name actually matched.
///
/// `Some(vec![])` signals that the name exists in this client for a
/// different record type, so the caller can distinguish an empty
/// answer from a nonexistent name.
fn matching_exact(
    view: &AnswerView,
    opts: ResolveOpts,
    qtype: RecordType,
    client_key: &str,
    fqdn: &str,
    answer_fqdn: &str,
) -> Option<Vec<ResourceRecord>> {
    let client = view.client(client_key)?;
    let answer_name = DomainName::from_dotted_string(answer_fqdn)?;

    let mut records = Vec::new();
    match qtype {
        RecordType::A => {
            if let Some(entry) = client.a.get(fqdn) {
                let ttl = entry.ttl.unwrap_or(opts.default_ttl);
                for address in &entry.answer {
                    records.push(ResourceRecord {
                        name: answer_name.clone(),
                        data: RecordData::A { address: *address },
                        rclass: RecordClass::IN,
                        ttl,
                    });
                }
                shuffle_answers(&mut records);
            }
        }
        RecordType::CNAME => {
            if let Some(entry) = client.cname.get(fqdn) {
                if let Some(target) = DomainName::from_dotted_string(&entry.answer) {
                    records.push(ResourceRecord {
                        name: answer_name,
                        data: RecordData::CNAME { target },
                        rclass: RecordClass::IN,
                        ttl: entry.ttl.unwrap_or(opts.default_ttl),
                    });
                } else {
                    tracing::warn!(%fqdn, client = %client_key, target = %entry.answer, "CNAME target does not parse");
                }
            }
        }
        RecordType::PTR => {
            if let Some(entry) = client.ptr.get(fqdn) {
                if let Some(target) = DomainName::from_dotted_string(&entry.answer) {
                    records.push(ResourceRecord {
                        name: answer_name,
                        data: RecordData::PTR { target },
                        rclass: RecordClass::IN,
                        ttl: entry.ttl.unwrap_or(opts.default_ttl),
                    });
                } else {
                    tracing::warn!(%fqdn, client = %client_key, target = %entry.answer, "PTR target does not parse");
                }
            }
        }
        RecordType::TXT => {
            if let Some(entry) = client.txt.get(fqdn) {
                let ttl = entry.ttl.unwrap_or(opts.default_ttl);
                for string in &entry.answer {
                    if string.len() > 255 {
                        tracing::warn!(%fqdn, client = %client_key, "TXT record over 255 octets");
                        return None;
                    }
                    records.push(ResourceRecord {
                        name: answer_name.clone(),
                        data: RecordData::TXT {
                            strings: vec![string.clone().into_bytes()],
                        },
                        rclass: RecordClass::IN,
                        ttl,
                    });
                }
            }
        }
        _ => (),
    }

    if !records.is_empty() {
        return Some(records);
    }

    // The name may exist under another record type.  Report that as
    // an empty match, so the caller can tell "no data" from
    // "no such name".
    if client.a.contains_key(fqdn)
        || client.cname.contains_key(fqdn)
        || client.ptr.contains_key(fqdn)
        || client.txt.contains_key(fqdn)
    {
        return Some(Vec::new());
    }

    None
}

/// Shuffle the address records of an answer, for round-robin between
/// equivalent addresses.  A CNAME chain prefix stays where it is:
/// only the tail from the first A/AAAA record onward is permuted.
pub fn shuffle_answers(records: &mut [ResourceRecord]) {
    let Some(first) = records
        .iter()
        .position(|rr| matches!(rr.data.rtype(), RecordType::A | RecordType::AAAA))
    else {
        return;
    };

    let tail = &mut records[first..];
    let mut rng = rand::thread_rng();
    for i in (1..tail.len()).rev() {
        tail.swap(i, rng.gen_range(0..=i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{ARecord, ClientAnswers, CnameRecord, TxtRecord};
    use dns_wire::types::test_util::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const OPTS: ResolveOpts = ResolveOpts {
        default_ttl: 600,
        ndots: 1,
    };

    fn recurser() -> Recurser {
        Recurser::new(Duration::from_millis(100))
    }

    fn a_entry(addresses: &[&str]) -> ARecord {
        ARecord {
            ttl: None,
            answer: addresses.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    fn cname_entry(target: &str) -> CnameRecord {
        CnameRecord {
            ttl: None,
            answer: target.to_string(),
        }
    }

    fn view() -> AnswerView {
        let mut view = AnswerView::new();

        view.insert_client(
            "10.0.0.9",
            ClientAnswers {
                search: vec!["client.internal".to_string()],
                a: HashMap::from([
                    ("svc.client.internal.".to_string(), a_entry(&["172.17.0.2"])),
                    ("web.example.".to_string(), a_entry(&["172.17.0.3"])),
                ]),
                ..ClientAnswers::default()
            },
        );

        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                search: vec!["foo".to_string()],
                authoritative: vec![".example.".to_string()],
                a: HashMap::from([
                    ("web.example.".to_string(), a_entry(&["10.0.0.1"])),
                    (
                        "multi.example.".to_string(),
                        a_entry(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
                    ),
                    ("host.foo.".to_string(), a_entry(&["10.1.1.1"])),
                ]),
                cname: HashMap::from([
                    ("alias.example.".to_string(), cname_entry("web.example.")),
                    ("loop.example.".to_string(), cname_entry("loop.example.")),
                    ("hop1.example.".to_string(), cname_entry("hop2.example.")),
                    ("hop2.example.".to_string(), cname_entry("web.example.")),
                ]),
                txt: HashMap::from([(
                    "text.example.".to_string(),
                    TxtRecord {
                        ttl: None,
                        answer: vec!["hello".to_string()],
                    },
                )]),
                ..ClientAnswers::default()
            },
        );

        view
    }

    fn record_addresses(records: &[ResourceRecord]) -> Vec<Ipv4Addr> {
        records
            .iter()
            .filter_map(|rr| match rr.data {
                RecordData::A { address } => Some(address),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn addresses_resolves_an_exact_name() {
        let records = addresses(
            &view(),
            OPTS,
            &recurser(),
            RecordType::A,
            "anyone",
            "web.example.",
            &[],
            1,
        )
        .await
        .unwrap();

        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 1)], record_addresses(&records));
        assert_eq!(domain("web.example."), records[0].name);
        assert_eq!(600, records[0].ttl);
    }

    #[tokio::test]
    async fn addresses_prefers_client_answers() {
        let records = addresses(
            &view(),
            OPTS,
            &recurser(),
            RecordType::A,
            "10.0.0.9",
            "web.example.",
            &[],
            1,
        )
        .await
        .unwrap();

        assert_eq!(
            vec![Ipv4Addr::new(172, 17, 0, 3)],
            record_addresses(&records)
        );
    }

    #[tokio::test]
    async fn addresses_follows_cname_chains() {
        let records = addresses(
            &view(),
            OPTS,
            &recurser(),
            RecordType::A,
            "anyone",
            "hop1.example.",
            &[],
            1,
        )
        .await
        .unwrap();

        assert_eq!(3, records.len());
        assert_eq!(RecordType::CNAME, records[0].data.rtype());
        assert_eq!(domain("hop1.example."), records[0].name);
        assert_eq!(RecordType::CNAME, records[1].data.rtype());
        assert_eq!(RecordType::A, records[2].data.rtype());
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 1)], record_addresses(&records));
    }

    #[tokio::test]
    async fn addresses_stops_cname_self_loops() {
        let result = addresses(
            &view(),
            OPTS,
            &recurser(),
            RecordType::A,
            "anyone",
            "loop.example.",
            &[],
            1,
        )
        .await;

        assert_eq!(None, result);
    }

    #[tokio::test]
    async fn addresses_gives_up_past_max_depth() {
        let mut view = AnswerView::new();
        let mut cname = HashMap::new();
        for i in 0..20 {
            cname.insert(
                format!("hop{i}.example."),
                cname_entry(&format!("hop{}.example.", i + 1)),
            );
        }
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                cname,
                authoritative: vec![".example.".to_string()],
                ..ClientAnswers::default()
            },
        );

        let result = addresses(
            &view,
            OPTS,
            &recurser(),
            RecordType::A,
            "anyone",
            "hop0.example.",
            &[],
            1,
        )
        .await;

        assert_eq!(None, result);
    }

    #[tokio::test]
    async fn addresses_reports_name_without_type_as_empty() {
        let records = addresses(
            &view(),
            OPTS,
            &recurser(),
            RecordType::TXT,
            "anyone",
            "web.example.",
            &[],
            1,
        )
        .await
        .unwrap();

        assert!(records.is_empty());
    }

    #[test]
    fn matching_search_expands_short_names() {
        let records = matching(&view(), OPTS, RecordType::A, "anyone", "host.").unwrap();

        // the answer keeps the name the client asked about
        assert_eq!(domain("host."), records[0].name);
        assert_eq!(vec![Ipv4Addr::new(10, 1, 1, 1)], record_addresses(&records));
    }

    #[test]
    fn matching_search_expands_client_answers_with_client_suffixes() {
        let records = matching(&view(), OPTS, RecordType::A, "10.0.0.9", "svc.").unwrap();

        assert_eq!(domain("svc."), records[0].name);
        assert_eq!(
            vec![Ipv4Addr::new(172, 17, 0, 2)],
            record_addresses(&records)
        );
    }

    #[test]
    fn matching_search_uses_client_suffixes_for_default_answers() {
        let mut view = AnswerView::new();
        view.insert_client(
            "10.0.0.9",
            ClientAnswers {
                search: vec!["foo".to_string()],
                ..ClientAnswers::default()
            },
        );
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                a: HashMap::from([("host.foo.".to_string(), a_entry(&["10.1.1.1"]))]),
                ..ClientAnswers::default()
            },
        );

        let records = matching(&view, OPTS, RecordType::A, "10.0.0.9", "host.").unwrap();
        assert_eq!(vec![Ipv4Addr::new(10, 1, 1, 1)], record_addresses(&records));
    }

    #[test]
    fn matching_skips_expansion_for_names_with_enough_dots() {
        let opts = ResolveOpts {
            default_ttl: 600,
            ndots: 1,
        };

        // "ghost.nowhere." has one dot, meeting the threshold, so no
        // suffix rewrite happens and nothing matches
        assert_eq!(
            None,
            matching(&view(), opts, RecordType::A, "anyone", "ghost.nowhere.")
        );
    }

    #[test]
    fn matching_with_ndots_zero_always_expands() {
        let opts = ResolveOpts {
            default_ttl: 600,
            ndots: 0,
        };

        let records = matching(&view(), opts, RecordType::A, "anyone", "host.").unwrap();
        assert_eq!(vec![Ipv4Addr::new(10, 1, 1, 1)], record_addresses(&records));
    }

    #[test]
    fn matching_never_expands_authoritative_names() {
        // "web.example." resolves exactly; a name under the
        // authoritative suffix which only exists via expansion does
        // not resolve at all
        let mut view = view();
        view.insert_client(
            "10.0.0.8",
            ClientAnswers {
                search: vec!["example".to_string()],
                a: HashMap::from([(
                    "ghost.example.example.".to_string(),
                    a_entry(&["10.9.9.9"]),
                )]),
                ..ClientAnswers::default()
            },
        );

        assert_eq!(
            None,
            matching(&view, OPTS, RecordType::A, "10.0.0.8", "ghost.example.")
        );
    }

    #[test]
    fn matching_exact_fails_on_oversized_txt() {
        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                txt: HashMap::from([(
                    "big.example.".to_string(),
                    TxtRecord {
                        ttl: None,
                        answer: vec!["x".repeat(256)],
                    },
                )]),
                ..ClientAnswers::default()
            },
        );

        assert_eq!(
            None,
            matching(&view, OPTS, RecordType::TXT, "anyone", "big.example.")
        );
    }

    #[test]
    fn matching_honours_per_entry_ttls() {
        let mut view = AnswerView::new();
        view.insert_client(
            DEFAULT_KEY,
            ClientAnswers {
                a: HashMap::from([(
                    "web.example.".to_string(),
                    ARecord {
                        ttl: Some(42),
                        answer: vec![Ipv4Addr::new(10, 0, 0, 1)],
                    },
                )]),
                ..ClientAnswers::default()
            },
        );

        let records = matching(&view, OPTS, RecordType::A, "anyone", "web.example.").unwrap();
        assert_eq!(42, records[0].ttl);
    }

    #[test]
    fn shuffle_answers_permutes_without_losing_records() {
        let mut records = vec![
            cname_record("alias.example.", "multi.example."),
            a_record("multi.example.", Ipv4Addr::new(10, 0, 0, 1)),
            a_record("multi.example.", Ipv4Addr::new(10, 0, 0, 2)),
            a_record("multi.example.", Ipv4Addr::new(10, 0, 0, 3)),
        ];
        let original = records.clone();

        for _ in 0..50 {
            shuffle_answers(&mut records);

            // the CNAME prefix is a fixed point
            assert_eq!(original[0], records[0]);

            // same multiset of addresses
            let mut addresses = record_addresses(&records);
            addresses.sort();
            assert_eq!(
                vec![
                    Ipv4Addr::new(10, 0, 0, 1),
                    Ipv4Addr::new(10, 0, 0, 2),
                    Ipv4Addr::new(10, 0, 0, 3)
                ],
                addresses
            );
        }
    }

    #[test]
    fn shuffle_answers_leaves_recordless_answers_alone() {
        let mut records = vec![
            cname_record("a.example.", "b.example."),
            cname_record("b.example.", "c.example."),
        ];
        let original = records.clone();

        shuffle_answers(&mut records);
        assert_eq!(original, records);
    }
}

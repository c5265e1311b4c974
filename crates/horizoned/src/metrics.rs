use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0025, // 2.5 ms
    0.0050, // 5   ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    1.0000, // 1    s
    2.5000, // 2.5  s
];

pub const REFUSED_FOR_MULTIPLE_QUESTIONS: &str = "multiple_questions";
pub const REFUSED_FOR_QCLASS: &str = "qclass_not_in";
pub const REFUSED_FOR_QTYPE_ANY: &str = "qtype_any";

pub static DNS_REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "dns_requests_total",
                "Total number of DNS requests received, whether valid or invalid."
            ),
            &["protocol"]
        )
        .unwrap()
    });

pub static DNS_REQUESTS_REFUSED_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "dns_requests_refused_total",
                "Total number of DNS requests rejected before resolution."
            ),
            &["reason"]
        )
        .unwrap()
    });

pub static DNS_RESPONSES_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!("dns_responses_total", "Total number of DNS responses sent."),
            &["aa", "tc", "rcode"]
        )
        .unwrap()
    });

pub static DNS_RESPONSE_TIME_SECONDS: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec!(
            "dns_response_time_seconds",
            "Response time of DNS requests, whether valid or invalid.",
            &["protocol"],
            RESPONSE_TIME_BUCKETS.to_vec()
        )
        .unwrap()
    });

pub static RESOLVER_VIEW_HIT_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "resolver_view_hit_total",
            "Total number of questions answered from the answer view."
        ))
        .unwrap()
    });

pub static RESOLVER_CACHE_HIT_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!("resolver_cache_hit_total", "Total number of cache hits."),
            &["tier"]
        )
        .unwrap()
    });

pub static RESOLVER_CACHE_MISS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!("resolver_cache_miss_total", "Total number of cache misses."),
            &["tier"]
        )
        .unwrap()
    });

pub static RESOLVER_UPSTREAM_HIT_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "resolver_upstream_hit_total",
            "Total number of questions answered by an upstream resolver."
        ))
        .unwrap()
    });

pub static RESOLVER_UPSTREAM_MISS_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "resolver_upstream_miss_total",
            "Total number of questions every upstream resolver failed on."
        ))
        .unwrap()
    });

pub static AUTHORITATIVE_NXDOMAIN_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "authoritative_nxdomain_total",
            "Total number of NXDOMAIN answers for authoritative zones."
        ))
        .unwrap()
    });

pub static VIEW_RELOADS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "view_reloads_total",
                "Total number of answer view reloads attempted."
            ),
            &["outcome"]
        )
        .unwrap()
    });

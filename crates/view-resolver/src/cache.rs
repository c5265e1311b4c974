//! Caching of response messages.
//!
//! There are two tiers: one global cache holding upstream recursive
//! responses, shared by every client, and one cache per client key
//! holding locally-resolved responses.  Both are the same `Cache`
//! underneath: a bounded map from question tuple to message, with
//! eviction ordered by expiry time.  DNS entries are inherently
//! time-bounded, so evicting the soonest-expiring entry first is both
//! simpler and more predictable than LRU here.

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dns_wire::types::{Message, Question};

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// The canonical question tuple a response is stored under.
///
/// The client identity is not part of the key; the per-client tier
/// scopes by cache instance instead.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
    dnssec_ok: bool,
    checking_disabled: bool,
}

impl CacheKey {
    /// Build the key for a question.  The name must already be in
    /// canonical lowercased form.  This server never serves DNSSEC,
    /// so the DO and CD components are always false.
    pub fn for_question(question: &Question) -> Self {
        Self {
            name: question.name.to_dotted_string(),
            qtype: question.qtype.into(),
            qclass: question.qclass.into(),
            dnssec_ok: false,
            checking_disabled: false,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    message: Message,
    expires_at: Instant,
}

/// A bounded TTL cache of response messages.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cached responses, indexed by question tuple.
    entries: HashMap<CacheKey, CachedResponse>,

    /// Priority queue of keys ordered by expiry time, soonest first.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    expiry_priority: PriorityQueue<CacheKey, Reverse<Instant>>,

    /// The maximum number of entries.  When an insert would exceed
    /// this, the soonest-expiring entry is evicted.
    capacity: usize,

    /// TTL to apply when a stored response has no better answer.
    default_ttl: Duration,
}

impl Cache {
    /// Create a new cache.
    ///
    /// Panics:
    ///
    /// - If called with a capacity of 0.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        assert!(capacity > 0, "cannot create a zero-size cache");

        Self {
            entries: HashMap::with_capacity(capacity),
            expiry_priority: PriorityQueue::with_capacity(capacity),
            capacity,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a response.  An expired entry is removed and treated
    /// as a miss.
    ///
    /// The returned message still carries the TTLs it was stored
    /// with: the caller must rewrite them against the returned expiry
    /// time before sending the message anywhere.
    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<(Message, Instant)> {
        let entry = self.entries.get(key)?;

        if entry.expires_at <= now {
            self.entries.remove(key);
            self.expiry_priority.remove(key);
            return None;
        }

        Some((entry.message.clone(), entry.expires_at))
    }

    /// Store a response.
    ///
    /// The entry lives for the smaller of the configured default TTL
    /// and the first answer's TTL.  Only the first answer is
    /// consulted, matching how this cache has always behaved.
    pub fn insert(&mut self, key: CacheKey, message: Message, now: Instant) {
        let mut ttl = self.default_ttl;
        if let Some(answer) = message.answers.first() {
            let answer_ttl = Duration::from_secs(answer.ttl.into());
            if answer_ttl < ttl {
                ttl = answer_ttl;
            }
        }

        let expires_at = now + ttl;

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_soonest_expiring();
        }

        self.expiry_priority.push(key.clone(), Reverse(expires_at));
        self.entries.insert(key, CachedResponse { message, expires_at });
    }

    /// Discard every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiry_priority.clear();
    }

    fn evict_soonest_expiring(&mut self) {
        if let Some((key, _)) = self.expiry_priority.pop() {
            self.entries.remove(&key);
        }
    }
}

/// A `Cache` which can be shared between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

impl SharedCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(Mutex::new(Cache::new(capacity, default_ttl))),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<(Message, Instant)> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get(key, Instant::now())
    }

    pub fn insert(&self, key: CacheKey, message: Message) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .insert(key, message, Instant::now());
    }

    pub fn clear(&self) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).clear();
    }

    pub fn default_ttl(&self) -> Duration {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).default_ttl()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The per-client cache tier: one `Cache` per client key, created
/// lazily.  The lock guards only the map of caches, each cache has
/// its own synchronisation.
#[derive(Debug)]
pub struct ClientCaches {
    caches: RwLock<HashMap<String, SharedCache>>,
    capacity: usize,
    default_ttl: Duration,
}

impl ClientCaches {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            capacity,
            default_ttl,
        }
    }

    /// The cache for a client, created if this client has not been
    /// seen before.
    pub fn for_client(&self, client_key: &str) -> SharedCache {
        if let Some(cache) = self
            .caches
            .read()
            .expect(MUTEX_POISON_MESSAGE)
            .get(client_key)
        {
            return cache.clone();
        }

        let mut caches = self.caches.write().expect(MUTEX_POISON_MESSAGE);
        caches
            .entry(client_key.to_string())
            .or_insert_with(|| SharedCache::new(self.capacity, self.default_ttl))
            .clone()
    }

    /// Drop every per-client cache.  Invoked on view reload; the
    /// global cache is left alone.
    pub fn clear(&self) {
        let mut caches = self.caches.write().expect(MUTEX_POISON_MESSAGE);
        *caches = HashMap::new();
    }
}

/// Rewrite the TTL of every answer in a cached message to the time
/// the entry has left to live.
pub fn rewrite_ttls(message: &mut Message, expires_at: Instant, now: Instant) {
    let remaining =
        u32::try_from(expires_at.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX);

    for rr in &mut message.answers {
        rr.ttl = remaining;
    }
}

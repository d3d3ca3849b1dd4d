use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Cached response for one (endpoint, query) pair
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: serde_json::Value,
    expires_at: Instant,
    endpoint: String,
}

/// Bounded TTL cache for read responses.
///
/// Eviction is insertion-ordered: when full, the oldest inserted key goes
/// first regardless of how recently it was read.
///
/// Every invalidation stamps the endpoint with a new generation. A read
/// records the generation it started under and may only be stored while that
/// generation is still current.
#[derive(Debug)]
pub struct RequestCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    max_entries: usize,
    default_ttl: Duration,
    generations: HashMap<String, u64>,
    cleared_at: u64,
    next_generation: u64,
}

/// Build the cache key for an endpoint and its query parameters.
///
/// Queries are ordered maps so the same parameters always yield the same key.
pub fn cache_key(endpoint: &str, query: &BTreeMap<String, String>) -> String {
    if query.is_empty() {
        return endpoint.to_string();
    }
    let params = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", endpoint, params)
}

impl RequestCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            default_ttl,
            generations: HashMap::new(),
            cleared_at: 0,
            next_generation: 0,
        }
    }

    /// Current generation of `endpoint`
    pub fn generation(&self, endpoint: &str) -> u64 {
        self.generations
            .get(endpoint)
            .copied()
            .unwrap_or(0)
            .max(self.cleared_at)
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return a live entry. Expired entries are removed on access.
    pub fn get(&mut self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.payload.clone()),
            Some(_) => {
                self.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: String, endpoint: &str, payload: serde_json::Value, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);

        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                expires_at,
                endpoint: endpoint.to_string(),
            },
        );
    }

    /// Store a read that began under `generation`. Returns false, storing
    /// nothing, if the endpoint was invalidated since.
    pub fn insert_if_current(
        &mut self,
        key: String,
        endpoint: &str,
        payload: serde_json::Value,
        ttl: Option<Duration>,
        generation: u64,
    ) -> bool {
        if self.generation(endpoint) != generation {
            return false;
        }
        self.insert(key, endpoint, payload, ttl);
        true
    }

    /// Drop every entry that belongs to `endpoint`, whatever its query.
    pub fn invalidate_endpoint(&mut self, endpoint: &str) -> usize {
        let generation = self.bump();
        self.generations.insert(endpoint.to_string(), generation);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.endpoint == endpoint)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn clear(&mut self) {
        self.cleared_at = self.bump();
        self.generations.clear();
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = cache_key("alerts", &query(&[("limit", "10"), ("order", "timestamp.desc")]));
        let b = cache_key("alerts", &query(&[("order", "timestamp.desc"), ("limit", "10")]));
        assert_eq!(a, b);
        assert_eq!(cache_key("alerts", &BTreeMap::new()), "alerts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let mut cache = RequestCache::new(10, Duration::from_secs(300));
        cache.insert("alerts".into(), "alerts", json!([1]), None);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("alerts"), Some(json!([1])));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("alerts"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = RequestCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), "a", json!(1), None);
        cache.insert("b".into(), "b", json!(2), None);
        // reading "a" does not protect it
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), "c", json!(3), None);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_endpoint_covers_all_queries() {
        let mut cache = RequestCache::new(10, Duration::from_secs(60));
        cache.insert(cache_key("alerts", &query(&[("limit", "5")])), "alerts", json!([]), None);
        cache.insert(cache_key("alerts", &query(&[("limit", "50")])), "alerts", json!([]), None);
        cache.insert("cameras".into(), "cameras", json!([]), None);

        assert_eq!(cache.invalidate_endpoint("alerts"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("cameras").is_some());
    }

    #[test]
    fn test_read_started_before_invalidation_is_not_stored() {
        let mut cache = RequestCache::new(10, Duration::from_secs(60));
        let before = cache.generation("alerts");
        let cameras = cache.generation("cameras");

        cache.invalidate_endpoint("alerts");

        assert!(!cache.insert_if_current("alerts".into(), "alerts", json!([1]), None, before));
        assert_eq!(cache.get("alerts"), None);
        // other endpoints are unaffected
        assert!(cache.insert_if_current("cameras".into(), "cameras", json!([]), None, cameras));

        let after = cache.generation("alerts");
        assert!(cache.insert_if_current("alerts".into(), "alerts", json!([2]), None, after));
        assert_eq!(cache.get("alerts"), Some(json!([2])));

        cache.clear();
        assert!(!cache.insert_if_current("cameras".into(), "cameras", json!([]), None, cameras));
    }
}

//! Query result caching for repeated agent invocations

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::agents::types::{AgentType, SearchOptions, SearchResult};
use crate::config::CacheConfig;

/// Cached result contents are trimmed to this many characters when
/// compression is enabled
const COMPRESSED_CONTENT_BUDGET: usize = 4096;

/// One cached snapshot of agent results
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Human-readable label used for pattern invalidation
    label: String,
    results: Vec<SearchResult>,
    /// Monotonic insertion order, used for oldest-first eviction
    sequence: u64,
    expires_at: Instant,
    approx_bytes: usize,
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub approx_bytes: usize,
}

/// Process-scoped cache of agent result sets with per-entry TTL
pub struct QueryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sequence: AtomicU64,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Compute the deterministic fingerprint for one agent invocation
    ///
    /// Only the option fields that affect results participate: max_results,
    /// min_relevance_score, and the (sorted) filters.
    pub fn generate_key(agent_type: AgentType, query: &str, options: &SearchOptions) -> String {
        let mut hasher = DefaultHasher::new();

        agent_type.to_string().hash(&mut hasher);
        normalise_query(query).hash(&mut hasher);
        options.max_results.hash(&mut hasher);
        // Floats hash via their rounded millis to keep equal inputs equal
        ((options.min_relevance_score * 1000.0) as u32).hash(&mut hasher);

        let mut filters: Vec<(&String, &String)> = options.filters.iter().collect();
        filters.sort();
        for (key, value) in filters {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }

        format!("{:x}", hasher.finish())
    }

    /// Label stored alongside an entry, matched by `invalidate` patterns
    pub fn entry_label(agent_type: AgentType, query: &str) -> String {
        format!("{}:{}", agent_type, normalise_query(query))
    }

    /// Get cached results if present and not expired
    pub fn get(&self, key: &str) -> Option<Vec<SearchResult>> {
        let now = Instant::now();

        {
            let entries = self.entries.read().expect("cache lock poisoned");
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > now {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("cache hit for {}", entry.label);
                    return Some(entry.results.clone());
                }
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        // Entry exists but expired: remove it and report a miss
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            if entry.expires_at <= now {
                entries.remove(key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result snapshot under the given key
    pub fn set(&self, key: String, label: String, mut results: Vec<SearchResult>) {
        if self.config.enable_compression {
            for result in &mut results {
                if result.content.len() > COMPRESSED_CONTENT_BUDGET {
                    let mut cut = COMPRESSED_CONTENT_BUDGET;
                    while !result.content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    result.content.truncate(cut);
                }
            }
        }

        let approx_bytes = approx_size(&results);
        let entry = CacheEntry {
            label,
            results,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            expires_at: Instant::now() + Duration::from_secs(self.config.default_duration_s),
            approx_bytes,
        };

        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(key, entry);
        self.enforce_limits(&mut entries);
    }

    /// Evict oldest entries until count and memory limits are respected
    fn enforce_limits(&self, entries: &mut HashMap<String, CacheEntry>) {
        let memory_limit = self.config.memory_limit_mb * 1024 * 1024;

        let over_limits = |entries: &HashMap<String, CacheEntry>| {
            entries.len() > self.config.max_entries
                || entries.values().map(|e| e.approx_bytes).sum::<usize>() > memory_limit
        };

        let mut evicted = 0;
        while over_limits(entries) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            info!("evicted {} cache entries over limits", evicted);
        }
    }

    /// Remove entries whose label contains the pattern; `*` clears all
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");

        let before = entries.len();
        if pattern == "*" {
            entries.clear();
        } else {
            entries.retain(|_, entry| !entry.label.contains(pattern));
        }
        let removed = before - entries.len();

        if removed > 0 {
            info!("invalidated {} cache entries matching '{}'", removed, pattern);
        }
        removed
    }

    /// Drop expired entries; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn stats(&self) -> QueryCacheStats {
        let entries = self.entries.read().expect("cache lock poisoned");
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        QueryCacheStats {
            entries: entries.len(),
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            approx_bytes: entries.values().map(|e| e.approx_bytes).sum(),
        }
    }
}

fn normalise_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn approx_size(results: &[SearchResult]) -> usize {
    results
        .iter()
        .map(|r| {
            r.id.len()
                + r.content.len()
                + r.source.source_name.len()
                + r.metadata
                    .iter()
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>()
                + 64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::ResultSource;

    fn sample_result(id: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            content: format!("content for {}", id),
            relevance_score: score,
            source: ResultSource {
                agent_type: AgentType::VectorSearch,
                source_name: "moto-specs".to_string(),
                document_id: None,
                url: None,
                page: None,
            },
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_key_stability() {
        let options = SearchOptions::default();

        let a = QueryCache::generate_key(AgentType::VectorSearch, "best sport bike", &options);
        let b = QueryCache::generate_key(AgentType::VectorSearch, "best sport bike", &options);
        assert_eq!(a, b, "equal inputs must produce equal keys");

        // Whitespace and case normalisation fold into the same key
        let c = QueryCache::generate_key(AgentType::VectorSearch, "  Best  Sport Bike ", &options);
        assert_eq!(a, c);

        let other_query =
            QueryCache::generate_key(AgentType::VectorSearch, "touring bike", &options);
        assert_ne!(a, other_query);

        let other_agent = QueryCache::generate_key(AgentType::PdfSearch, "best sport bike", &options);
        assert_ne!(a, other_agent);
    }

    #[test]
    fn test_key_sensitive_to_result_shaping_options() {
        let base = SearchOptions::default();
        let key = QueryCache::generate_key(AgentType::VectorSearch, "q", &base);

        let mut more_results = base.clone();
        more_results.max_results = 50;
        assert_ne!(
            key,
            QueryCache::generate_key(AgentType::VectorSearch, "q", &more_results)
        );

        let mut filtered = base.clone();
        filtered
            .filters
            .insert("make".to_string(), "Honda".to_string());
        assert_ne!(
            key,
            QueryCache::generate_key(AgentType::VectorSearch, "q", &filtered)
        );

        // Timeout does not affect results and must not affect the key
        let mut slow = base.clone();
        slow.timeout_s = 120;
        assert_eq!(
            key,
            QueryCache::generate_key(AgentType::VectorSearch, "q", &slow)
        );
    }

    #[test]
    fn test_set_get_and_ttl() {
        let mut config = CacheConfig::default();
        config.default_duration_s = 0;
        let expiring = QueryCache::new(config);

        let key = "k1".to_string();
        expiring.set(key.clone(), "label".to_string(), vec![sample_result("a", 0.9)]);
        // Zero TTL: entry expires immediately and reads as absent
        assert!(expiring.get(&key).is_none());

        let cache = QueryCache::new(CacheConfig::default());
        cache.set("k2".to_string(), "label".to_string(), vec![sample_result("a", 0.9)]);
        let cached = cache.get("k2").unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_invalidate_pattern_and_wildcard() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set(
            "k1".to_string(),
            QueryCache::entry_label(AgentType::VectorSearch, "honda specs"),
            vec![sample_result("a", 0.9)],
        );
        cache.set(
            "k2".to_string(),
            QueryCache::entry_label(AgentType::WebSearch, "honda news"),
            vec![sample_result("b", 0.8)],
        );
        cache.set(
            "k3".to_string(),
            QueryCache::entry_label(AgentType::VectorSearch, "yamaha specs"),
            vec![sample_result("c", 0.7)],
        );

        let removed = cache.invalidate("vector-search");
        assert_eq!(removed, 2);
        assert!(cache.get("k2").is_some());

        let removed = cache.invalidate("*");
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_eviction_over_max_entries() {
        let mut config = CacheConfig::default();
        config.max_entries = 2;
        let cache = QueryCache::new(config);

        cache.set("k1".to_string(), "l1".to_string(), vec![sample_result("a", 0.9)]);
        cache.set("k2".to_string(), "l2".to_string(), vec![sample_result("b", 0.9)]);
        cache.set("k3".to_string(), "l3".to_string(), vec![sample_result("c", 0.9)]);

        assert_eq!(cache.stats().entries, 2);
        // The oldest entry was evicted
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn test_compression_trims_content() {
        let mut config = CacheConfig::default();
        config.enable_compression = true;
        let cache = QueryCache::new(config);

        let mut result = sample_result("a", 0.9);
        result.content = "x".repeat(10_000);
        cache.set("k1".to_string(), "l1".to_string(), vec![result]);

        let cached = cache.get("k1").unwrap();
        assert_eq!(cached[0].content.len(), COMPRESSED_CONTENT_BUDGET);
    }

    #[test]
    fn test_hit_ratio() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set("k1".to_string(), "l1".to_string(), vec![sample_result("a", 0.9)]);

        cache.get("k1");
        cache.get("k1");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }
}

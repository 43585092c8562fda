//! TTS cache engine
//!
//! The speculative-synthesis coordinator. Duplicate submissions coalesce into
//! one background generation task per fingerprint; readers block on a
//! per-entry completion signal until the entry reaches a terminal state.
//! Entries are evicted by size at insertion time and by age from a background
//! cleanup loop. A segment mapping links a full reply's fingerprint to its
//! per-sentence fingerprints so the read path can answer by concatenation.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use tts_proxy_core::{wav, Fingerprint};

use crate::tts_client::TtsBackend;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct TtsCacheConfig {
    /// Maximum number of entries before oldest-10% eviction
    pub max_size: usize,
    /// Entry time-to-live
    pub ttl: Duration,
    /// Background cleanup interval
    pub cleanup_interval: Duration,
}

impl Default for TtsCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Entry lifecycle. Transitions only move forward:
/// `Pending -> Generating -> Completed | Failed`.
enum EntryState {
    Pending,
    Generating,
    Completed(Arc<[u8]>),
    Failed(String),
}

impl EntryState {
    fn name(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Generating => "generating",
            EntryState::Completed(_) => "completed",
            EntryState::Failed(_) => "failed",
        }
    }
}

struct CacheEntry {
    text: String,
    model: String,
    state: EntryState,
    created_at: Instant,
    completed_at: Option<Instant>,
    /// Completion signal: flipped to true exactly once, on the transition
    /// into a terminal state. Late subscribers see the flag immediately.
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

struct SegmentMapping {
    /// Truncated display text, for logs only
    display_text: String,
    segment_keys: Vec<Fingerprint>,
    created_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub completed_entries: usize,
    pub pending_entries: usize,
    pub generating_entries: usize,
    pub failed_entries: usize,
    pub segment_mappings: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub concat_hit_count: u64,
    pub hit_rate: f64,
}

/// Speculative TTS cache.
///
/// Lock ordering: the entry lock is acquired before the segment-map lock;
/// neither is ever held across an await point.
pub struct TtsCache {
    backend: Arc<dyn TtsBackend>,
    config: TtsCacheConfig,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    segment_map: Mutex<HashMap<Fingerprint, SegmentMapping>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    concat_hit_count: AtomicU64,
}

impl TtsCache {
    pub fn new(backend: Arc<dyn TtsBackend>, config: TtsCacheConfig) -> Self {
        Self {
            backend,
            config,
            entries: Mutex::new(HashMap::new()),
            segment_map: Mutex::new(HashMap::new()),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            concat_hit_count: AtomicU64::new(0),
        }
    }

    /// Start the periodic TTL cleanup task.
    ///
    /// Returns a shutdown sender; sending `true` stops the task.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let interval = cache.config.cleanup_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so cleanup runs on
            // the configured cadence.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        cache.cleanup_expired();
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Cache cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Drop every entry and mapping older than the TTL.
    fn cleanup_expired(&self) {
        let ttl = self.config.ttl;

        {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);
            let removed = before - entries.len();
            if removed > 0 {
                tracing::info!("Cleaned up {} expired cache entries", removed);
            }
        }

        {
            let mut segment_map = self.segment_map.lock();
            let before = segment_map.len();
            segment_map.retain(|_, mapping| mapping.created_at.elapsed() <= ttl);
            let removed = before - segment_map.len();
            if removed > 0 {
                tracing::info!("Cleaned up {} expired segment mappings", removed);
            }
        }
    }

    /// Evict the oldest 10% of entries once the table is full.
    fn evict_if_needed(entries: &mut HashMap<Fingerprint, CacheEntry>, max_size: usize) {
        if entries.len() < max_size {
            return;
        }

        let mut by_age: Vec<(Fingerprint, Instant)> = entries
            .iter()
            .map(|(key, entry)| (*key, entry.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);

        let to_remove = (entries.len() / 10).max(1);
        for (key, _) in by_age.into_iter().take(to_remove) {
            entries.remove(&key);
        }

        tracing::info!("Evicted {} cache entries due to size limit", to_remove);
    }

    /// Submit text for background synthesis.
    ///
    /// Coalesces: if an entry already exists for the fingerprint — whatever
    /// its state — nothing is re-enqueued. Returns the fingerprint either
    /// way.
    pub fn submit(self: &Arc<Self>, text: &str, model: &str) -> Fingerprint {
        let key = Fingerprint::new(model, text);

        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&key) {
                tracing::debug!("Cache entry already exists: {}...", key.short());
                return key;
            }

            Self::evict_if_needed(&mut entries, self.config.max_size);

            let (done_tx, done_rx) = watch::channel(false);
            entries.insert(
                key,
                CacheEntry {
                    text: text.to_string(),
                    model: model.to_string(),
                    state: EntryState::Pending,
                    created_at: Instant::now(),
                    completed_at: None,
                    done_tx,
                    done_rx,
                },
            );
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            cache.generate(key).await;
        });

        tracing::debug!(
            "Submitted TTS generation: {}..., text_len={}",
            key.short(),
            text.chars().count()
        );
        key
    }

    /// Submit a full reply and its segments, recording the mapping.
    ///
    /// Each non-empty segment is submitted individually; the mapping ties the
    /// full text's fingerprint to the ordered segment fingerprints. An
    /// existing mapping for the same fingerprint is overwritten.
    pub fn submit_with_segments(
        self: &Arc<Self>,
        full_text: &str,
        segments: &[String],
        model: &str,
    ) -> Fingerprint {
        let full_key = Fingerprint::new(model, full_text);

        let mut segment_keys = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if !segment.is_empty() {
                segment_keys.push(self.submit(segment, model));
            }
        }

        if segment_keys.is_empty() {
            tracing::warn!("No valid segments for full text: {}...", full_key.short());
            return full_key;
        }

        let display_text: String = if full_text.chars().count() > 100 {
            format!("{}...", full_text.chars().take(100).collect::<String>())
        } else {
            full_text.to_string()
        };

        let segment_count = segment_keys.len();
        self.segment_map.lock().insert(
            full_key,
            SegmentMapping {
                display_text,
                segment_keys,
                created_at: Instant::now(),
            },
        );

        tracing::info!(
            "Registered segment mapping: {}... -> {} segments",
            full_key.short(),
            segment_count
        );

        full_key
    }

    /// Background generation for one fingerprint.
    ///
    /// The lock is dropped for the duration of the upstream call; the result
    /// is committed only if the entry still exists (it may have been evicted
    /// mid-flight).
    async fn generate(self: Arc<Self>, key: Fingerprint) {
        let text = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.state = EntryState::Generating;
                    entry.text.clone()
                }
                None => return,
            }
        };

        match self.backend.synthesize(&text).await {
            Ok(audio) => {
                let audio_size = audio.len();
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(&key) {
                    let completed_at = Instant::now();
                    let generation_time = completed_at.duration_since(entry.created_at);
                    entry.state = EntryState::Completed(audio.into());
                    entry.completed_at = Some(completed_at);
                    let _ = entry.done_tx.send(true);

                    tracing::debug!(
                        "TTS generation completed: {}..., model={}, audio_size={}, time={:.2}s",
                        key.short(),
                        entry.model,
                        audio_size,
                        generation_time.as_secs_f64()
                    );
                }
            }
            Err(e) => {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(&key) {
                    entry.state = EntryState::Failed(e.to_string());
                    let _ = entry.done_tx.send(true);
                }
                tracing::error!("TTS generation failed: {}..., error={}", key.short(), e);
            }
        }
    }

    /// Get audio for a text, waiting on in-flight generation.
    ///
    /// Resolution order: segment mapping (concatenation), then the direct
    /// entry, then on-demand synthesis when `generate_if_missing` is set.
    /// Never errors: a failed or timed-out entry yields `None`.
    pub async fn get(
        self: &Arc<Self>,
        text: &str,
        model: &str,
        timeout: Duration,
        generate_if_missing: bool,
    ) -> Option<Arc<[u8]>> {
        let key = Fingerprint::new(model, text);

        let segment_keys = {
            self.segment_map
                .lock()
                .get(&key)
                .map(|mapping| mapping.segment_keys.clone())
        };

        if let Some(segment_keys) = segment_keys {
            tracing::info!(
                "Found segment mapping for {}..., concatenating {} segments",
                key.short(),
                segment_keys.len()
            );
            if let Some(audio) = self.get_concatenated(&segment_keys, timeout).await {
                self.concat_hit_count.fetch_add(1, Ordering::Relaxed);
                return Some(audio);
            }
            tracing::warn!("Segment concatenation failed for {}...", key.short());
        }

        let exists = self.entries.lock().contains_key(&key);
        if exists {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            if !generate_if_missing {
                return None;
            }
            tracing::debug!("Cache miss, generating on-demand: {}...", key.short());
            self.submit(text, model);
        }

        self.get_by_key(key, timeout).await
    }

    /// Get audio by fingerprint, waiting up to `timeout` for an in-flight
    /// generation. No synthesis fallback.
    pub async fn get_by_key(&self, key: Fingerprint, timeout: Duration) -> Option<Arc<[u8]>> {
        let mut done_rx = {
            let entries = self.entries.lock();
            let entry = entries.get(&key)?;
            match &entry.state {
                EntryState::Completed(audio) => return Some(audio.clone()),
                EntryState::Failed(_) => {
                    tracing::debug!("Returning None for failed entry: {}...", key.short());
                    return None;
                }
                _ => entry.done_rx.clone(),
            }
        };

        let wait_result = tokio::time::timeout(timeout, done_rx.wait_for(|done| *done)).await;
        match wait_result {
            Ok(Ok(_)) => {
                let entries = self.entries.lock();
                match entries.get(&key) {
                    Some(entry) => match &entry.state {
                        EntryState::Completed(audio) => Some(audio.clone()),
                        _ => None,
                    },
                    None => None,
                }
            }
            // Sender dropped: the entry was evicted mid-flight
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!("Timeout waiting for TTS generation: {}...", key.short());
                None
            }
        }
    }

    /// Gather each segment's audio in order and concatenate.
    ///
    /// Each segment gets the remaining share of the timeout budget, floored
    /// at one second. Any missing segment aborts the whole concatenation.
    async fn get_concatenated(
        &self,
        segment_keys: &[Fingerprint],
        timeout: Duration,
    ) -> Option<Arc<[u8]>> {
        let start = Instant::now();
        let mut parts: Vec<Arc<[u8]>> = Vec::with_capacity(segment_keys.len());

        for (i, key) in segment_keys.iter().enumerate() {
            let remaining = timeout
                .saturating_sub(start.elapsed())
                .max(Duration::from_secs(1));

            match self.get_by_key(*key, remaining).await {
                Some(audio) => parts.push(audio),
                None => {
                    tracing::warn!(
                        "Failed to get segment {}/{}: {}...",
                        i + 1,
                        segment_keys.len(),
                        key.short()
                    );
                    return None;
                }
            }
        }

        let result = wav::concatenate(&parts);
        if result.is_empty() {
            return None;
        }

        tracing::info!(
            "Concatenated {} segments, total size: {} bytes",
            parts.len(),
            result.len()
        );
        Some(result.into())
    }

    /// Drop all entries and segment mappings.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.segment_map.lock().clear();
        tracing::info!("Cache cleared");
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let total_entries = {
            let entries = self.entries.lock();
            for entry in entries.values() {
                *counts.entry(entry.state.name()).or_insert(0) += 1;
            }
            entries.len()
        };
        let segment_mappings = self.segment_map.lock().len();

        let hit_count = self.hit_count.load(Ordering::Relaxed);
        let miss_count = self.miss_count.load(Ordering::Relaxed);
        let total_requests = hit_count + miss_count;

        CacheStats {
            total_entries,
            completed_entries: counts.get("completed").copied().unwrap_or(0),
            pending_entries: counts.get("pending").copied().unwrap_or(0),
            generating_entries: counts.get("generating").copied().unwrap_or(0),
            failed_entries: counts.get("failed").copied().unwrap_or(0),
            segment_mappings,
            hit_count,
            miss_count,
            concat_hit_count: self.concat_hit_count.load(Ordering::Relaxed),
            hit_rate: if total_requests > 0 {
                hit_count as f64 / total_requests as f64
            } else {
                0.0
            },
        }
    }

    /// Display text of a registered mapping, if any (diagnostics only).
    pub fn segment_display_text(&self, key: Fingerprint) -> Option<String> {
        self.segment_map
            .lock()
            .get(&key)
            .map(|mapping| mapping.display_text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Backend returning the text itself as "audio", with optional delay and
    /// failure injection. Counts synthesis calls for coalescing checks.
    struct FakeBackend {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TtsBackend for FakeBackend {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, crate::TtsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(crate::TtsError::UpstreamExhausted("boom".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    fn cache_with(backend: Arc<FakeBackend>, config: TtsCacheConfig) -> Arc<TtsCache> {
        Arc::new(TtsCache::new(backend, config))
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        cache.submit("你好。", "m1");
        let audio = cache
            .get("你好。", "m1", Duration::from_secs(5), false)
            .await
            .expect("audio");
        assert_eq!(&audio[..], "你好。".as_bytes());
        assert_eq!(backend.call_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.completed_entries, 1);
        assert_eq!(stats.hit_count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submits_coalesce() {
        let backend = FakeBackend::slow(Duration::from_millis(50));
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let k1 = cache.submit("同一句话。", "m1");
        let k2 = cache.submit("同一句话。", "m1");
        assert_eq!(k1, k2);

        let a = cache.get_by_key(k1, Duration::from_secs(5)).await;
        let b = cache.get_by_key(k2, Duration::from_secs(5)).await;
        assert_eq!(a.as_deref(), b.as_deref());
        assert!(a.is_some());

        // One entry, one generation task
        assert_eq!(backend.call_count(), 1);
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_readers_released() {
        let backend = FakeBackend::slow(Duration::from_millis(50));
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let key = cache.submit("广播。", "m1");
        let c1 = Arc::clone(&cache);
        let c2 = Arc::clone(&cache);
        let (a, b) = tokio::join!(
            c1.get_by_key(key, Duration::from_secs(5)),
            c2.get_by_key(key, Duration::from_secs(5)),
        );
        assert!(a.is_some());
        assert_eq!(a.as_deref(), b.as_deref());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_miss_without_generation() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let result = cache
            .get("没有这条。", "m1", Duration::from_secs(1), false)
            .await;
        assert!(result.is_none());
        assert_eq!(backend.call_count(), 0);
        assert_eq!(cache.stats().miss_count, 1);
    }

    #[tokio::test]
    async fn test_miss_with_on_demand_generation() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let audio = cache
            .get("现场生成。", "m1", Duration::from_secs(5), true)
            .await;
        assert!(audio.is_some());
        assert_eq!(backend.call_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 0);
    }

    #[tokio::test]
    async fn test_failed_entry_is_sticky() {
        let backend = FakeBackend::failing();
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let key = cache.submit("注定失败。", "m1");
        assert!(cache.get_by_key(key, Duration::from_secs(5)).await.is_none());
        assert_eq!(cache.stats().failed_entries, 1);

        // A later get does not re-enqueue; submit on the same text is a no-op
        let again = cache
            .get("注定失败。", "m1", Duration::from_secs(1), true)
            .await;
        assert!(again.is_none());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_reader_timeout_keeps_entry() {
        let backend = FakeBackend::slow(Duration::from_millis(200));
        let cache = cache_with(backend.clone(), TtsCacheConfig::default());

        let key = cache.submit("慢慢来。", "m1");
        // First reader gives up before generation finishes
        assert!(cache
            .get_by_key(key, Duration::from_millis(20))
            .await
            .is_none());

        // The generation task was not cancelled; a patient reader gets audio
        let audio = cache.get_by_key(key, Duration::from_secs(5)).await;
        assert!(audio.is_some());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_size_eviction() {
        let backend = FakeBackend::new();
        let cache = cache_with(
            backend.clone(),
            TtsCacheConfig {
                max_size: 10,
                ..Default::default()
            },
        );

        cache.submit("句子0。", "m1");
        // Make the first entry strictly oldest by creation timestamp
        tokio::time::sleep(Duration::from_millis(5)).await;
        for i in 1..10 {
            cache.submit(&format!("句子{}。", i), "m1");
        }
        assert_eq!(cache.stats().total_entries, 10);

        // Hitting capacity evicts the oldest 10% before inserting
        cache.submit("第十一句。", "m1");
        assert_eq!(cache.stats().total_entries, 10);

        // The oldest entry is gone; the new one is present
        assert!(cache
            .get("句子0。", "m1", Duration::from_millis(10), false)
            .await
            .is_none());
        assert!(cache
            .get("第十一句。", "m1", Duration::from_secs(5), false)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend, TtsCacheConfig::default());

        cache.submit("一。二。", "m1");
        cache.submit_with_segments("一。二。", &["一。".to_string(), "二。".to_string()], "m1");
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.segment_mappings, 0);
    }

    #[tokio::test]
    async fn test_segment_mapping_overwritten() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend, TtsCacheConfig::default());

        let key =
            cache.submit_with_segments("全文。", &["全文。".to_string()], "m1");
        cache.submit_with_segments("全文。", &["全".to_string(), "文。".to_string()], "m1");

        assert_eq!(cache.stats().segment_mappings, 1);
        assert_eq!(
            cache.segment_display_text(key).as_deref(),
            Some("全文。")
        );
    }

    #[tokio::test]
    async fn test_empty_segments_skip_mapping() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend, TtsCacheConfig::default());

        cache.submit_with_segments("全文。", &["  ".to_string(), String::new()], "m1");
        assert_eq!(cache.stats().segment_mappings, 0);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_display_text_truncated() {
        let backend = FakeBackend::new();
        let cache = cache_with(backend, TtsCacheConfig::default());

        let long_text = "长".repeat(150);
        let key = cache.submit_with_segments(
            &long_text,
            &[format!("{}。", "长".repeat(10))],
            "m1",
        );

        let display = cache.segment_display_text(key).unwrap();
        assert_eq!(display.chars().count(), 103); // 100 chars + "..."
        assert!(display.ends_with("..."));
    }

    #[tokio::test]
    async fn test_cleanup_task_expires_entries() {
        let backend = FakeBackend::new();
        let cache = cache_with(
            backend,
            TtsCacheConfig {
                ttl: Duration::ZERO,
                cleanup_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        cache.submit("很快过期。", "m1");
        cache.submit_with_segments("很快过期。", &["很快过期。".to_string()], "m1");

        let shutdown = cache.start_cleanup_task();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.segment_mappings, 0);

        let _ = shutdown.send(true);
    }
}

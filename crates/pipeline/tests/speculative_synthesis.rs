//! Integration tests for the speculative synthesis flow
//! (splitter -> cache -> segment concatenation)
//!
//! A local backend stands in for the TTS upstream and renders every text as
//! one second of 22.05 kHz mono 16-bit audio.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tts_proxy_core::wav;
use tts_proxy_pipeline::{StreamingSplitter, TtsBackend, TtsCache, TtsCacheConfig, TtsError};

const SAMPLE_RATE: u32 = 22050;

/// One second of silence as a well-formed mono 16-bit WAV.
fn one_second_wav() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..SAMPLE_RATE {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

struct WavBackend {
    calls: AtomicUsize,
}

impl WavBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TtsBackend for WavBackend {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, TtsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(one_second_wav())
    }
}

#[tokio::test]
async fn test_segment_concatenation_round_trip() {
    let backend = WavBackend::new();
    let cache = Arc::new(TtsCache::new(backend.clone(), TtsCacheConfig::default()));

    let segments = vec!["第一句话。".to_string(), "第二句话。".to_string()];
    cache.submit_with_segments("第一句话。第二句话。", &segments, "m1");

    let audio = cache
        .get("第一句话。第二句话。", "m1", Duration::from_secs(10), true)
        .await
        .expect("concatenated audio");

    // Two one-second segments stitched under a single fresh header
    let info = wav::parse_header(&audio).expect("valid wav");
    let per_segment_data = (SAMPLE_RATE * 2) as usize;
    assert_eq!(info.data_size, per_segment_data * 2);
    assert_eq!(info.format.sample_rate, SAMPLE_RATE);
    assert_eq!(info.format.num_channels, 1);
    assert_eq!(info.format.bits_per_sample, 16);

    let stats = cache.stats();
    assert_eq!(stats.concat_hit_count, 1);
    // Only the two segments were synthesized; the full text never was
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stats.total_entries, 2);
}

#[tokio::test]
async fn test_full_reply_falls_back_to_direct_synthesis() {
    let backend = WavBackend::new();
    let cache = Arc::new(TtsCache::new(backend.clone(), TtsCacheConfig::default()));

    // No mapping registered: a speech request for the full text misses and
    // synthesizes on demand.
    let audio = cache
        .get("没有预先注册的文本。", "m1", Duration::from_secs(10), true)
        .await
        .expect("direct audio");

    let info = wav::parse_header(&audio).expect("valid wav");
    assert_eq!(info.data_size, (SAMPLE_RATE * 2) as usize);
    assert_eq!(cache.stats().miss_count, 1);
    assert_eq!(cache.stats().concat_hit_count, 0);
}

#[tokio::test]
async fn test_splitter_feeds_cache_in_order() {
    let backend = WavBackend::new();
    let cache = Arc::new(TtsCache::new(backend.clone(), TtsCacheConfig::default()));
    let mut splitter = StreamingSplitter::default();

    // Simulate an LLM stream arriving in small fragments
    let fragments = ["今天天气", "真不错。我们", "出去走走吧。", "好的"];
    let mut full_text = String::new();
    let mut segments: Vec<String> = Vec::new();

    for fragment in fragments {
        full_text.push_str(fragment);
        for sentence in splitter.feed(fragment) {
            cache.submit(&sentence, "m1");
            segments.push(sentence);
        }
    }
    if let Some(remaining) = splitter.flush() {
        cache.submit(&remaining, "m1");
        segments.push(remaining);
    }

    assert_eq!(
        segments,
        vec!["今天天气真不错。", "我们出去走走吧。", "好的"]
    );

    cache.submit_with_segments(&full_text, &segments, "m1");

    let audio = cache
        .get(&full_text, "m1", Duration::from_secs(10), true)
        .await
        .expect("concatenated audio");

    let info = wav::parse_header(&audio).expect("valid wav");
    assert_eq!(info.data_size, (SAMPLE_RATE * 2) as usize * 3);
    // Sentences were cached during streaming; the speech request added none
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

/// Backend that fails for one specific text.
struct SelectiveBackend {
    poison: String,
}

#[async_trait]
impl TtsBackend for SelectiveBackend {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        if text == self.poison {
            return Err(TtsError::UpstreamExhausted("HTTP 500: boom".to_string()));
        }
        Ok(one_second_wav())
    }
}

#[tokio::test]
async fn test_failed_segment_aborts_concatenation() {
    let backend = Arc::new(SelectiveBackend {
        poison: "坏句子。".to_string(),
    });
    let cache = Arc::new(TtsCache::new(backend, TtsCacheConfig::default()));

    let segments = vec!["好句子。".to_string(), "坏句子。".to_string()];
    cache.submit_with_segments("好句子。坏句子。", &segments, "m1");

    // Concatenation aborts on the failed segment; the fall-through direct
    // entry does not exist and on-miss synthesis of the full text succeeds.
    let audio = cache
        .get("好句子。坏句子。", "m1", Duration::from_secs(10), true)
        .await;
    assert!(audio.is_some());

    let stats = cache.stats();
    assert_eq!(stats.concat_hit_count, 0);
    assert_eq!(stats.failed_entries, 1);
    assert_eq!(stats.miss_count, 1);
}

#[tokio::test]
async fn test_get_by_key_without_fallback() {
    let backend = WavBackend::new();
    let cache = Arc::new(TtsCache::new(backend, TtsCacheConfig::default()));

    let key = cache.submit("预先提交。", "m1");
    assert!(cache
        .get_by_key(key, Duration::from_secs(10))
        .await
        .is_some());

    let missing = tts_proxy_core::Fingerprint::new("m1", "不存在。");
    assert!(cache
        .get_by_key(missing, Duration::from_secs(1))
        .await
        .is_none());
}

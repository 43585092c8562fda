//! Round-robin token rotation
//!
//! Dispenses upstream API tokens in rotation, tracking per-token health.
//! A token that fails too many times in a row is pulled out of rotation and
//! re-admitted after a recovery interval, or immediately if every token in
//! the pool has been disabled.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::TtsError;

/// Consecutive failures after which a token is pulled from rotation.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// How long a disabled token stays out of rotation.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(300);

/// Per-token health record.
#[derive(Debug)]
struct TokenRecord {
    token: String,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    last_used_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    is_available: bool,
}

impl TokenRecord {
    fn new(token: String) -> Self {
        Self {
            token,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            last_used_at: None,
            last_failure_at: None,
            is_available: true,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Masked form for stats output: first 4 + last 4 characters.
    fn masked(&self) -> String {
        if self.token.len() <= 8 {
            return "****".to_string();
        }
        match (
            self.token.get(..4),
            self.token.get(self.token.len() - 4..),
        ) {
            (Some(head), Some(tail)) => format!("{}...{}", head, tail),
            _ => "****".to_string(),
        }
    }

    fn mark_selected(&mut self) {
        self.last_used_at = Some(Instant::now());
        self.total_requests += 1;
    }
}

struct RotatorInner {
    records: Vec<TokenRecord>,
    cursor: usize,
}

/// Round-robin token dispenser with circuit breaking.
pub struct TokenRotator {
    inner: Mutex<RotatorInner>,
    max_consecutive_failures: u32,
    recovery_interval: Duration,
}

impl TokenRotator {
    /// Create a rotator over a non-empty token pool.
    pub fn new(tokens: Vec<String>) -> Result<Self, TtsError> {
        Self::with_limits(tokens, MAX_CONSECUTIVE_FAILURES, RECOVERY_INTERVAL)
    }

    /// Create a rotator with custom circuit-breaking limits.
    pub fn with_limits(
        tokens: Vec<String>,
        max_consecutive_failures: u32,
        recovery_interval: Duration,
    ) -> Result<Self, TtsError> {
        if tokens.is_empty() {
            return Err(TtsError::EmptyTokenPool);
        }

        tracing::info!("TokenRotator initialized with {} tokens", tokens.len());

        Ok(Self {
            inner: Mutex::new(RotatorInner {
                records: tokens.into_iter().map(TokenRecord::new).collect(),
                cursor: 0,
            }),
            max_consecutive_failures,
            recovery_interval,
        })
    }

    /// Get the next usable token.
    ///
    /// Scans forward from the rotation cursor, skipping disabled tokens
    /// unless their recovery interval has elapsed. If every token is
    /// disabled, the whole pool is reset and the first token is returned.
    pub fn next_token(&self) -> String {
        let mut inner = self.inner.lock();
        let pool_size = inner.records.len();

        for _ in 0..pool_size {
            let index = inner.cursor;
            inner.cursor = (inner.cursor + 1) % pool_size;

            let recovery_interval = self.recovery_interval;
            let record = &mut inner.records[index];

            if record.is_available {
                record.mark_selected();
                return record.token.clone();
            }

            if let Some(failed_at) = record.last_failure_at {
                let elapsed = failed_at.elapsed();
                if elapsed >= recovery_interval {
                    tracing::info!(
                        "Token {} recovered after {:.0}s, re-enabling",
                        record.masked(),
                        elapsed.as_secs_f64()
                    );
                    record.is_available = true;
                    record.consecutive_failures = 0;
                    record.mark_selected();
                    return record.token.clone();
                }
            }
        }

        // Every token is disabled: forced recovery.
        tracing::warn!("All tokens unavailable, forcing reset");
        for record in inner.records.iter_mut() {
            record.is_available = true;
            record.consecutive_failures = 0;
        }
        inner.cursor = 1 % pool_size;
        let record = &mut inner.records[0];
        record.mark_selected();
        record.token.clone()
    }

    /// Record a successful request for `token`.
    pub fn report_success(&self, token: &str) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.iter_mut().find(|r| r.token == token) else {
            return;
        };

        record.successful_requests += 1;
        record.consecutive_failures = 0;
        record.is_available = true;

        tracing::debug!(
            "Token {} success, total: {}",
            record.masked(),
            record.successful_requests
        );
    }

    /// Record a failed request for `token`, disabling it after too many
    /// consecutive failures.
    pub fn report_failure(&self, token: &str, error: Option<&str>) {
        let max_failures = self.max_consecutive_failures;
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.iter_mut().find(|r| r.token == token) else {
            return;
        };

        record.failed_requests += 1;
        record.consecutive_failures += 1;
        record.last_failure_at = Some(Instant::now());

        if record.consecutive_failures >= max_failures {
            record.is_available = false;
            tracing::warn!(
                "Token {} disabled after {} consecutive failures{}",
                record.masked(),
                record.consecutive_failures,
                error.map(|e| format!(": {}", e)).unwrap_or_default()
            );
        } else {
            tracing::debug!(
                "Token {} failure ({}/{}){}",
                record.masked(),
                record.consecutive_failures,
                max_failures,
                error.map(|e| format!(": {}", e)).unwrap_or_default()
            );
        }
    }

    /// Aggregate statistics with masked tokens.
    pub fn stats(&self) -> RotatorStats {
        let inner = self.inner.lock();

        let total_requests: u64 = inner.records.iter().map(|r| r.total_requests).sum();
        let successful_requests: u64 = inner.records.iter().map(|r| r.successful_requests).sum();
        let failed_requests: u64 = inner.records.iter().map(|r| r.failed_requests).sum();

        RotatorStats {
            total_tokens: inner.records.len(),
            available_tokens: inner.records.iter().filter(|r| r.is_available).count(),
            total_requests,
            successful_requests,
            failed_requests,
            success_rate: if total_requests > 0 {
                successful_requests as f64 / total_requests as f64
            } else {
                0.0
            },
            tokens: inner
                .records
                .iter()
                .map(|r| TokenStatsSnapshot {
                    token: r.masked(),
                    is_available: r.is_available,
                    total_requests: r.total_requests,
                    successful_requests: r.successful_requests,
                    failed_requests: r.failed_requests,
                    consecutive_failures: r.consecutive_failures,
                    success_rate: r.success_rate(),
                })
                .collect(),
        }
    }
}

/// Rotator-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RotatorStats {
    pub total_tokens: usize,
    pub available_tokens: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub tokens: Vec<TokenStatsSnapshot>,
}

/// Per-token statistics with the secret masked.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatsSnapshot {
    pub token: String,
    pub is_available: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
}

//! Background cache cleanup
//!
//! Periodically expires content bodies and thumbnails whose mtime is older
//! than the configured expiration. Eviction of entries still tracked by the
//! metadata store is the composition root's job; this task only ages out
//! on-disk objects.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{ContentCache, ThumbnailCache};

/// Owns the periodic expiry sweep.
pub struct CacheCleaner {
    cache: Arc<ContentCache>,
    thumbs: Arc<ThumbnailCache>,
    max_age: Duration,
    interval: Duration,
}

impl CacheCleaner {
    pub fn new(
        cache: Arc<ContentCache>,
        thumbs: Arc<ThumbnailCache>,
        max_age: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            thumbs,
            max_age,
            interval,
        }
    }

    /// Runs one sweep immediately.
    pub fn sweep_once(&self) -> (u64, u64) {
        let content = self.cache.sweep_expired(self.max_age).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Content expiry sweep failed");
            0
        });
        let thumbs = self.thumbs.sweep_expired(self.max_age).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Thumbnail expiry sweep failed");
            0
        });
        if content + thumbs > 0 {
            tracing::info!(content, thumbs, "Expired stale cache objects");
        }
        (content, thumbs)
    }

    /// Sweeps on a ticker until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Cache cleaner starting"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Cache cleaner stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once();
                }
            }
        }
    }
}

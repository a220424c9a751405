//! Cache-sync gate.

use crate::watch::DeploymentCache;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often the gate re-checks the cache.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait until `cache` has completed its initial listing.
///
/// Returns `true` once it has, or `false` if `stop` is cancelled first.
pub async fn wait_for_sync(cache: &dyn DeploymentCache, stop: &CancellationToken) -> bool {
    let mut ticker = tokio::time::interval(SYNC_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if cache.has_synced() {
            return true;
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => return false,
            _ = ticker.tick() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCache;
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_immediately_when_synced() {
        let cache = MockCache::synced();
        assert!(wait_for_sync(&cache, &CancellationToken::new()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_cache_to_catch_up() {
        let cache = Arc::new(MockCache::new());
        let stop = CancellationToken::new();

        let flip = Arc::clone(&cache);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            flip.set_synced(true);
        });

        let started = tokio::time::Instant::now();
        assert!(wait_for_sync(cache.as_ref(), &stop).await);
        assert!(started.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_stopped() {
        let cache = MockCache::new();
        let stop = CancellationToken::new();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert!(!wait_for_sync(&cache, &stop).await);
    }

    #[tokio::test]
    async fn already_stopped_and_unsynced_is_false() {
        let cache = MockCache::new();
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!wait_for_sync(&cache, &stop).await);
    }
}

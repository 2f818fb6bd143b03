use crate::abuse::RateLimiter;
use crate::captcha::CaptchaStore;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn a background task that clears every outstanding captcha challenge
/// each `interval`, regardless of age. Callers caught by a sweep just get a
/// new challenge on their next page load.
pub fn spawn_captcha_sweeper(captchas: CaptchaStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let cleared = captchas.sweep().await;
            if cleared > 0 {
                tracing::debug!(cleared, "Swept captcha challenges");
            }
        }
    })
}

/// Spawn a background task that drops stale rate-limit buckets
pub fn spawn_rate_limit_cleanup(limiter: RateLimiter) -> JoinHandle<()> {
    tokio::spawn(async move {
        // interval() panics on a zero period
        let period = (limiter.window() * 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let dropped = limiter.cleanup().await;
            if dropped > 0 {
                tracing::debug!(dropped, "Dropped stale rate-limit entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::FixedChallengeGenerator;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_on_interval() {
        let store = CaptchaStore::new(Arc::new(FixedChallengeGenerator::new("abc")));
        store.issue(None, "tok").await.unwrap();

        let handle = spawn_captcha_sweeper(store.clone(), Duration::from_secs(1200));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.outstanding().await, 1);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(store.outstanding().await, 0);

        handle.abort();
    }
}

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry an idempotent async operation with exponential backoff and jitter.
/// Always runs the operation at least once, even when `attempts` is 0.
pub async fn retry_idempotent<F, Fut, T, E>(attempts: u8, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u8;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }

                let base_delay_ms = 50 * (2_u64.pow((attempt - 1) as u32));
                let jitter = rand::thread_rng().gen_range(0..=base_delay_ms / 2);
                let delay_ms = (base_delay_ms + jitter).min(5_000);

                tracing::debug!(
                    "attempt {} failed, waiting {}ms before retry",
                    attempt,
                    delay_ms
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_idempotent(5, || {
            let c = counter_clone.clone();
            async move {
                let count = c.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("failed")
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let result: Result<(), &str> = retry_idempotent(3, || async { Err("always fails") }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), &str> = retry_idempotent(0, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("fails")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

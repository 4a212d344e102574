use std::time::Duration;

/// Exponential backoff with ±20% jitter, capped at `max_ms`.
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let ms = initial_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_delay(0, 100, 10_000).as_millis();
            assert!((80..=120).contains(&first));
            let capped = backoff_delay(20, 100, 10_000).as_millis();
            assert!((8_000..=12_000).contains(&capped));
        }
    }
}

use rand::Rng;
use std::time::Duration;

/// Doubling reconnect delay with a ceiling and optional random jitter
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
    max_retries: Option<u32>,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    /// `max_retries: None` retries until the caller gives up (stream reconnects)
    pub fn new(initial_ms: u64, max_ms: u64, jitter_ms: u64, max_retries: Option<u32>) -> Self {
        Self {
            initial_delay_ms: initial_ms.max(1),
            max_delay_ms: max_ms.max(initial_ms.max(1)),
            jitter_ms,
            max_retries,
            current_attempt: 0,
        }
    }

    /// Delay for the current attempt without jitter
    pub fn base_delay(&self) -> Duration {
        let factor = 2_u64.saturating_pow(self.current_attempt.min(32));
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Advance one attempt and return the jittered delay to wait
    pub fn next_delay(&mut self) -> Result<Duration, MaxRetriesExceeded> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return Err(MaxRetriesExceeded);
            }
        }

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        let delay = self.base_delay() + Duration::from_millis(jitter);
        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(delay)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

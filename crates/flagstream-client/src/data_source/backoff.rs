//! Reconnect backoff for the streaming data source.

use std::time::{Duration, Instant};

use rand::Rng;

const MAX_DELAY: Duration = Duration::from_secs(30);
/// A connection that stayed up at least this long counts as healthy, and
/// the next failure starts from the base delay again.
const RESET_AFTER: Duration = Duration::from_secs(60);

/// Exponential backoff with jitter: `base * 2^n` capped at 30 s, with up to
/// half the delay subtracted at random so reconnecting clients spread out.
pub(crate) struct Backoff {
    base: Duration,
    attempt: u32,
    connection_started: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(base: Duration) -> Self {
        Self {
            base,
            attempt: 0,
            connection_started: None,
        }
    }

    /// Mark a connection as established; the clock for the reset rule
    /// starts now.
    pub(crate) fn note_connected(&mut self) {
        self.connection_started = Some(Instant::now());
    }

    /// Compute the delay before the next attempt after a failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        if let Some(started) = self.connection_started.take() {
            if started.elapsed() >= RESET_AFTER {
                self.attempt = 0;
            }
        }
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self
            .base
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(MAX_DELAY);
        jitter(delay)
    }
}

fn jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    if half.is_zero() {
        return delay;
    }
    let cut = rand::thread_rng().gen_range(Duration::ZERO..half);
    delay - cut
}

//! Token-bucket rate limiter for pacing outbound sends.
//!
//! This is the *local* brake: it bounds burst and sustained send rate inside
//! one process. The persisted throttle controller (`crate::throttle`) is the
//! *shared* knob that decides what rate this limiter should converge to; the
//! dispatch governor resyncs the two after every batch.
//!
//! # Behavior
//!
//! - Capacity equals the configured MPS; tokens refill continuously,
//!   proportional to elapsed time, capped at capacity
//! - `acquire()` suspends the caller until a token is available
//! - Rate updates are validated against `[min_mps, max_mps]` and preserve
//!   the minimum of the old token count and the new capacity
//! - A background task drives the refill; `stop()` is idempotent

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::REFILL_TICK;
use crate::error_handling::ConfigError;

struct BucketState {
    tokens: f64,
    mps: u32,
}

/// Async token bucket with a dynamically updatable rate.
///
/// Safe for concurrent `acquire()` from all dispatch workers; waiting is a
/// suspension on a [`Notify`], not a spin.
pub struct TokenBucketLimiter {
    state: Arc<Mutex<BucketState>>,
    notify: Arc<Notify>,
    min_mps: u32,
    max_mps: u32,
    shutdown: CancellationToken,
}

impl TokenBucketLimiter {
    /// Creates a limiter at `mps` with a full bucket and starts the refill
    /// task.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfBounds`] if `mps` lies outside
    /// `[min_mps, max_mps]`.
    pub fn new(mps: u32, min_mps: u32, max_mps: u32) -> Result<Self, ConfigError> {
        validate_rate(mps, min_mps, max_mps)?;

        let state = Arc::new(Mutex::new(BucketState {
            tokens: mps as f64,
            mps,
        }));
        let notify = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let refill_state = Arc::clone(&state);
        let refill_notify = Arc::clone(&notify);
        let refill_shutdown = shutdown.clone();
        let mut ticker = interval(REFILL_TICK);
        tokio::spawn(async move {
            let mut last_time = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = tokio::time::Instant::now();
                        let elapsed = now.duration_since(last_time);
                        last_time = now;

                        let has_token = {
                            let mut state = refill_state
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            let capacity = state.mps as f64;
                            state.tokens =
                                (state.tokens + state.mps as f64 * elapsed.as_secs_f64())
                                    .min(capacity);
                            state.tokens >= 1.0
                        };
                        if has_token {
                            refill_notify.notify_waiters();
                        }
                    }
                    _ = refill_shutdown.cancelled() => {
                        log::debug!("Token bucket refill task shutting down");
                        break;
                    }
                }
            }
        });

        Ok(TokenBucketLimiter {
            state,
            notify,
            min_mps,
            max_mps,
            shutdown,
        })
    }

    /// Waits until a token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a refill between the
            // check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
            }

            notified.await;
        }
    }

    /// Refills the bucket to capacity immediately.
    pub fn reset(&self) {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.tokens = state.mps as f64;
        }
        self.notify.notify_waiters();
    }

    /// Returns the floored current token count.
    pub fn tokens_available(&self) -> u32 {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.tokens.floor() as u32
    }

    /// Returns the current rate (capacity) in MPS.
    pub fn current_rate(&self) -> u32 {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.mps
    }

    /// Changes capacity and refill rate atomically.
    ///
    /// The stored token count becomes the minimum of the old count and the
    /// new capacity, so lowering the rate also sheds accumulated burst.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfBounds`] and leaves prior state untouched
    /// if `mps` lies outside `[min_mps, max_mps]`.
    pub fn update_rate(&self, mps: u32) -> Result<(), ConfigError> {
        validate_rate(mps, self.min_mps, self.max_mps)?;
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.mps = mps;
            state.tokens = state.tokens.min(mps as f64);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Halts the background refill task. Safe to call multiple times.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate_rate(mps: u32, min_mps: u32, max_mps: u32) -> Result<(), ConfigError> {
    if mps < min_mps || mps > max_mps {
        return Err(ConfigError::OutOfBounds {
            field: "mps",
            value: mps as i64,
            min: min_mps as i64,
            max: max_mps as i64,
        });
    }
    Ok(())
}

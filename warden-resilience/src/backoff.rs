//! Backoff strategies for retries and reconnects

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed,

    /// delay = initial_delay * attempt
    Linear,

    /// delay = initial_delay * base^(attempt-1)
    Exponential {
        /// 2.0 doubles the delay on every attempt
        base: f64,
    },
}

/// Stateless delay calculator
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffCalculator {
    pub fn new(
        strategy: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
        jitter: bool,
    ) -> Self {
        Self {
            strategy,
            initial_delay,
            max_delay,
            jitter,
        }
    }

    /// Doubling delay starting at `base`, capped at `max`
    pub fn doubling(base: Duration, max: Duration) -> Self {
        Self::new(BackoffStrategy::Exponential { base: 2.0 }, base, max, false)
    }

    /// Delay before attempt `attempt` (1-indexed), never above the cap
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt).min(self.max_delay);

        if self.jitter {
            // ±20%, then re-capped
            let factor = rand::thread_rng().gen_range(0.8..1.2);
            Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
        } else {
            delay
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match &self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self
                .initial_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay),
            BackoffStrategy::Exponential { base } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.initial_delay.as_secs_f64() * base.powi(exponent);
                if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.max_delay
                }
            }
        }
    }
}

/// Backoff with an attempt counter that resets on success
#[derive(Debug, Clone)]
pub struct Backoff {
    calculator: BackoffCalculator,
    attempt: u32,
}

impl Backoff {
    pub fn new(calculator: BackoffCalculator) -> Self {
        Self {
            calculator,
            attempt: 0,
        }
    }

    /// Delay the next attempt has to wait; advances the counter
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.calculator.calculate_delay(self.attempt)
    }

    /// Delay the next attempt would wait, without advancing
    pub fn peek_delay(&self) -> Duration {
        self.calculator.calculate_delay(self.attempt.saturating_add(1))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

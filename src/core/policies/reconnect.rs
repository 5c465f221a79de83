// src/core/policies/reconnect.rs

//! Reconnection backoff. A policy mints one schedule per reconnection
//! episode; the schedule owns the attempt counter.

use rand::Rng;
use std::time::Duration;

/// Produces the delay before the next reconnection attempt.
pub trait ReconnectionSchedule: Send {
    fn next_delay(&mut self) -> Duration;
}

/// The reconnection contract.
pub trait ReconnectionPolicy: Send + Sync {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Exponential backoff from `base` to `cap`, with ±15% jitter so a fleet of
/// pools does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialReconnection {
    pub base: Duration,
    pub cap: Duration,
}

impl ExponentialReconnection {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for ExponentialReconnection {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(600),
        }
    }
}

impl ReconnectionPolicy for ExponentialReconnection {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            base: self.base,
            cap: self.cap,
            attempt: 0,
        })
    }
}

struct ExponentialSchedule {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(30);
        self.attempt = self.attempt.saturating_add(1);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.85..1.15);
        raw.mul_f64(jitter).min(self.cap)
    }
}

/// A fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct ConstantReconnection {
    pub delay: Duration,
}

impl ReconnectionPolicy for ConstantReconnection {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        let delay = self.delay;
        Box::new(ConstantSchedule { delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

// src/core/policies/retry.rs

//! Retry policy: decides what to do with a failed attempt.

use crate::core::DriverError;

/// The verdict for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter the send on the same host.
    RetrySame,
    /// Advance to the next host in the query plan.
    RetryNext,
    /// Surface the error to the caller.
    Rethrow,
    /// Swallow the error and report an empty result.
    Ignore,
}

/// The retry contract. `attempt` counts prior invocations of the policy for
/// this request, starting at 0.
pub trait RetryPolicy: Send + Sync {
    fn on_error(&self, error: &DriverError, idempotent: bool, attempt: u32) -> RetryDecision;
}

/// The default policy, mirroring the classic coordinator-aware rules:
///
/// - read timeout: retry once on the same host when enough replicas answered
///   but the data was missing (the coordinator picked a slow data replica);
/// - write timeout: retry once for batch-log writes of idempotent statements;
/// - unavailable: try the next host once (another coordinator may see a
///   healthier replica set);
/// - transport errors and overload: next host, but only when the statement
///   is idempotent; a consumed non-idempotent write must not be repeated.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, error: &DriverError, idempotent: bool, attempt: u32) -> RetryDecision {
        match error {
            DriverError::ReadTimeout {
                received,
                block_for,
                data_present,
                ..
            } => {
                if attempt == 0 && received >= block_for && !data_present {
                    RetryDecision::RetrySame
                } else {
                    RetryDecision::Rethrow
                }
            }
            DriverError::WriteTimeout { write_type, .. } => {
                if attempt == 0 && idempotent && write_type == "BATCH_LOG" {
                    RetryDecision::RetrySame
                } else {
                    RetryDecision::Rethrow
                }
            }
            DriverError::Unavailable { .. } => {
                if attempt == 0 {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            DriverError::Overloaded | DriverError::IsBootstrapping => RetryDecision::RetryNext,
            e if e.is_transport() => {
                if idempotent {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            DriverError::OperationTimedOut(_) => {
                if idempotent {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            _ => RetryDecision::Rethrow,
        }
    }
}

/// Never retries; every error is surfaced as-is.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_error(&self, _error: &DriverError, _idempotent: bool, _attempt: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

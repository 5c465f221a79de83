// src/core/policies/speculative.rs

//! Speculative execution: firing a parallel attempt on another host before
//! the first one answers. Only ever consulted for idempotent statements.

use std::time::Duration;

/// The speculative-execution contract. `executions_started` counts attempts
/// already running (1 after the initial send). Returning `None` stops
/// speculation for this request.
pub trait SpeculativeExecutionPolicy: Send + Sync {
    fn next_execution(&self, executions_started: u32) -> Option<Duration>;
}

/// Never speculates.
#[derive(Debug, Default)]
pub struct NoSpeculativeExecution;

impl SpeculativeExecutionPolicy for NoSpeculativeExecution {
    fn next_execution(&self, _executions_started: u32) -> Option<Duration> {
        None
    }
}

/// Starts up to `max_executions` total attempts, a fixed delay apart.
#[derive(Debug, Clone)]
pub struct ConstantSpeculativeExecution {
    pub delay: Duration,
    pub max_executions: u32,
}

impl ConstantSpeculativeExecution {
    pub fn new(delay: Duration, max_executions: u32) -> Self {
        Self {
            delay,
            max_executions,
        }
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecution {
    fn next_execution(&self, executions_started: u32) -> Option<Duration> {
        if executions_started < self.max_executions {
            Some(self.delay)
        } else {
            None
        }
    }
}

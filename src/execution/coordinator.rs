//! Runs one snippet end to end and always comes back with an outcome.

use std::time::{Duration, Instant};

use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use super::{
    context::ExecutionContext,
    output::{self, CapturedOutput},
    sandbox::{panic_message, Deadline, RawResult, Sandbox},
    ExecutionError, ExecutionOutcome,
};
use crate::config::Config;

pub const DEFAULT_TIMEOUT_MS: u64 = 750;
const DEFAULT_MEMORY_LIMIT_MB: usize = 64;
const DEFAULT_STACK_SIZE_KB: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    /// Bytes of heap a single runtime may allocate.
    pub memory_limit: usize,
    /// Bytes of native stack a single runtime may use.
    pub max_stack_size: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            memory_limit: DEFAULT_MEMORY_LIMIT_MB * 1024 * 1024,
            max_stack_size: DEFAULT_STACK_SIZE_KB * 1024,
        }
    }
}

impl ExecutionLimits {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = Self::default();
        Self {
            timeout: cfg
                .get_u64("TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            memory_limit: cfg
                .get_usize("MEMORY_LIMIT_MB")
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            max_stack_size: cfg
                .get_usize("STACK_SIZE_KB")
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.max_stack_size),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Stateless between calls: every run gets its own runtime, collector and
/// deadline, so one coordinator can serve concurrent invocations.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    limits: ExecutionLimits,
}

impl Coordinator {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub async fn run(&self, snippet: impl AsRef<str>, context: ExecutionContext) -> ExecutionOutcome {
        self.run_with_timeout(snippet, context, self.limits.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        snippet: impl AsRef<str>,
        context: ExecutionContext,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let deadline = Deadline::after(timeout);
        let (collector, captured) = output::channel();
        let (settled_tx, settled_rx) = oneshot::channel();
        let sandbox = Sandbox::new(self.limits.memory_limit, self.limits.max_stack_size);
        let source = snippet.as_ref().to_owned();
        debug!(timeout_ms = timeout.as_millis() as u64, bytes = source.len(), "starting snippet");

        let worker = {
            let deadline = deadline.clone();
            tokio::task::spawn_blocking(move || {
                sandbox.execute(&source, &context, &deadline, collector, settled_tx)
            })
        };

        let until = tokio::time::Instant::from_std(deadline.instant());
        let outcome = match tokio::time::timeout_at(until, settled_rx).await {
            Ok(Ok(raw)) => settle(raw, captured),
            Ok(Err(_)) => crashed(worker, &deadline, captured).await,
            Err(_) => {
                deadline.abandon();
                warn!(timeout_ms = timeout.as_millis() as u64, "snippet timed out; abandoning worker");
                ExecutionOutcome::timed_out(captured.finish())
            }
        };

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = ?outcome.status(),
            "snippet finished"
        );
        outcome
    }
}

fn settle(raw: RawResult, captured: CapturedOutput) -> ExecutionOutcome {
    let output = captured.finish();
    match raw {
        RawResult::Value(Ok(value)) => ExecutionOutcome::completed(value, output),
        RawResult::Value(Err(failure)) => {
            debug!(detail = %failure.detail, "return value could not be stringified");
            ExecutionOutcome::failed(ExecutionError::Serialization { detail: failure.detail }, output)
        }
        RawResult::Thrown(text) => ExecutionOutcome::failed(ExecutionError::Thrown(text), output),
        RawResult::Interrupted | RawResult::Stalled => ExecutionOutcome::timed_out(output),
        RawResult::Unavailable(message) => {
            warn!(%message, "sandbox failed");
            ExecutionOutcome::failed(ExecutionError::Crashed(message), output)
        }
    }
}

/// The worker dropped its result sender without using it, which only
/// happens when it panicked.
async fn crashed(worker: JoinHandle<()>, deadline: &Deadline, captured: CapturedOutput) -> ExecutionOutcome {
    let until = tokio::time::Instant::from_std(deadline.instant());
    let message = match tokio::time::timeout_at(until, worker).await {
        Ok(Err(e)) if e.is_panic() => panic_message(e.into_panic().as_ref()),
        Ok(Err(e)) => e.to_string(),
        Ok(Ok(())) => "sandbox exited without a result".to_string(),
        Err(_) => {
            deadline.abandon();
            return ExecutionOutcome::timed_out(captured.finish());
        }
    };
    warn!(%message, "sandbox worker crashed");
    ExecutionOutcome::failed(ExecutionError::Crashed(message), captured.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn limits_default_to_observed_values() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.timeout, Duration::from_millis(750));
        assert_eq!(limits.memory_limit, 64 * 1024 * 1024);
        assert_eq!(limits.max_stack_size, 512 * 1024);
    }

    #[test]
    fn settle_maps_raw_results() {
        let (_, captured) = output::channel();
        let outcome = settle(RawResult::Stalled, captured);
        assert_eq!(outcome.error(), Some(&ExecutionError::TimedOut));

        let (collector, captured) = output::channel();
        collector.write("before".into());
        let outcome = settle(RawResult::Thrown("Error: boom".into()), captured);
        assert_eq!(outcome.error().map(ToString::to_string).as_deref(), Some("Error: boom"));
        assert_eq!(outcome.console_output(), Some("before"));
        assert_eq!(outcome.return_value(), None);
    }
}

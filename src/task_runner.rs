/// Task Runner with Restart Supervision
///
/// Runs a long-lived background task, restarting it with exponential backoff
/// when it fails or panics. Each attempt runs in its own tokio task so a
/// panic stays contained to that attempt; supervision itself never panics.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Restart policy for a supervised task
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay
    pub max_delay: Duration,
    /// An attempt that ran at least this long resets the backoff
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            healthy_after: Duration::from_secs(30),
        }
    }
}

/// How the last attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Shutdown,
}

struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    fn new(policy: &RestartPolicy) -> Self {
        Self {
            current: policy.initial_delay,
            initial: policy.initial_delay,
            max: policy.max_delay,
            consecutive_failures: 0,
        }
    }

    /// Delay for this failure with up to 20% jitter, then doubles the base
    fn next_delay(&mut self) -> Duration {
        self.consecutive_failures += 1;
        let base = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);

        let jitter_ms = (base.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        std::cmp::min(base + jitter, self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.consecutive_failures = 0;
    }
}

/// Run `task_fn` under supervision until it returns `Ok(())` or `shutdown` flips to true.
///
/// `Err` returns and panics are logged and followed by a restart after backoff.
pub async fn run_supervised<F, Fut>(
    task_name: &str,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) -> TaskExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let mut backoff = Backoff::new(&policy);

    loop {
        if *shutdown.borrow() {
            return TaskExit::Shutdown;
        }

        let started = Instant::now();
        let mut attempt = tokio::spawn(task_fn());

        let outcome = tokio::select! {
            joined = &mut attempt => joined,
            _ = wait_for_shutdown(&mut shutdown) => {
                attempt.abort();
                info!("Task '{}' stopped by shutdown signal", task_name);
                return TaskExit::Shutdown;
            }
        };

        if started.elapsed() >= policy.healthy_after {
            backoff.reset();
        }

        let failure = match outcome {
            Ok(Ok(())) => {
                info!("Task '{}' completed", task_name);
                return TaskExit::Completed;
            }
            Ok(Err(e)) => e,
            Err(join_error) if join_error.is_panic() => {
                format!("panicked: {}", panic_message(join_error.into_panic()))
            }
            Err(join_error) => format!("aborted: {}", join_error),
        };

        let delay = backoff.next_delay();
        error!(
            "Task '{}' failed (consecutive failures: {}): {}",
            task_name, backoff.consecutive_failures, failure
        );
        warn!("Task '{}' will restart in {:?}", task_name, delay);

        tokio::select! {
            _ = sleep(delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Task '{}' stopped by shutdown signal during backoff", task_name);
                return TaskExit::Shutdown;
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // sender gone: nobody can request shutdown any more
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

//! C1/C2: Worker Supervisor and Parent Controller (§4.1, §4.2).
//!
//! brimd forks plain continuations of itself (no exec): every sub-instance
//! worker and every daemon is a child produced by `fork()` that falls
//! straight into its own run loop. This is simpler than the sibling
//! project's exec-a-external-command model because the handlers here are
//! Rust trait objects already linked into this binary, resolved through
//! the in-process `FactoryRegistry` rather than looked up as an
//! executable on `$PATH`.

pub mod parent;
pub mod worker;

use std::time::{Duration, Instant};

/// Mirrors the sibling project's `signal_handler::ChildTermination`:
/// how a reaped child actually stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildTermination {
    Exit(i32),
    Signal(i32),
}

impl ChildTermination {
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exit(0))
    }
}

/// Identifies one supervised child and the stats scope it writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
    Wsgi { sub_instance: String, worker_index: usize },
    Tcp { sub_instance: String, worker_index: usize },
    Udp { sub_instance: String, worker_index: usize },
    Daemon { name: String },
}

impl WorkerRole {
    #[must_use]
    pub fn scope(&self) -> String {
        match self {
            Self::Wsgi { sub_instance, worker_index } => {
                format!("wsgi:{sub_instance}:{worker_index}")
            }
            Self::Tcp { sub_instance, worker_index } => {
                format!("tcp:{sub_instance}:{worker_index}")
            }
            Self::Udp { sub_instance, worker_index } => {
                format!("udp:{sub_instance}:{worker_index}")
            }
            Self::Daemon { name } => format!("daemon:{name}"),
        }
    }
}

/// Exponential restart backoff, 1s doubling to a 60s cap, reset once a
/// worker has stayed up for 60 continuous seconds (§4.2).
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    current: Duration,
}

impl RestartBackoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);
    const RESET_AFTER_UPTIME: Duration = Duration::from_secs(60);

    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    /// Call once a child has been reaped, passing how long it had been
    /// running. Returns the delay to wait before reforking it.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= Self::RESET_AFTER_UPTIME {
            self.current = Self::INITIAL;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn now_unix() -> i64 {
    // Reads the monotonic-adjacent wall clock once per call; acceptable
    // here since `start_time` is only sampled at worker (re)start, not
    // per request.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[must_use]
pub fn elapsed_since(start: Instant) -> Duration {
    start.elapsed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = RestartBackoff::new();
        assert_eq!(backoff.next_delay(Duration::from_secs(0)), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(Duration::from_secs(0)), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(Duration::from_secs(0)), Duration::from_secs(4));
    }

    #[test]
    fn backoff_resets_after_a_long_enough_uptime() {
        let mut backoff = RestartBackoff::new();
        backoff.next_delay(Duration::from_secs(0));
        backoff.next_delay(Duration::from_secs(0));
        assert_eq!(
            backoff.next_delay(Duration::from_secs(120)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn backoff_never_exceeds_sixty_seconds() {
        let mut backoff = RestartBackoff::new();
        for _ in 0..10 {
            backoff.next_delay(Duration::from_secs(0));
        }
        assert_eq!(backoff.next_delay(Duration::from_secs(0)), Duration::from_secs(60));
    }
}

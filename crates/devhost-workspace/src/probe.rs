//! Socket readiness probing with exponential backoff.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

/// How long and how often to dial a fresh backend socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Delay after the first failed dial; doubled after each failure.
    pub initial_backoff: Duration,
    /// Give up after this long and admit the backend degraded.
    pub deadline: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            deadline: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Dial the socket once.
pub async fn probe_socket(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

/// Dial until a connection succeeds or the policy's deadline elapses.
pub async fn wait_for_socket(path: &Path, policy: ProbePolicy) -> Readiness {
    let deadline = Instant::now() + policy.deadline;
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe_socket(path).await {
            debug!("Socket {} ready after {attempts} attempt(s)", path.display());
            return Readiness::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = backoff.saturating_mul(2);
    }
}

//! Connection configuration.
//!
//! All knobs are explicit values handed to the connection at construction;
//! there is no process-wide registry. A couple of limits can additionally be
//! overridden through the environment for operational tuning.

use std::time::Duration;

const DEFAULT_MAX_OUTSTANDING: usize = 4096;

fn max_outstanding_default() -> usize {
    std::env::var("HUBLINK_MAX_OUTSTANDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_OUTSTANDING)
}

/// Tunables for one logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long `start()` waits for the handshake response.
    pub handshake_timeout: Duration,
    /// Interval between outbound keepalive pings while connected.
    pub keep_alive_interval: Duration,
    /// Idle window: no frame from the peer within this window is treated as
    /// a transport failure (distinguishes silent death from graceful close).
    pub server_timeout: Duration,
    /// Buffer capacity of each streaming call's item channel. A full buffer
    /// suspends the receive loop (head-of-line blocking by design).
    pub stream_buffer_capacity: usize,
    /// Cap on concurrently outstanding invocations.
    pub max_outstanding: usize,
    /// Reconnection policy; `None` disables automatic reconnection.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            stream_buffer_capacity: 64,
            max_outstanding: max_outstanding_default(),
            reconnect: None,
        }
    }
}

impl ConnectionConfig {
    /// Default configuration with automatic reconnection enabled.
    pub fn with_reconnect() -> Self {
        Self {
            reconnect: Some(ReconnectPolicy::default()),
            ..Self::default()
        }
    }
}

/// Backoff schedule for reconnection attempts.
///
/// Attempt `i` waits `delays[i]`, reusing the final delay once the schedule
/// runs out. `max_attempts` bounds the attempt count; `None` retries without
/// bound.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delays: Vec<Duration>,
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            max_attempts: Some(4),
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever with a fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delays: vec![delay],
            max_attempts: None,
        }
    }

    /// The delay to wait before attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt)
            .or(self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether `attempt` (zero-based) is still within budget.
    pub fn allows(&self, attempt: usize) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

use std::time::Duration;

/// Reconnection schedule: `base * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based), or `None` once the
    /// attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Quiet period after the last keystroke before `typing_stop` is sent.
    pub typing_debounce: Duration,
    /// Lifetime of a remote typing indicator that never receives a stop.
    pub typing_ttl: Duration,
    /// Placeholders still `sending` this long after hitting the wire fail.
    /// `None` waits forever.
    pub ack_timeout: Option<Duration>,
    pub history_page_size: u32,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            typing_debounce: Duration::from_secs(2),
            typing_ttl: Duration::from_secs(6),
            ack_timeout: Some(Duration::from_secs(30)),
            history_page_size: 50,
            command_buffer: 256,
            event_buffer: 1024,
        }
    }
}

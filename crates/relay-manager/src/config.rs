use std::time::Duration;

/// Configuration for a [`RelayManager`](crate::RelayManager).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use relay_manager::RelayManagerConfig;
///
/// let config = RelayManagerConfig::new()
///     .sync_timeout(Duration::from_secs(120))
///     .complete_display(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct RelayManagerConfig {
    /// Upper bound on the transport call plus the wait for a terminal phase.
    pub(crate) sync_timeout: Duration,
    /// How long `SyncStatus::Complete` stays visible before returning to idle.
    pub(crate) complete_display: Duration,
    /// Capacity of the sync result broadcast channel.
    pub(crate) event_buffer: usize,
}

impl Default for RelayManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayManagerConfig {
    /// Create a new config with defaults.
    ///
    /// If `RELAY_SYNC_TIMEOUT_SECS` is set to a positive integer it replaces
    /// the default sync timeout. [`.sync_timeout()`](Self::sync_timeout) still wins.
    pub fn new() -> Self {
        let sync_timeout = std::env::var("RELAY_SYNC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        Self {
            sync_timeout,
            complete_display: Duration::from_secs(2),
            event_buffer: 64,
        }
    }

    /// Bound the sync wait (default: 300 s).
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Duration of the transient complete state (default: 2 s).
    pub fn complete_display(mut self, duration: Duration) -> Self {
        self.complete_display = duration;
        self
    }

    /// Sync result channel capacity (default: 64, minimum 1).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = RelayManagerConfig::new()
            .sync_timeout(Duration::from_secs(9))
            .complete_display(Duration::from_millis(10))
            .event_buffer(0);
        assert_eq!(config.sync_timeout, Duration::from_secs(9));
        assert_eq!(config.complete_display, Duration::from_millis(10));
        assert_eq!(config.event_buffer, 1);
    }
}

use std::time::Duration;

use todo_sdk::event::ALL_TOPICS;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables of an [`Indexer`](crate::lifecycle::Indexer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexerConfig {
    topic_pattern: String,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl IndexerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics to subscribe to. `*` matches any run of characters.
    pub fn topic_pattern(mut self, topic_pattern: impl Into<String>) -> Self {
        self.topic_pattern = topic_pattern.into();
        self
    }

    /// Longest wait for a message before the stop signal is checked again.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long a graceful shutdown may wait for the in-flight message.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn get_topic_pattern(&self) -> &str {
        &self.topic_pattern
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn get_shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            topic_pattern: ALL_TOPICS.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = IndexerConfig::default();

        assert_eq!(config.get_topic_pattern(), "tasks.*");
        assert_eq!(config.get_poll_interval(), Duration::from_millis(150));
        assert_eq!(config.get_shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn setters_override_defaults() {
        let config = IndexerConfig::new()
            .topic_pattern("tasks.event.deleted")
            .poll_interval(Duration::from_millis(20))
            .shutdown_timeout(Duration::from_secs(1));

        assert_eq!(config.get_topic_pattern(), "tasks.event.deleted");
        assert_eq!(config.get_poll_interval(), Duration::from_millis(20));
        assert_eq!(config.get_shutdown_timeout(), Duration::from_secs(1));
    }
}

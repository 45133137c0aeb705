/// Configuration for a [`ChannelGroup`](crate::ChannelGroup).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of read workers. Each channel is pinned to one at creation.
    pub read_threads: usize,
    /// Number of write/common workers. Write interest, future-read handoff,
    /// and deferred callback execution run here.
    pub common_threads: usize,
    /// Maximum depth of synchronous re-entrant completions within one event
    /// loop iteration. Once exceeded, further operations from that thread are
    /// forced onto the deferred (registered) path.
    pub max_invoker_depth: usize,
    /// Low-memory mode: reads may be issued without a buffer; allocation is
    /// deferred until the socket is known to be readable.
    pub low_memory: bool,
    /// Readiness events fetched per `epoll_wait` call.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_threads: 1,
            common_threads: 1,
            max_invoker_depth: 8,
            low_memory: false,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.read_threads == 0 {
            return Err(crate::error::Error::Config(
                "read_threads must be > 0".into(),
            ));
        }
        if self.common_threads == 0 {
            return Err(crate::error::Error::Config(
                "common_threads must be > 0".into(),
            ));
        }
        if self.max_invoker_depth == 0 {
            return Err(crate::error::Error::Config(
                "max_invoker_depth must be > 0".into(),
            ));
        }
        if self.event_capacity == 0 || self.event_capacity > 65536 {
            return Err(crate::error::Error::Config(
                "event_capacity must be > 0 and <= 65536".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_threads_rejected() {
        let mut config = Config::default();
        config.read_threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.common_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_depth_rejected() {
        let mut config = Config::default();
        config.max_invoker_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn event_capacity_bounds() {
        let mut config = Config::default();
        config.event_capacity = 0;
        assert!(config.validate().is_err());
        config.event_capacity = 1 << 20;
        assert!(config.validate().is_err());
    }
}

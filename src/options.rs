use std::time::Duration;

use crate::MAX_PAYLOAD_LENGTH;

/// Default cadence of the socket driver when nothing happens on the connection.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Configuration options for a WebSocket connection.
///
/// `Options` governs the handshake (user agent, accept key verification) and the socket
/// driver (payload limit, tick cadence).
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum payload size for a single incoming frame and for a reassembled message.
    ///
    /// Never above [`MAX_PAYLOAD_LENGTH`], which is also the default.
    pub max_payload: usize,

    /// Delay between two driver ticks when the previous tick found nothing to do.
    /// A tick that received a frame is followed immediately by another one; sending alone
    /// does not shorten the wait.
    ///
    /// Default: 1 second.
    pub tick_interval: Duration,

    /// Value of the `User-Agent` header. Default: `pooled-ws/<version>`.
    pub user_agent: String,

    /// Whether `Sec-WebSocket-Accept` must match the key that was sent.
    ///
    /// Default: `true`. Disabling it only checks that the header is present, which some
    /// test servers need.
    pub verify_accept: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_LENGTH,
            tick_interval: DEFAULT_TICK_INTERVAL,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
            verify_accept: true,
        }
    }
}

impl Options {
    /// Lowers the maximum accepted payload. Values above [`MAX_PAYLOAD_LENGTH`] are clamped.
    pub fn with_max_payload(self, size: usize) -> Self {
        Self {
            max_payload: size.min(MAX_PAYLOAD_LENGTH),
            ..self
        }
    }

    /// Sets the idle tick cadence of the socket driver.
    pub fn with_tick_interval(self, interval: Duration) -> Self {
        Self {
            tick_interval: interval,
            ..self
        }
    }

    pub fn with_user_agent(self, user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..self
        }
    }

    /// Accepts any non-empty `Sec-WebSocket-Accept` value.
    pub fn without_accept_check(self) -> Self {
        Self {
            verify_accept: false,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = Options::default()
            .with_max_payload(usize::MAX)
            .with_tick_interval(Duration::from_millis(10))
            .with_user_agent("agent/1")
            .without_accept_check();

        assert_eq!(options.max_payload, MAX_PAYLOAD_LENGTH);
        assert_eq!(options.tick_interval, Duration::from_millis(10));
        assert_eq!(options.user_agent, "agent/1");
        assert!(!options.verify_accept);

        let options = Options::default();
        assert!(options.verify_accept);
        assert!(options.user_agent.starts_with("pooled-ws/"));
    }
}

//! Transport configuration.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use graphsub_core::{ConnectionContext, GraphQLError, InitPayload};

use crate::error::WebsocketError;

/// Hook invoked with the client's init payload.
///
/// May reject the connection by returning an error (sent to the client as a
/// `connection_error` before a normal close) or enrich the connection
/// context before returning it.
pub type WebsocketInitFunc = Arc<
    dyn Fn(ConnectionContext, InitPayload) -> BoxFuture<'static, Result<ConnectionContext, GraphQLError>>
        + Send
        + Sync,
>;

/// Hook invoked with non-benign socket read/write faults.
pub type WebsocketErrorFunc = Arc<dyn Fn(&ConnectionContext, WebsocketError) + Send + Sync>;

/// Timing configuration for a WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebsocketConfig {
    /// Maximum wait for the first `connection_init` frame. `None` (or a zero
    /// duration) disables the timeout.
    pub init_timeout: Option<Duration>,
    /// Cadence of server keep-alive frames on legacy connections. `None` (or
    /// zero) disables them.
    pub keep_alive_interval: Option<Duration>,
    /// Cadence of server pings on modern connections, and the basis of the
    /// 2x read deadline that detects unresponsive clients. `None` (or zero)
    /// disables both.
    pub ping_pong_interval: Option<Duration>,
}

impl WebsocketConfig {
    /// Create a configuration with every timer disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the init handshake timeout.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    /// Set the legacy keep-alive cadence.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set the modern ping/pong cadence.
    #[must_use]
    pub fn ping_pong_interval(mut self, interval: Duration) -> Self {
        self.ping_pong_interval = Some(interval);
        self
    }

    pub(crate) fn effective_init_timeout(&self) -> Option<Duration> {
        self.init_timeout.filter(|d| !d.is_zero())
    }

    pub(crate) fn effective_keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval.filter(|d| !d.is_zero())
    }

    pub(crate) fn effective_ping_pong_interval(&self) -> Option<Duration> {
        self.ping_pong_interval.filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_disables_everything() {
        let config = WebsocketConfig::default();
        assert_eq!(config.effective_init_timeout(), None);
        assert_eq!(config.effective_keep_alive_interval(), None);
        assert_eq!(config.effective_ping_pong_interval(), None);
    }

    #[test]
    fn test_builder_sets_intervals() {
        let config = WebsocketConfig::new()
            .init_timeout(Duration::from_millis(50))
            .keep_alive_interval(Duration::from_secs(10))
            .ping_pong_interval(Duration::from_secs(5));

        assert_eq!(
            config.effective_init_timeout(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(
            config.effective_keep_alive_interval(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            config.effective_ping_pong_interval(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_zero_means_disabled() {
        let config = WebsocketConfig::new()
            .init_timeout(Duration::ZERO)
            .keep_alive_interval(Duration::ZERO)
            .ping_pong_interval(Duration::ZERO);

        assert_eq!(config.effective_init_timeout(), None);
        assert_eq!(config.effective_keep_alive_interval(), None);
        assert_eq!(config.effective_ping_pong_interval(), None);
    }
}

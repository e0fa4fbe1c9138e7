use std::time::Duration;

/// TCP port of the config service
pub const DEFAULT_CONFIG_PORT: u16 = 5001;
/// UDP port the device broadcasts telemetry to
pub const DEFAULT_LISTEN_PORT: u16 = 43210;

/// How hard to try when opening the config connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause between failed attempts
    pub delay: Duration,
    /// Limit on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub port: u16,
    /// How long to wait for the response to one config request
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONFIG_PORT,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

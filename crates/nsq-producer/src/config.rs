//! Producer configuration.

use crate::error::ConfigError;

use std::net::SocketAddr;
use std::time::Duration;

const MIN_IO_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_IO_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configuration for a [`Producer`](crate::Producer) and the connection it opens.
///
/// A producer copies its configuration when it is created, so changing a `Config`
/// afterwards never affects a producer that already exists.
#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout for establishing the TCP connection.
    pub dial_timeout: Duration,
    /// Deadline for every read from the broker. Heartbeats keep an idle connection
    /// inside it.
    pub read_timeout: Duration,
    /// Deadline for writing one command.
    pub write_timeout: Duration,
    /// Local address to bind before dialing.
    pub local_addr: Option<SocketAddr>,
    /// Interval at which the broker sends heartbeats. Zero disables them.
    pub heartbeat_interval: Duration,
    /// Identifier reported to the broker.
    pub client_id: String,
    /// Hostname reported to the broker.
    pub hostname: String,
    /// User agent reported to the broker.
    pub user_agent: String,
    /// Size of the broker's output buffer for this client, in bytes.
    pub output_buffer_size: i64,
    /// How long the broker may buffer output before flushing.
    pub output_buffer_timeout: Duration,
    /// Server-side message timeout. Zero keeps the broker default.
    pub msg_timeout: Duration,
    /// Percentage of messages the broker should sample for this client.
    pub sample_rate: u8,
    /// Secret sent with `AUTH` when the broker requires authentication.
    pub auth_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = local_hostname();
        let client_id = hostname
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            local_addr: None,
            heartbeat_interval: Duration::from_secs(30),
            client_id,
            hostname,
            user_agent: format!("proven-nsq-producer/{}", env!("CARGO_PKG_VERSION")),
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            msg_timeout: Duration::ZERO,
            sample_rate: 0,
            auth_secret: None,
        }
    }
}

impl Config {
    /// Check that every option is usable.
    ///
    /// # Errors
    ///
    /// Returns the first option that fails validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                name: "dial_timeout",
                value: self.dial_timeout,
                min: Duration::from_millis(1),
                max: Duration::MAX,
            });
        }

        check_range("read_timeout", self.read_timeout, MIN_IO_TIMEOUT, MAX_IO_TIMEOUT)?;
        check_range("write_timeout", self.write_timeout, MIN_IO_TIMEOUT, MAX_IO_TIMEOUT)?;

        if self.heartbeat_interval >= self.read_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                read_timeout: self.read_timeout,
            });
        }

        if self.sample_rate > 99 {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Empty("client_id"));
        }
        if self.hostname.is_empty() {
            return Err(ConfigError::Empty("hostname"));
        }
        if self.user_agent.is_empty() {
            return Err(ConfigError::Empty("user_agent"));
        }

        Ok(())
    }
}

fn check_range(
    name: &'static str,
    value: Duration,
    min: Duration,
    max: Duration,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

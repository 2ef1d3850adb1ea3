//! Commands sent to the broker.

use crate::error::{Error, Result};
use crate::protocol::IdentifyRequest;

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

/// One command as written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    params: Vec<String>,
    body: Option<Bytes>,
}

impl Command {
    /// `NOP`, a no-op the broker never answers.
    #[must_use]
    pub const fn nop() -> Self {
        Self {
            name: "NOP",
            params: Vec::new(),
            body: None,
        }
    }

    /// `PUB`, publish one message to `topic`.
    #[must_use]
    pub fn publish(topic: &str, body: impl Into<Bytes>) -> Self {
        Self {
            name: "PUB",
            params: vec![topic.to_string()],
            body: Some(body.into()),
        }
    }

    /// `MPUB`, publish a batch of messages to `topic` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommand`] for an empty batch or a batch that does not fit
    /// the wire format.
    pub fn multi_publish<I, B>(topic: &str, bodies: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let bodies: Vec<Bytes> = bodies.into_iter().map(Into::into).collect();
        if bodies.is_empty() {
            return Err(Error::InvalidCommand(
                "MPUB needs at least one message".to_string(),
            ));
        }

        let count = u32::try_from(bodies.len())
            .map_err(|_| Error::InvalidCommand("too many messages for MPUB".to_string()))?;
        let size = 4 + bodies.iter().map(|body| 4 + body.len()).sum::<usize>();

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(count);
        for body in bodies {
            let len = u32::try_from(body.len())
                .map_err(|_| Error::InvalidCommand("MPUB message too large".to_string()))?;
            buf.put_u32(len);
            buf.put(body);
        }

        Ok(Self {
            name: "MPUB",
            params: vec![topic.to_string()],
            body: Some(buf.freeze()),
        })
    }

    /// `DPUB`, publish one message to `topic` that becomes visible after `delay`.
    #[must_use]
    pub fn deferred_publish(topic: &str, delay: Duration, body: impl Into<Bytes>) -> Self {
        Self {
            name: "DPUB",
            params: vec![topic.to_string(), delay.as_millis().to_string()],
            body: Some(body.into()),
        }
    }

    /// `IDENTIFY`, the handshake announcing client metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    pub fn identify(request: &IdentifyRequest) -> Result<Self> {
        Ok(Self {
            name: "IDENTIFY",
            params: Vec::new(),
            body: Some(Bytes::from(serde_json::to_vec(request)?)),
        })
    }

    /// `AUTH`, authenticate with `secret`.
    #[must_use]
    pub fn auth(secret: &str) -> Self {
        Self {
            name: "AUTH",
            params: Vec::new(),
            body: Some(Bytes::copy_from_slice(secret.as_bytes())),
        }
    }

    /// The command name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The space-separated parameters following the name.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The length-prefixed body, if any.
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether the broker answers this command with a response or error frame.
    #[must_use]
    pub fn expects_response(&self) -> bool {
        self.name != "NOP"
    }

    /// Append the wire encoding to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is larger than the wire format allows.
    pub fn write_to(&self, buf: &mut BytesMut) -> io::Result<()> {
        let body_len = self
            .body
            .as_ref()
            .map(|body| {
                u32::try_from(body.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "command body too large")
                })
            })
            .transpose()?;

        buf.reserve(
            self.name.len()
                + self.params.iter().map(|param| param.len() + 1).sum::<usize>()
                + 1
                + self.body.as_ref().map_or(0, |body| body.len() + 4),
        );

        buf.put_slice(self.name.as_bytes());
        for param in &self.params {
            buf.put_u8(b' ');
            buf.put_slice(param.as_bytes());
        }
        buf.put_u8(b'\n');

        if let (Some(len), Some(body)) = (body_len, &self.body) {
            buf.put_u32(len);
            buf.put_slice(body);
        }

        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: &Command) -> Vec<u8> {
        let mut buf = BytesMut::new();
        command.write_to(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_nop_has_no_body() {
        assert_eq!(encode(&Command::nop()), b"NOP\n");
        assert!(!Command::nop().expects_response());
    }

    #[test]
    fn test_publish_encoding() {
        let command = Command::publish("events", "hello");

        let mut expected = b"PUB events\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");

        assert_eq!(encode(&command), expected);
        assert!(command.expects_response());
        assert_eq!(command.to_string(), "PUB events");
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::nop().name(), "NOP");
        assert_eq!(Command::publish("events", "x").name(), "PUB");
        assert_eq!(
            Command::multi_publish("events", vec!["x"]).unwrap().name(),
            "MPUB"
        );
        assert_eq!(
            Command::deferred_publish("events", Duration::from_secs(1), "x").name(),
            "DPUB"
        );
        assert_eq!(Command::auth("secret").name(), "AUTH");
    }

    #[test]
    fn test_multi_publish_body_layout() {
        let command = Command::multi_publish("events", vec!["a", "bcd"]).unwrap();
        let body = command.body().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"a");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"bcd");

        assert_eq!(body.as_ref(), expected.as_slice());
        assert!(encode(&command).starts_with(b"MPUB events\n"));
    }

    #[test]
    fn test_multi_publish_rejects_empty_batch() {
        let result = Command::multi_publish("events", Vec::<Bytes>::new());

        assert!(matches!(result, Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn test_deferred_publish_delay_in_millis() {
        let command = Command::deferred_publish("events", Duration::from_secs(3), "x");

        assert_eq!(command.params(), ["events", "3000"]);
        assert!(encode(&command).starts_with(b"DPUB events 3000\n"));
    }

    #[test]
    fn test_identify_body_is_json() {
        let config = crate::Config {
            client_id: "producer".to_string(),
            ..crate::Config::default()
        };
        let request = IdentifyRequest::from_config(&config);
        let command = Command::identify(&request).unwrap();

        let json: serde_json::Value = serde_json::from_slice(command.body().unwrap()).unwrap();
        assert_eq!(json["client_id"], "producer");
        assert_eq!(json["feature_negotiation"], true);
    }
}

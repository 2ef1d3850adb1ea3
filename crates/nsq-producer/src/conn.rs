//! Broker connections.
//!
//! The producer talks to a connection only through [`ProducerConn`] and hears back from
//! it only through [`ConnDelegate`]. [`TcpConn`] is the implementation used by default.

use crate::command::Command;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::logging::{LogLevel, Logging};
use crate::protocol::{
    AuthResponse, Frame, FrameCodec, FrameType, IdentifyRequest, IdentifyResponse, MAGIC_V2, OK,
};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Receives asynchronous events from a connection.
#[async_trait]
pub trait ConnDelegate: Send + Sync + 'static {
    /// A response frame arrived.
    async fn on_response(&self, data: Bytes);

    /// An error frame arrived.
    async fn on_error(&self, data: Bytes);

    /// A heartbeat arrived; the connection has already answered it.
    async fn on_heartbeat(&self);

    /// The connection hit an unrecoverable I/O error.
    async fn on_io_error(&self, err: &Error);

    /// The connection has fully shut down. Called once.
    async fn on_close(&self);
}

/// Capabilities the producer needs from a connection.
///
/// `Display` identifies the connection in log lines.
#[async_trait]
pub trait ProducerConn: fmt::Display + Send + Sync + 'static {
    /// Assign the logger table, with `prefix` identifying the owner.
    fn set_logging(&self, logging: Logging, prefix: &str);

    /// Establish the transport and perform the handshake.
    ///
    /// Returns the negotiated settings, or `None` for brokers without feature
    /// negotiation.
    async fn connect(&self, ctx: &Context) -> Result<Option<IdentifyResponse>>;

    /// Close the transport. The delegate's `on_close` follows once shutdown finishes.
    fn close(&self) -> Result<()>;

    /// Write one command.
    ///
    /// Fails with the context's error if it is done before the command is written.
    async fn write_command(&self, ctx: &Context, command: &Command) -> Result<()>;
}

/// Builds the connection a producer uses for each connect attempt.
pub trait Connector: Send + Sync + 'static {
    /// Create an unconnected connection to `addr`.
    fn new_conn(
        &self,
        addr: &str,
        config: &Config,
        delegate: Arc<dyn ConnDelegate>,
    ) -> Arc<dyn ProducerConn>;
}

/// Connector producing [`TcpConn`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn new_conn(
        &self,
        addr: &str,
        config: &Config,
        delegate: Arc<dyn ConnDelegate>,
    ) -> Arc<dyn ProducerConn> {
        Arc::new(TcpConn::new(addr, config.clone(), delegate))
    }
}

struct ConnLog {
    logging: Logging,
    prefix: String,
}

struct Shared {
    addr: String,
    config: Config,
    delegate: Arc<dyn ConnDelegate>,
    log: RwLock<ConnLog>,
    writer: Mutex<Option<Writer>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
}

/// TCP connection to one broker.
pub struct TcpConn {
    shared: Arc<Shared>,
}

impl TcpConn {
    /// Create an unconnected connection to `addr`.
    #[must_use]
    pub fn new(addr: &str, config: Config, delegate: Arc<dyn ConnDelegate>) -> Self {
        Self {
            shared: Arc::new(Shared {
                addr: addr.to_string(),
                config,
                delegate,
                log: RwLock::new(ConnLog {
                    logging: Logging::new(),
                    prefix: format!("({addr})"),
                }),
                writer: Mutex::new(None),
                shutdown: CancellationToken::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let shared = &self.shared;

        let Some(local_addr) = shared.config.local_addr else {
            return Ok(TcpStream::connect(shared.addr.as_str()).await?);
        };

        let remote = lookup_host(shared.addr.as_str())
            .await?
            .find(|remote| remote.is_ipv4() == local_addr.is_ipv4())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address of {} matches {local_addr}", shared.addr),
                )
            })?;

        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(local_addr)?;

        Ok(socket.connect(remote).await?)
    }

    async fn handshake(
        &self,
        writer: &mut Writer,
        reader: &mut Reader,
    ) -> Result<Option<IdentifyResponse>> {
        let config = &self.shared.config;

        writer.get_mut().write_all(MAGIC_V2).await?;

        let identify = Command::identify(&IdentifyRequest::from_config(config))?;
        writer.send(&identify).await?;

        let frame = read_frame(reader, config.read_timeout).await?;
        if frame.frame_type == FrameType::Error {
            return Err(Error::Identify(String::from_utf8_lossy(&frame.data).into_owned()));
        }
        if frame.data.as_ref() == OK {
            return Ok(None);
        }

        let response: IdentifyResponse = serde_json::from_slice(&frame.data)
            .map_err(|err| Error::Identify(format!("invalid response - {err}")))?;
        self.shared.log(
            LogLevel::Debug,
            format_args!("IDENTIFY response: {response:?}"),
        );

        if response.auth_required {
            self.auth(writer, reader).await?;
        }

        Ok(Some(response))
    }

    async fn auth(&self, writer: &mut Writer, reader: &mut Reader) -> Result<()> {
        let config = &self.shared.config;

        let Some(secret) = config.auth_secret.as_deref() else {
            return Err(Error::Auth(
                "broker requires auth but no auth_secret is configured".to_string(),
            ));
        };

        writer.send(&Command::auth(secret)).await?;

        let frame = read_frame(reader, config.read_timeout).await?;
        if frame.frame_type == FrameType::Error {
            return Err(Error::Auth(String::from_utf8_lossy(&frame.data).into_owned()));
        }

        let response: AuthResponse = serde_json::from_slice(&frame.data)
            .map_err(|err| Error::Auth(format!("invalid response - {err}")))?;
        self.shared.log(
            LogLevel::Info,
            format_args!(
                "Auth accepted. Identity: {:?} {} Permissions: {}",
                response.identity, response.identity_url, response.permission_count
            ),
        );

        Ok(())
    }
}

#[async_trait]
impl ProducerConn for TcpConn {
    fn set_logging(&self, logging: Logging, prefix: &str) {
        *self.shared.log.write() = ConnLog {
            logging,
            prefix: format!("{prefix} ({})", self.shared.addr),
        };
    }

    async fn connect(&self, ctx: &Context) -> Result<Option<IdentifyResponse>> {
        let dial_timeout = self.shared.config.dial_timeout;

        let stream = tokio::select! {
            err = ctx.done() => return Err(err),
            stream = timeout(dial_timeout, self.dial()) => {
                stream.map_err(|_| Error::DialTimeout(dial_timeout))??
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        let response = tokio::select! {
            err = ctx.done() => return Err(err),
            response = self.handshake(&mut writer, &mut reader) => response?,
        };

        *self.shared.writer.lock().await = Some(writer);
        tokio::spawn(read_loop(Arc::clone(&self.shared), reader));

        Ok(response)
    }

    fn close(&self) -> Result<()> {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            self.shared
                .log(LogLevel::Info, format_args!("beginning close"));
        }
        self.shared.shutdown.cancel();
        Ok(())
    }

    async fn write_command(&self, ctx: &Context, command: &Command) -> Result<()> {
        self.shared.write(ctx, command).await
    }
}

impl fmt::Display for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shared.addr)
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("addr", &self.shared.addr)
            .field("closing", &self.shared.closing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let log = self.log.read();
        log.logging.log(level, &log.prefix, args);
    }

    async fn write(&self, ctx: &Context, command: &Command) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut writer = tokio::select! {
            err = ctx.done() => return Err(err),
            writer = self.writer.lock() => writer,
        };

        // Checked again now that the lock is held: once bytes start flowing the
        // command is written whole or the connection is given up.
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let Some(framed) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        let result = match timeout(self.config.write_timeout, framed.send(command)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };
        drop(writer);

        if let Err(err) = result {
            let err = Error::Io(err);
            self.io_error(&err).await;
            return Err(err);
        }

        Ok(())
    }

    async fn io_error(&self, err: &Error) {
        if self.closing.load(Ordering::SeqCst) {
            self.log(LogLevel::Debug, format_args!("IO error while closing - {err}"));
            return;
        }

        self.log(LogLevel::Error, format_args!("IO error - {err}"));
        self.delegate.on_io_error(err).await;
    }
}

async fn read_frame(reader: &mut Reader, read_timeout: Duration) -> Result<Frame> {
    match timeout(read_timeout, reader.next()).await {
        Ok(Some(frame)) => Ok(frame?),
        Ok(None) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out").into()),
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) {
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            frame = read_frame(&mut reader, shared.config.read_timeout) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                shared.io_error(&err).await;
                break;
            }
        };

        if frame.is_heartbeat() {
            shared.log(LogLevel::Debug, format_args!("heartbeat received"));
            shared.delegate.on_heartbeat().await;
            if shared
                .write(&Context::background(), &Command::nop())
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        match frame.frame_type {
            FrameType::Response => shared.delegate.on_response(frame.data).await,
            FrameType::Error => {
                shared.log(
                    LogLevel::Error,
                    format_args!("protocol error - {}", String::from_utf8_lossy(&frame.data)),
                );
                shared.delegate.on_error(frame.data).await;
            }
            FrameType::Message => shared.log(
                LogLevel::Warning,
                format_args!("unexpected message frame ({} bytes)", frame.data.len()),
            ),
        }
    }

    shared.closing.store(true, Ordering::SeqCst);
    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.get_mut().shutdown().await;
    }

    shared.log(LogLevel::Info, format_args!("read loop exiting"));
    shared.delegate.on_close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDelegate;

    #[async_trait]
    impl ConnDelegate for NullDelegate {
        async fn on_response(&self, _data: Bytes) {}
        async fn on_error(&self, _data: Bytes) {}
        async fn on_heartbeat(&self) {}
        async fn on_io_error(&self, _err: &Error) {}
        async fn on_close(&self) {}
    }

    fn conn() -> Arc<dyn ProducerConn> {
        TcpConnector.new_conn("127.0.0.1:4150", &Config::default(), Arc::new(NullDelegate))
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let conn = conn();

        let result = conn
            .write_command(&Context::background(), &Command::nop())
            .await;

        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_write_honours_cancelled_context() {
        let conn = conn();
        let ctx = Context::background();
        ctx.cancel();

        let result = conn.write_command(&ctx, &Command::nop()).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = conn();

        conn.close().unwrap();
        conn.close().unwrap();

        assert_eq!(conn.to_string(), "127.0.0.1:4150");
    }
}

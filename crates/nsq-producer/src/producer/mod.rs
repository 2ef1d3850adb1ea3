//! The producer: one broker connection shared by every publishing task.

mod router;

#[cfg(test)]
mod mock;

use router::{ProducerConnDelegate, Router};

use crate::command::Command;
use crate::config::Config;
use crate::conn::{Connector, ProducerConn, TcpConnector};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::logging::{LogLevel, Logger, Logging};
use crate::transaction::{Completion, ProducerTransaction, Transaction};

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Capacity of the per-connection event channel.
const EVENT_BUFFER: usize = 16;

/// Characters of the identifier used as the log prefix.
const PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Init = 0,
    Disconnected = 1,
    Connected = 2,
}

impl State {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Disconnected,
            2 => Self::Connected,
            _ => Self::Init,
        }
    }
}

/// The live connection and the handoff into its router.
struct Live {
    conn: Arc<dyn ProducerConn>,
    transactions: mpsc::Sender<Transaction>,
}

struct Inner {
    id: Uuid,
    prefix: String,
    addr: String,
    config: Config,
    connector: Arc<dyn Connector>,
    logging: RwLock<Logging>,

    state: AtomicU8,
    stopped: AtomicBool,
    /// Serializes connect, close and stop.
    guard: Mutex<()>,
    live: RwLock<Option<Live>>,

    exit: CancellationToken,
    routers: TaskTracker,

    submitters: AtomicUsize,
    submitters_idle: Notify,
}

/// Publishes to a single broker over one lazily established connection.
///
/// Cloning is cheap; clones share the connection. The connection is opened on the first
/// publish or [`ping`](Self::ping), re-opened after a failure on the next use, and
/// closed for good by [`stop`](Self::stop).
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    /// Create a producer for the broker at `addr`, connecting over TCP.
    ///
    /// The configuration is validated and copied; later changes to `config` have no
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails validation.
    pub fn new(addr: &str, config: &Config) -> Result<Self> {
        Self::with_connector(addr, config, Arc::new(TcpConnector))
    }

    /// Create a producer that builds its connections with `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails validation.
    pub fn with_connector(
        addr: &str,
        config: &Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let mut prefix = id.simple().to_string();
        prefix.truncate(PREFIX_LEN);

        let routers = TaskTracker::new();
        routers.close();

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                prefix,
                addr: addr.to_string(),
                config: config.clone(),
                connector,
                logging: RwLock::new(Logging::new()),
                state: AtomicU8::new(State::Init as u8),
                stopped: AtomicBool::new(false),
                guard: Mutex::new(()),
                live: RwLock::new(None),
                exit: CancellationToken::new(),
                routers,
                submitters: AtomicUsize::new(0),
                submitters_idle: Notify::new(),
            }),
        })
    }

    /// Address of the broker.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Identifier of this producer, unique per instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Use `logger` for every level and only emit lines at `level` or above.
    ///
    /// Applies to this producer immediately and to connections established afterwards.
    pub fn set_logger(&self, logger: Option<Arc<dyn Logger>>, level: LogLevel) {
        self.inner.logging.write().set_logger(logger, level);
    }

    /// Use `logger` for lines at `level` only.
    pub fn set_logger_for_level(&self, logger: Option<Arc<dyn Logger>>, level: LogLevel) {
        self.inner.logging.write().set_logger_for_level(logger, level);
    }

    /// Only emit lines at `level` or above.
    pub fn set_logger_level(&self, level: LogLevel) {
        self.inner.logging.write().set_level(level);
    }

    /// Connect if needed and send a `NOP`, verifying the broker is reachable.
    ///
    /// # Errors
    ///
    /// Returns the connect or write error.
    pub async fn ping(&self) -> Result<()> {
        self.ping_with_context(&Context::background()).await
    }

    /// [`ping`](Self::ping) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the connect or write error, or the context's error.
    pub async fn ping_with_context(&self, ctx: &Context) -> Result<()> {
        self.send_command(ctx, Command::nop()).await
    }

    /// Publish `body` to `topic` and wait for the broker to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the broker rejects the message, or the error that
    /// kept the message from reaching it.
    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        self.publish_with_context(&Context::background(), topic, body)
            .await
    }

    /// [`publish`](Self::publish) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish), plus the context's error.
    pub async fn publish_with_context(
        &self,
        ctx: &Context,
        topic: &str,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.send_command(ctx, Command::publish(topic, body)).await
    }

    /// Publish a batch of messages to `topic` atomically and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommand`] for an empty batch, otherwise as
    /// [`publish`](Self::publish).
    pub async fn multi_publish<I, B>(&self, topic: &str, bodies: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.multi_publish_with_context(&Context::background(), topic, bodies)
            .await
    }

    /// [`multi_publish`](Self::multi_publish) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`multi_publish`](Self::multi_publish), plus the context's error.
    pub async fn multi_publish_with_context<I, B>(
        &self,
        ctx: &Context,
        topic: &str,
        bodies: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let command = Command::multi_publish(topic, bodies)?;
        self.send_command(ctx, command).await
    }

    /// Publish `body` to `topic`, visible to consumers after `delay`, and wait for the
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    pub async fn deferred_publish(
        &self,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.deferred_publish_with_context(&Context::background(), topic, delay, body)
            .await
    }

    /// [`deferred_publish`](Self::deferred_publish) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`deferred_publish`](Self::deferred_publish), plus the context's error.
    pub async fn deferred_publish_with_context(
        &self,
        ctx: &Context,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.send_command(ctx, Command::deferred_publish(topic, delay, body))
            .await
    }

    /// Queue `body` for `topic` without waiting for the acknowledgement.
    ///
    /// Once the broker answers, a [`ProducerTransaction`] carrying the outcome and `args`
    /// is sent on `done`. With `done` set to `None` the outcome is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be queued; nothing is sent on `done`
    /// in that case.
    pub async fn publish_async<A>(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        A: Send + 'static,
    {
        self.publish_async_with_context(&Context::background(), topic, body, done, args)
            .await
    }

    /// [`publish_async`](Self::publish_async) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`publish_async`](Self::publish_async), plus the context's error.
    pub async fn publish_async_with_context<A>(
        &self,
        ctx: &Context,
        topic: &str,
        body: impl Into<Bytes>,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        A: Send + 'static,
    {
        self.inner
            .send_command_async(ctx, Command::publish(topic, body), completion(done, args))
            .await
    }

    /// Queue a batch for `topic` without waiting for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommand`] for an empty batch, otherwise as
    /// [`publish_async`](Self::publish_async).
    pub async fn multi_publish_async<I, B, A>(
        &self,
        topic: &str,
        bodies: I,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
        A: Send + 'static,
    {
        self.multi_publish_async_with_context(&Context::background(), topic, bodies, done, args)
            .await
    }

    /// [`multi_publish_async`](Self::multi_publish_async) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`multi_publish_async`](Self::multi_publish_async), plus the context's error.
    pub async fn multi_publish_async_with_context<I, B, A>(
        &self,
        ctx: &Context,
        topic: &str,
        bodies: I,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
        A: Send + 'static,
    {
        let command = Command::multi_publish(topic, bodies)?;
        self.inner
            .send_command_async(ctx, command, completion(done, args))
            .await
    }

    /// Queue a deferred message for `topic` without waiting for the acknowledgement.
    ///
    /// # Errors
    ///
    /// As [`publish_async`](Self::publish_async).
    pub async fn deferred_publish_async<A>(
        &self,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        A: Send + 'static,
    {
        self.deferred_publish_async_with_context(
            &Context::background(),
            topic,
            delay,
            body,
            done,
            args,
        )
        .await
    }

    /// [`deferred_publish_async`](Self::deferred_publish_async) bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// As [`publish_async`](Self::publish_async), plus the context's error.
    pub async fn deferred_publish_async_with_context<A>(
        &self,
        ctx: &Context,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
        done: Option<mpsc::Sender<ProducerTransaction<A>>>,
        args: A,
    ) -> Result<()>
    where
        A: Send + 'static,
    {
        let command = Command::deferred_publish(topic, delay, body);
        self.inner
            .send_command_async(ctx, command, completion(done, args))
            .await
    }

    /// Stop the producer for good.
    ///
    /// Closes the connection, fails everything still queued with
    /// [`Error::NotConnected`] and waits until every in-flight call has returned.
    /// Later calls fail with [`Error::Stopped`]. Calling `stop` again returns at once.
    pub async fn stop(&self) {
        let inner = &self.inner;

        let guard = inner.guard.lock().await;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.log(LogLevel::Info, format_args!("({}) stopping", inner.addr));
        inner.exit.cancel();
        inner.close();
        drop(guard);

        inner.routers.wait().await;
        inner.wait_for_submitters().await;
    }

    async fn send_command(&self, ctx: &Context, command: Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .send_command_async(ctx, command, Some(Completion::oneshot(tx)))
            .await?;

        rx.await.map_err(|_| Error::NotConnected)?.map(drop)
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.addr)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.inner.state())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn completion<A>(done: Option<mpsc::Sender<ProducerTransaction<A>>>, args: A) -> Option<Completion>
where
    A: Send + 'static,
{
    done.map(|sender| Completion::channel(sender, args))
}

/// Counts a caller inside the submit path for as long as it lives.
struct Submitter<'a>(&'a Inner);

impl<'a> Submitter<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.submitters.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for Submitter<'_> {
    fn drop(&mut self) {
        if self.0.submitters.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.submitters_idle.notify_waiters();
        }
    }
}

impl Inner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.logging.read().log(level, &self.prefix, args);
    }

    /// Hand `command` to the router. The outcome goes to `completion`.
    async fn send_command_async(
        self: &Arc<Self>,
        ctx: &Context,
        command: Command,
        completion: Option<Completion>,
    ) -> Result<()> {
        let _submitter = Submitter::enter(self);

        if self.state() != State::Connected {
            self.connect(ctx).await?;
        }

        let sender = self
            .live
            .read()
            .as_ref()
            .map(|live| live.transactions.clone());
        let Some(sender) = sender else {
            return Err(Error::NotConnected);
        };

        let transaction = Transaction::new(ctx.clone(), command, completion);
        tokio::select! {
            sent = sender.send(transaction) => sent.map_err(|_| Error::NotConnected),
            () = self.exit.cancelled() => Err(Error::Stopped),
            err = ctx.done() => Err(err),
        }
    }

    async fn connect(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        let _guard = self.guard.lock().await;

        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        match self.state() {
            State::Connected => return Ok(()),
            State::Init => {}
            State::Disconnected => return Err(Error::NotConnected),
        }

        self.log(
            LogLevel::Info,
            format_args!("({}) connecting to nsqd", self.addr),
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let delegate = Arc::new(ProducerConnDelegate::new(Arc::downgrade(self), events_tx));
        let conn = self.connector.new_conn(&self.addr, &self.config, delegate);
        let logging = self.logging.read().clone();
        conn.set_logging(logging, &self.prefix);

        if let Err(err) = conn.connect(ctx).await {
            let _ = conn.close();
            self.log(
                LogLevel::Error,
                format_args!("({}) error connecting to nsqd - {err}", self.addr),
            );
            return Err(err);
        }

        let (transactions_tx, transactions_rx) = mpsc::channel(1);
        *self.live.write() = Some(Live {
            conn: Arc::clone(&conn),
            transactions: transactions_tx,
        });
        self.state.store(State::Connected as u8, Ordering::SeqCst);

        let router = Router::new(
            Arc::downgrade(self),
            self.exit.clone(),
            conn,
            transactions_rx,
            events_rx,
        );
        self.routers.spawn(router.run());

        Ok(())
    }

    /// Close the live connection, if there is one.
    ///
    /// The producer becomes connectable again once its router has drained.
    fn close(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let live = self.live.write().take();
        if let Some(Err(err)) = live.map(|live| live.conn.close()) {
            self.log(
                LogLevel::Error,
                format_args!("({}) error closing connection - {err}", self.addr),
            );
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.routers.wait().await;
            inner
                .state
                .store(State::Init as u8, Ordering::SeqCst);
        });
    }

    async fn wait_for_submitters(&self) {
        loop {
            let mut idle = pin!(self.submitters_idle.notified());
            idle.as_mut().enable();

            if self.submitters.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for Inner {
    /// The last handle is gone without `stop()`: shut the router and connection down.
    fn drop(&mut self) {
        self.exit.cancel();
        if let Some(live) = self.live.get_mut().take() {
            let _ = live.conn.close();
        }
    }
}

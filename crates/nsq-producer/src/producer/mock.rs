//! Scripted in-memory connections for driving the producer deterministically.

use crate::command::Command;
use crate::config::Config;
use crate::conn::{ConnDelegate, Connector, ProducerConn};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::logging::Logging;
use crate::protocol::{IdentifyResponse, OK};

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How the broker treats one command.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    Ok,
    Error(&'static str),
    Silent,
    WriteFails,
}

type Script = dyn Fn(&Command) -> Reply + Send + Sync;

struct Broker {
    script: Box<Script>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    written: Mutex<Vec<String>>,
    conns: Mutex<Vec<Arc<MockConn>>>,
    /// Writes proceed while `true`.
    gate: watch::Sender<bool>,
}

/// Connector whose connections answer commands according to a script, in order.
pub(crate) struct MockConnector {
    broker: Arc<Broker>,
}

impl MockConnector {
    pub(crate) fn new(script: impl Fn(&Command) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::new(Broker {
                script: Box::new(script),
                connects: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
                conns: Mutex::new(Vec::new()),
                gate: watch::channel(true).0,
            }),
        })
    }

    /// Refuse the next `count` connect attempts.
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.broker.failing_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.broker.connects.load(Ordering::SeqCst)
    }

    /// Every command written so far, across connections.
    pub(crate) fn written(&self) -> Vec<String> {
        self.broker.written.lock().clone()
    }

    /// Park every write after it is recorded until [`release_writes`](Self::release_writes).
    pub(crate) fn hold_writes(&self) {
        self.broker.gate.send_replace(false);
    }

    pub(crate) fn release_writes(&self) {
        self.broker.gate.send_replace(true);
    }

    pub(crate) fn last_conn(&self) -> Arc<MockConn> {
        self.broker.conns.lock().last().cloned().unwrap()
    }
}

impl Connector for MockConnector {
    fn new_conn(
        &self,
        addr: &str,
        _config: &Config,
        delegate: Arc<dyn ConnDelegate>,
    ) -> Arc<dyn ProducerConn> {
        let conn = Arc::new(MockConn {
            addr: addr.to_string(),
            broker: Arc::clone(&self.broker),
            delegate,
            ops: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        self.broker.conns.lock().push(Arc::clone(&conn));
        conn
    }
}

enum Op {
    Reply(Reply),
    Respond(Bytes),
    Fail,
}

pub(crate) struct MockConn {
    addr: String,
    broker: Arc<Broker>,
    delegate: Arc<dyn ConnDelegate>,
    ops: Mutex<Option<mpsc::UnboundedSender<Op>>>,
    closed: CancellationToken,
}

impl MockConn {
    /// Deliver a response frame nobody asked for.
    pub(crate) fn respond(&self, data: Bytes) {
        self.push(Op::Respond(data));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Report a transport failure.
    pub(crate) fn fail(&self) {
        self.push(Op::Fail);
    }

    fn push(&self, op: Op) {
        if let Some(ops) = self.ops.lock().as_ref() {
            let _ = ops.send(op);
        }
    }
}

#[async_trait]
impl ProducerConn for MockConn {
    fn set_logging(&self, _logging: Logging, _prefix: &str) {}

    async fn connect(&self, ctx: &Context) -> Result<Option<IdentifyResponse>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .broker
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.ops.lock() = Some(tx);
        tokio::spawn(serve(Arc::clone(&self.delegate), self.closed.clone(), rx));

        Ok(None)
    }

    fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.ops.lock().take();
        Ok(())
    }

    async fn write_command(&self, ctx: &Context, command: &Command) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }

        self.broker.written.lock().push(command.to_string());
        let mut gate = self.broker.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if !command.expects_response() {
            return Ok(());
        }

        let reply = (self.broker.script)(command);
        if matches!(reply, Reply::WriteFails) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.push(Op::Reply(reply));

        Ok(())
    }
}

impl fmt::Display for MockConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

async fn serve(
    delegate: Arc<dyn ConnDelegate>,
    closed: CancellationToken,
    mut ops: mpsc::UnboundedReceiver<Op>,
) {
    loop {
        let op = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            Op::Reply(Reply::Ok) => delegate.on_response(Bytes::from_static(OK)).await,
            Op::Reply(Reply::Error(reason)) => {
                delegate
                    .on_error(Bytes::from_static(reason.as_bytes()))
                    .await;
            }
            Op::Reply(Reply::Silent | Reply::WriteFails) => {}
            Op::Respond(data) => delegate.on_response(data).await,
            Op::Fail => {
                let err = Error::Io(io::ErrorKind::ConnectionReset.into());
                delegate.on_io_error(&err).await;
            }
        }
    }

    delegate.on_close().await;
}

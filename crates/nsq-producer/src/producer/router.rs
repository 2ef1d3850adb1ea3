//! The per-connection event loop.

use super::Inner;
use crate::conn::{ConnDelegate, ProducerConn};
use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::protocol::FrameType;
use crate::transaction::Transaction;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bytes of an unexpected frame shown in the desync log line.
const PREVIEW_LEN: usize = 32;

/// Events a connection reports to its router, in arrival order.
#[derive(Debug)]
pub(super) enum ConnEvent {
    Response(Bytes),
    Error(Bytes),
    Closed,
}

/// Delegate translating connection callbacks into router events.
pub(super) struct ProducerConnDelegate {
    producer: Weak<Inner>,
    events: mpsc::Sender<ConnEvent>,
}

impl ProducerConnDelegate {
    pub(super) const fn new(producer: Weak<Inner>, events: mpsc::Sender<ConnEvent>) -> Self {
        Self { producer, events }
    }

    async fn send(&self, event: ConnEvent) {
        // The router is gone once the connection has been drained.
        let _ = self.events.send(event).await;
    }
}

#[async_trait]
impl ConnDelegate for ProducerConnDelegate {
    async fn on_response(&self, data: Bytes) {
        self.send(ConnEvent::Response(data)).await;
    }

    async fn on_error(&self, data: Bytes) {
        self.send(ConnEvent::Error(data)).await;
    }

    async fn on_heartbeat(&self) {}

    async fn on_io_error(&self, _err: &Error) {
        if let Some(producer) = self.producer.upgrade() {
            producer.close();
        }
    }

    async fn on_close(&self) {
        self.send(ConnEvent::Closed).await;
    }
}

/// Sole writer to a connection and sole owner of its in-flight transactions.
///
/// The backlog holds transactions in the order their commands were written, so the
/// head is always the one the next response or error frame belongs to. The router only
/// holds a weak reference to its producer, so dropping the last producer handle shuts
/// it down.
pub(super) struct Router {
    producer: Weak<Inner>,
    exit: CancellationToken,
    conn: Arc<dyn ProducerConn>,
    transactions: mpsc::Receiver<Transaction>,
    events: mpsc::Receiver<ConnEvent>,
    backlog: VecDeque<Transaction>,
}

impl Router {
    pub(super) fn new(
        producer: Weak<Inner>,
        exit: CancellationToken,
        conn: Arc<dyn ProducerConn>,
        transactions: mpsc::Receiver<Transaction>,
        events: mpsc::Receiver<ConnEvent>,
    ) -> Self {
        Self {
            producer,
            exit,
            conn,
            transactions,
            events,
            backlog: VecDeque::new(),
        }
    }

    pub(super) async fn run(mut self) {
        let exit = self.exit.clone();

        loop {
            tokio::select! {
                Some(transaction) = self.transactions.recv() => self.write(transaction).await,
                event = self.events.recv() => match event {
                    Some(ConnEvent::Response(data)) => {
                        self.pop_transaction(FrameType::Response, data).await;
                    }
                    Some(ConnEvent::Error(data)) => {
                        self.pop_transaction(FrameType::Error, data).await;
                    }
                    Some(ConnEvent::Closed) | None => break,
                },
                () = exit.cancelled() => break,
            }
        }

        // A connection can end without an I/O error being reported first.
        self.close();
        self.transaction_cleanup().await;
        self.log(LogLevel::Info, format_args!("({}) exiting router", self.conn));
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if let Some(producer) = self.producer.upgrade() {
            producer.log(level, args);
        }
    }

    fn close(&self) {
        match self.producer.upgrade() {
            Some(producer) => producer.close(),
            None => {
                let _ = self.conn.close();
            }
        }
    }

    async fn write(&mut self, transaction: Transaction) {
        let result = self
            .conn
            .write_command(&transaction.ctx, &transaction.command)
            .await;

        match result {
            Ok(()) if transaction.command.expects_response() => {
                self.backlog.push_back(transaction);
            }
            Ok(()) => transaction.finish(Ok(Bytes::new())).await,
            Err(err) if err.is_context_error() => transaction.finish(Err(err)).await,
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    format_args!("({}) sending command - {err}", self.conn),
                );
                self.backlog.push_back(transaction);
                self.close();
            }
        }
    }

    async fn pop_transaction(&mut self, frame_type: FrameType, data: Bytes) {
        let Some(transaction) = self.backlog.pop_front() else {
            self.log(
                LogLevel::Error,
                format_args!(
                    "({}) unexpected response type={} len={} data[:32]=0x{}",
                    self.conn,
                    frame_type as i32,
                    data.len(),
                    hex::encode(&data[..data.len().min(PREVIEW_LEN)])
                ),
            );
            self.close();
            return;
        };

        let result: Result<Bytes> = match frame_type {
            FrameType::Error => Err(Error::Protocol(String::from_utf8_lossy(&data).into_owned())),
            FrameType::Response | FrameType::Message => Ok(data),
        };
        transaction.finish(result).await;
    }

    async fn transaction_cleanup(&mut self) {
        for transaction in std::mem::take(&mut self.backlog) {
            transaction.finish(Err(Error::NotConnected)).await;
        }

        // Submitters that already hold a slot still get their transaction through;
        // everyone after the close gets it handed back.
        self.transactions.close();
        while let Some(transaction) = self.transactions.recv().await {
            transaction.finish(Err(Error::NotConnected)).await;
        }
    }
}

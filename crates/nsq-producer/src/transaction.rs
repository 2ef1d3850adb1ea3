//! In-flight publish requests and their completion.

use crate::command::Command;
use crate::context::Context;
use crate::error::{Error, Result};

use std::fmt;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

/// Outcome of an asynchronous publish, delivered on the caller's channel.
pub struct ProducerTransaction<A> {
    /// Raw response data on success, or the reason the command failed.
    pub result: Result<Bytes>,
    /// The arguments passed to the `*_async` call, returned unmodified.
    pub args: A,
}

impl<A> ProducerTransaction<A> {
    /// The error of the command, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

impl<A: fmt::Debug> fmt::Debug for ProducerTransaction<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerTransaction")
            .field("result", &self.result)
            .field("args", &self.args)
            .finish()
    }
}

type Notify = Box<dyn FnOnce(Result<Bytes>) -> BoxFuture<'static, ()> + Send>;

/// Where a transaction's result goes once it is known.
pub(crate) struct Completion(Notify);

impl Completion {
    /// Deliver the bare result on a one-shot channel.
    pub(crate) fn oneshot(sender: oneshot::Sender<Result<Bytes>>) -> Self {
        Self(Box::new(move |result| {
            // The waiting caller may have given up; nothing to do then.
            let _ = sender.send(result);
            async {}.boxed()
        }))
    }

    /// Deliver a [`ProducerTransaction`] echoing `args` on the caller's channel.
    pub(crate) fn channel<A>(sender: mpsc::Sender<ProducerTransaction<A>>, args: A) -> Self
    where
        A: Send + 'static,
    {
        Self(Box::new(move |result| {
            async move {
                let _ = sender.send(ProducerTransaction { result, args }).await;
            }
            .boxed()
        }))
    }
}

/// One command travelling through the router.
///
/// Finishing consumes the transaction, so a result can be delivered at most once.
pub(crate) struct Transaction {
    pub(crate) ctx: Context,
    pub(crate) command: Command,
    completion: Option<Completion>,
}

impl Transaction {
    pub(crate) const fn new(ctx: Context, command: Command, completion: Option<Completion>) -> Self {
        Self {
            ctx,
            command,
            completion,
        }
    }

    /// Attach the result and notify the caller, if anyone is listening.
    pub(crate) async fn finish(self, result: Result<Bytes>) {
        if let Some(Completion(notify)) = self.completion {
            notify(result).await;
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("command", &self.command)
            .field("notifies", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_echoes_args() {
        let (tx, mut rx) = mpsc::channel(1);
        let transaction = Transaction::new(
            Context::background(),
            Command::nop(),
            Some(Completion::channel(tx, ("order", 7))),
        );

        transaction.finish(Ok(Bytes::from_static(b"OK"))).await;

        let done = rx.recv().await.unwrap();
        assert_eq!(done.args, ("order", 7));
        assert_eq!(done.result.unwrap().as_ref(), b"OK");
    }

    #[tokio::test]
    async fn test_finish_without_target_is_silent() {
        let transaction = Transaction::new(Context::background(), Command::nop(), None);

        transaction.finish(Err(Error::NotConnected)).await;
    }

    #[tokio::test]
    async fn test_oneshot_delivers_error() {
        let (tx, rx) = oneshot::channel();
        let transaction = Transaction::new(
            Context::background(),
            Command::nop(),
            Some(Completion::oneshot(tx)),
        );

        transaction.finish(Err(Error::Protocol("E_BAD_BODY".to_string()))).await;

        assert!(matches!(rx.await.unwrap(), Err(Error::Protocol(reason)) if reason == "E_BAD_BODY"));
    }
}

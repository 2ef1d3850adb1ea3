//! Publisher client for the NSQ message queue.
//!
//! A [`Producer`] owns one connection to a single `nsqd` instance. Any number of tasks
//! can publish through it concurrently: commands are written in the order they are
//! handed over, and each response is matched back to the call that issued it.
//!
//! # Features
//!
//! - **Lazy connection**: connects on first use and transparently reconnects after a
//!   failure
//! - **Sync and async publishing**: wait for the acknowledgement, or receive it later on
//!   a channel together with caller-chosen arguments
//! - **Per-call cancellation**: a [`Context`] bounds a single call without disturbing
//!   the shared connection
//! - **Orderly shutdown**: [`Producer::stop`] fails everything still queued and waits
//!   for in-flight calls to return
//!
//! # Example
//!
//! ```no_run
//! use proven_nsq_producer::{Config, Producer};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let producer = Producer::new("127.0.0.1:4150", &Config::default())?;
//!
//!     producer.publish("events", "hello").await?;
//!     producer
//!         .multi_publish("events", vec!["one", "two"])
//!         .await?;
//!
//!     producer.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod command;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod logging;
pub mod protocol;

mod producer;
mod transaction;

pub use config::Config;
pub use context::Context;
pub use error::{ConfigError, Error, Result};
pub use logging::{LogLevel, Logger, Logging, TracingLogger};
pub use producer::Producer;
pub use transaction::ProducerTransaction;

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;

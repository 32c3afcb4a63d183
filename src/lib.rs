//! # Fluentis
//!
//! **Fluentis** is a per-runner event-source engine for TCP networking,
//! built on single-threaded cooperative dispatch queues, together with a
//! task-composition layer whose results thread through runner-bound
//! callbacks.
//!
//! A [`Runner`] is a serial execution context: one thread, one FIFO
//! queue. TCP event sources ([`net::Server`], [`net::Stream`]) register
//! file-descriptor readiness with a process-wide dispatch engine and have
//! their callbacks delivered in order on the runner they are bound to.
//! The [`task`] module composes user callables across runners: a
//! sequence forwards state from step to step, a loop alternates a
//! predicate and a body without ever blocking a queue.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use fluentis::net::{EventSource, Server, ServerHandler};
//! use fluentis::runner::Runner;
//! use std::sync::Arc;
//!
//! let runner = Arc::new(Runner::new("acceptor"));
//! let handler = Arc::new(MyHandler::default());
//! let server = Server::bind(&runner, "127.0.0.1".parse()?, 4040, &handler)?;
//! server.start();
//! ```
//!
//! ## Modules
//!
//! - [`runner`]: cooperative FIFO execution contexts
//! - [`net`]: TCP server and stream event sources
//! - [`task`]: runner-bound task composition (sequence, loop)
//! - [`error`]: the crate's error type

mod dispatch;
mod utils;

pub mod error;
pub mod net;
pub mod runner;
pub mod task;

pub use error::{Error, Result};
pub use net::{EventSource, ReadBuffer, Server, ServerHandler, Stream, StreamEvent, StreamHandler};
pub use runner::{AsRunner, Runner};
pub use task::Task;

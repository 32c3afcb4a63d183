//! Readiness sources on a cooperative dispatch queue.
//!
//! A [`DispatchSource`] watches one direction (read or write) of one file
//! descriptor and delivers readiness callbacks serially on the queue of
//! the runner it is bound to. A process-wide engine thread multiplexes
//! all sources over the platform poller; runners never block on I/O.

mod command;
mod engine;
mod source;

pub(crate) mod poller;

pub(crate) use source::DispatchSource;

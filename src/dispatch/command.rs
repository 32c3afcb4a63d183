use super::source::Shared;

use std::sync::Arc;

/// Commands sent to the dispatch engine thread.
///
/// All source lifecycle state lives on the engine thread; handles only
/// ever enqueue commands. Channel FIFO order is what makes the armed-flag
/// bookkeeping race-free.
pub(crate) enum Command {
    /// Adds a new source to the poller, suspended.
    Register(Arc<Shared>),

    /// Arms the source. Nested resumes are ignored.
    Resume(Arc<Shared>),

    /// Disarms the source without destroying it.
    Suspend(Arc<Shared>),

    /// Requests teardown. Delivery waits until the source is resumed and
    /// any queued event callback has finished.
    Cancel(Arc<Shared>),

    /// Posted by the queue job after an event callback returns, so the
    /// engine can re-arm the descriptor or finish a pending cancel.
    Rearm(Arc<Shared>),
}

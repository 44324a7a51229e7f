//! Task supervision: panics are caught at task boundaries.
//!
//! Every spawned task in the client runs under a supervisor that awaits
//! its join handle. The tokio runtime already confines a panic to the
//! panicking task; the supervisor turns that silent confinement into a
//! logged error and a [`ClientEvent::Fatal`] notification, so consumers
//! learn that part of the core died instead of observing a silent stall.

use std::future::Future;
use std::sync::Arc;

use rvchat_types::event::ClientEvent;
use tokio::task::JoinHandle;

use crate::notify::NotifyBus;

/// Watches an already-spawned task. If it panics, the panic is logged
/// with `context` and surfaced on the bus as [`ClientEvent::Fatal`].
/// Returns the supervisor's handle, which resolves when the task ends.
pub(crate) fn supervise(
    bus: Arc<NotifyBus>,
    context: &'static str,
    task: JoinHandle<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!(context, error = %e, "task panicked");
                bus.publish(&ClientEvent::Fatal {
                    reason: format!("internal panic in {context}: {e}"),
                });
            }
        }
    })
}

/// Spawns `fut` under a supervisor. See [`supervise`].
pub(crate) fn spawn_supervised<F>(
    bus: Arc<NotifyBus>,
    context: &'static str,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    supervise(bus, context, tokio::spawn(fut))
}

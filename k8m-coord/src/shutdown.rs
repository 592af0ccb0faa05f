//! Graceful shutdown driven by process signals
//!
//! [`channel`] registers signal handlers and returns a [`Shutdown`], which
//! waits for a signal and drives shutdown, and a [`Handle`], which is cloned
//! into everything that runs in the background. When a signal is received the
//! handle's token is cancelled and the shutdown completes once every task
//! spawned on the handle's tracker has finished.

use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};
use tracing::{debug, info};

mod signals;

/// Drives shutdown by watching signals.
#[derive(Debug)]
#[must_use = "call `Shutdown::on_signal` to await a signal"]
pub struct Shutdown {
    signals: signals::Signals,
    token: CancellationToken,
    tasks: TaskTracker,
}

/// Observes shutdown and tracks the tasks that must finish before it
/// completes
#[derive(Clone, Debug)]
pub struct Handle {
    token: CancellationToken,
    tasks: TaskTracker,
}

/// Indicates whether shutdown completed gracefully or was forced by a second signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Indicates that shutdown completed gracefully.
    Terminated,

    /// Indicates that shutdown did not complete gracefully.
    Aborted,
}

/// Indicates that signal handlers could not be registered
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

/// Registers `SIGINT` and `SIGTERM` handlers (Ctrl-C and Ctrl-Break on
/// Windows) and creates a shutdown channel.
///
/// Must be called from within a Tokio runtime.
pub fn channel() -> Result<(Shutdown, Handle), RegisterError> {
    let signals = signals::Signals::new()?;
    let token = CancellationToken::new();
    let tasks = TaskTracker::new();
    Ok((
        Shutdown {
            signals,
            token: token.clone(),
            tasks: tasks.clone(),
        },
        Handle { token, tasks },
    ))
}

// === impl Shutdown ===

impl Shutdown {
    /// Waits for a signal (or [`Handle::trigger`]) and drives shutdown.
    ///
    /// If a second signal is received while waiting for tracked tasks to
    /// finish, this future completes immediately and [`Completion::Aborted`]
    /// is returned.
    pub async fn on_signal(self) -> Completion {
        let Self {
            mut signals,
            token,
            tasks,
        } = self;
        tokio::select! {
            _ = signals.recv() => info!("Received shutdown signal; draining"),
            _ = token.cancelled() => debug!("Shutdown triggered"),
        }

        token.cancel();
        tasks.close();
        tokio::select! {
            _ = tasks.wait() => {
                debug!("Drained");
                Completion::Terminated
            }
            _ = signals.recv() => {
                info!("Received second signal; aborting");
                Completion::Aborted
            }
        }
    }
}

// === impl Handle ===

impl Handle {
    /// The token cancelled when shutdown begins
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The tracker whose tasks must finish before shutdown completes
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Begins shutdown without waiting for a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Completes when shutdown begins.
    pub fn signaled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

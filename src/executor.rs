//! Multiplexes branch-runtime tasks over the Tokio runtime handle.
//!
//! Every long-running loop in this crate (advertising sender/receiver,
//! listener accept loop, per-connection read/write loops, heartbeat
//! timers) is spawned through an `Executor` and selects against its
//! `CancellationToken`, so a single `stop()` call tears the whole
//! branch down without each component needing its own shutdown
//! channel.

use std::future::Future;
use std::sync::Mutex;

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owned handle to a pool of cooperatively-scheduled tasks.
///
/// Unlike the Boost.Asio `io_context` this mirrors, there is no
/// meaningful single-threaded `run`/`run_one`/`poll`/`poll_one` on top
/// of the ambient multi-threaded Tokio runtime; callers simply `spawn`
/// and `stop`. `wait_for_stopped` blocks until every spawned task has
/// observed cancellation and exited.
pub struct Executor {
    handle: Handle,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            handle: Handle::current(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns a task that is torn down when the executor is stopped.
    /// The task is responsible for selecting on the cancellation token
    /// it can retrieve via `cancellation_token()`.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().expect("executor task set poisoned");
        tasks.spawn_on(fut, &self.handle);
    }

    /// Requests cancellation of every task spawned on this executor.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Awaits completion of every spawned task. Intended to be called
    /// after `stop()`; tasks that never observe cancellation will hang
    /// this call, which is considered a bug in that task.
    pub async fn wait_for_stopped(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().expect("executor task set poisoned");
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        while tasks.join_next().await.is_some() {}
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

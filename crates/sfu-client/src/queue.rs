//! Serial task queue
//!
//! Runs enqueued futures one at a time in submission order. A failing or
//! panicking task is logged and the queue moves on.

use crate::error::ClientError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

type Task = BoxFuture<'static, Result<(), ClientError>>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    running: bool,
}

#[derive(Clone, Default)]
pub struct SerialTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SerialTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task; starts draining if the queue was idle
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let start = {
            let mut state = lock(&self.state);
            state.tasks.push_back(Box::pin(task));
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            let state = self.state.clone();
            tokio::spawn(drain(state));
        }
    }

    /// Discard tasks that have not started yet; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = lock(&self.state);
        let dropped = state.tasks.len();
        state.tasks.clear();
        dropped
    }

    /// Tasks waiting to run
    pub fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn drain(state: Arc<Mutex<QueueState>>) {
    loop {
        let next = {
            let mut guard = lock(&state);
            match guard.tasks.pop_front() {
                Some(task) => task,
                None => {
                    guard.running = false;
                    return;
                }
            }
        };

        match AssertUnwindSafe(next).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Queued task failed: {}", e),
            Err(_) => tracing::error!("Queued task panicked"),
        }
    }
}

//! Worker thread management
//!
//! Workers are named OS threads. `spawn` does not return until the new
//! thread has reported its kernel thread id, so callers can publish the id
//! (for task affinity) before the worker starts taking tasks.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use fibrio_core::error::WorkerError;
use fibrio_core::{kwarn, thread_id, ThreadId};

/// Pool of worker threads
#[derive(Default)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a named worker running `f`, returning its thread id
    pub fn spawn<F>(&mut self, name: String, f: F) -> Result<ThreadId, WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _ = tx.send(thread_id());
                f();
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let tid = rx.recv().map_err(|_| WorkerError::Rendezvous)?;
        self.handles.push(handle);
        Ok(tid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Detach the handles so they can be joined without holding a lock
    pub fn take(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}

/// Wait for all workers to finish
pub fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("?").to_string();
        if handle.join().is_err() {
            kwarn!(target: "system", "worker {} exited by panic", name);
        }
    }
}

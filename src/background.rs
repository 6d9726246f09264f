//! Periodic background work
//!
//! Adaptive retuning and detector re-ranking both run on a fixed cadence.
//! Each runs on its own thread driven by a crossbeam ticker; the handle owns
//! the shutdown channel and joins the thread on stop or drop.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

/// Handle to a running periodic task
pub struct BackgroundTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `work` on `owner` every `interval` until stopped
    ///
    /// Only a weak reference is held, so the task ends by itself once the
    /// owner is dropped.
    pub fn spawn<T, F>(
        name: impl Into<String>,
        interval: Duration,
        owner: &Arc<T>,
        work: F,
    ) -> std::io::Result<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let name = name.into();
        let weak: Weak<T> = Arc::downgrade(owner);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::debug!("Background task {} started", thread_name);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            match weak.upgrade() {
                                Some(owner) => work(&owner),
                                None => break,
                            }
                        }
                    }
                }
                tracing::debug!("Background task {} stopped", thread_name);
            })?;

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            // A task dropped from inside its own work callback cannot join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}

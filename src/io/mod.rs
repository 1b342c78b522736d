// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled dispatch or timeout.
///
/// Cancelling (or dropping) the handle before the callback fires guarantees
/// it will not run; the firing side checks the flag last.
#[derive(Debug)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
    detached: bool,
}

impl ScheduledHandle {
    fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            cancelled,
            detached: false,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Lets the callback outlive the handle.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for ScheduledHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

/// Serializes callbacks onto one driver task.
///
/// `dispatch` is the only legal cross-thread entry point into the engine;
/// everything else lives on the driver. Timeouts are tokio timers that
/// re-enter through the same queue, so timer callbacks interleave with
/// dispatched ones in arrival order.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<(Arc<AtomicBool>, Callback)>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Creates the dispatcher and its driver future. The caller spawns the
    /// driver wherever the engine runs.
    pub fn new() -> (Self, impl Future<Output = ()> + Send) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<AtomicBool>, Callback)>();
        let shutdown = CancellationToken::new();
        let shutdown_driver = shutdown.clone();

        let driver = async move {
            loop {
                tokio::select! {
                    _ = shutdown_driver.cancelled() => break,
                    item = rx.recv() => {
                        let Some((cancelled, cb)) = item else { break };
                        if !cancelled.load(Ordering::SeqCst) {
                            cb();
                        }
                    }
                }
            }
            trace!("dispatcher driver stopped");
        };

        (Self { tx, shutdown }, driver)
    }

    /// Schedules `cb` on the next driver turn. Callable from any thread.
    pub fn dispatch<F>(&self, cb: F) -> ScheduledHandle
    where F: FnOnce() + Send + 'static {
        let cancelled = Arc::new(AtomicBool::new(false));
        let _ = self.tx.send((Arc::clone(&cancelled), Box::new(cb)));
        ScheduledHandle::new(cancelled)
    }

    /// Runs `cb` on the driver after `delay`, unless cancelled first.
    pub fn add_timeout<F>(&self, delay: Duration, cb: F) -> ScheduledHandle
    where F: FnOnce() + Send + 'static {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle_flag = Arc::clone(&cancelled);
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {},
                _ = tokio::time::sleep(delay) => {
                    if !cancelled.load(Ordering::SeqCst) {
                        let _ = tx.send((cancelled, Box::new(cb)));
                    }
                }
            }
        });
        ScheduledHandle::new(handle_flag)
    }

    /// Stops the driver; pending callbacks are discarded.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

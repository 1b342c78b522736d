// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write as _,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use rand::RngExt;

/// A synchronous observer list.
///
/// Handlers run on the emitting stack, in connection order. A handler that
/// wants to defer work must schedule it through the dispatcher explicitly.
pub struct Signal<T: ?Sized> {
    slots: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Default for Signal<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: ?Sized> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; returns an id for [`Signal::disconnect`].
    pub fn connect<F>(&self, f: F) -> u64
    where F: Fn(&T) + Send + Sync + 'static {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .expect("signal slots poisoned")
            .push((id, Arc::new(f)));
        id
    }

    pub fn disconnect(&self, id: u64) {
        self.slots
            .lock()
            .expect("signal slots poisoned")
            .retain(|(slot_id, _)| *slot_id != id);
    }

    /// Invokes every connected handler synchronously.
    ///
    /// The slot list is snapshotted first so that handlers may connect or
    /// disconnect while the emission is running.
    pub fn emit(&self, arg: &T) {
        let snapshot: Vec<_> = self
            .slots
            .lock()
            .expect("signal slots poisoned")
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for f in snapshot {
            f(arg);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().expect("signal slots poisoned").is_empty()
    }
}

impl<T: ?Sized> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}

/// Generates a random group-name suffix (8 lowercase hex chars) used to make
/// per-subscription synchronization group names unique on a connection.
pub fn generate_group_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill(&mut bytes);

    let mut hex = String::with_capacity(8);
    for byte in &bytes {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod sync;
pub mod users;

use crate::util::Signal;

/// Session lifecycle.
///
/// `PreSync` before any content arrived, `Synchronizing` while the state
/// transfer of §sync runs, `Running` once live, `Closed` forever after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    PreSync,
    Synchronizing,
    Running,
    Closed,
}

/// Observer slots common to every session type.
#[derive(Debug, Default)]
pub struct SessionSignals {
    /// Fired exactly once when the session closes.
    pub closed: Signal<()>,
    /// Synchronization finished and the session went `Running`.
    pub synchronization_complete: Signal<()>,
    /// Synchronization failed; the session is unusable.
    pub synchronization_failed: Signal<String>,
    /// A fatal session error (apply failure, protocol violation).
    pub error: Signal<String>,
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{algorithm::state_vector::StateVector, operation::Operation};

/// What a request does.
///
/// `Undo` and `Redo` are self-referential: they carry no operation and
/// resolve their target through the request log at transformation time.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Do(Operation),
    Undo,
    Redo,
}

impl RequestKind {
    pub fn element_name(&self) -> &'static str {
        match self {
            RequestKind::Do(_) => "do",
            RequestKind::Undo => "undo",
            RequestKind::Redo => "redo",
        }
    }
}

/// The unit of wire transmission and log storage: a do/undo/redo tagged
/// with its issuing user and the state vector at which it was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub user: u32,
    pub vector: StateVector,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(user: u32, vector: StateVector, kind: RequestKind) -> Self {
        Self { user, vector, kind }
    }

    pub fn operation(&self) -> Option<&Operation> {
        match &self.kind {
            RequestKind::Do(op) => Some(op),
            _ => None,
        }
    }
}

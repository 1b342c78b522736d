// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod group;
pub mod method;
pub mod registry;

use std::sync::Arc;

use crate::{transport::Connection, xml::XmlNode};

/// Receiver side of a communication group.
///
/// The target is held weakly by its group (sessions and the directory own
/// their groups, not the other way around).
pub trait GroupTarget: Send + Sync {
    /// An inbound stanza addressed to the group.
    fn received(&self, from: &Arc<dyn Connection>, node: &XmlNode);

    /// The stanza left the registry queue for the transport; it can no
    /// longer be cancelled.
    fn enqueued(&self, _node: &XmlNode) {}

    /// The stanza was written to the wire.
    fn sent(&self, _node: &XmlNode) {}
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{
    comm::group::CommunicationGroup,
    transport::Connection,
    xml::XmlNode,
};

/// Per-(connection, group) outbound queue state.
#[derive(Default)]
struct OutQueue {
    /// Stanzas not yet handed to the transport; cancellable.
    pending: VecDeque<XmlNode>,
    /// While true, new sends accumulate in `pending` instead of flushing.
    blocked: bool,
}

/// Per-connection multiplexing of named groups plus the outbound queues.
///
/// Every inbound stanza carries a `<group name="…" publisher="…">` wrapper;
/// the registry dispatches its children to the matching group. Stanzas for
/// an unknown group are dropped with a log entry.
pub struct CommunicationManager {
    connections: DashMap<String, Arc<dyn Connection>>,
    /// `(connection id, group name) → group`, held weakly.
    groups: DashMap<(String, String), Weak<CommunicationGroup>>,
    queues: DashMap<(String, String), Mutex<OutQueue>>,
}

impl Default for CommunicationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    /// Registers a connection and hooks its receive path into the
    /// dispatcher.
    pub fn register(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let id = conn.remote_id().to_string();
        if self.connections.contains_key(&id) {
            return;
        }
        self.connections.insert(id.clone(), Arc::clone(&conn));

        let manager = Arc::downgrade(self);
        let conn_weak = Arc::downgrade(&conn);
        conn.received().connect(move |node| {
            if let (Some(manager), Some(conn)) = (manager.upgrade(), conn_weak.upgrade())
            {
                manager.dispatch(&conn, node);
            }
        });
    }

    pub fn unregister(&self, conn_id: &str) {
        self.connections.remove(conn_id);
        self.groups.retain(|(c, _), _| c != conn_id);
        self.queues.retain(|(c, _), _| c != conn_id);
    }

    pub fn connection(&self, conn_id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(conn_id).map(|c| Arc::clone(&c))
    }

    /// Associates `group` with stanzas arriving on `conn`.
    pub fn bind(&self, conn_id: &str, group: &Arc<CommunicationGroup>) {
        self.groups.insert(
            (conn_id.to_string(), group.name().to_string()),
            Arc::downgrade(group),
        );
    }

    pub fn unbind(&self, conn_id: &str, group_name: &str) {
        self.groups
            .remove(&(conn_id.to_string(), group_name.to_string()));
        self.queues
            .remove(&(conn_id.to_string(), group_name.to_string()));
    }

    fn dispatch(&self, conn: &Arc<dyn Connection>, node: &XmlNode) {
        if node.name != "group" {
            debug!(stanza = %node.name, "stanza without group wrapper dropped");
            return;
        }
        let Some(name) = node.get_attr("name") else {
            debug!("group wrapper without name dropped");
            return;
        };

        let key = (conn.remote_id().to_string(), name.to_string());
        let Some(group) = self.groups.get(&key).and_then(|g| g.upgrade()) else {
            debug!(group = name, "stanza for unknown group dropped");
            return;
        };

        for child in node.elements() {
            group.deliver(conn, child);
        }
    }

    /// Enqueues a stanza for `(conn, group)`. FIFO within the pair; the
    /// group's `enqueued`/`sent` hooks tie the wire events back to the
    /// sender.
    pub fn send(
        &self,
        conn: &Arc<dyn Connection>,
        group: &Arc<CommunicationGroup>,
        node: XmlNode,
    ) {
        let key = (
            conn.remote_id().to_string(),
            group.name().to_string(),
        );
        let queue_entry = self
            .queues
            .entry(key)
            .or_insert_with(|| Mutex::new(OutQueue::default()));
        let mut queue = queue_entry.lock().expect("queue poisoned");
        queue.pending.push_back(node);
        if !queue.blocked {
            Self::flush_locked(&mut queue, conn, group);
        }
    }

    /// Holds further traffic for `(conn, group)` in the pending queue.
    pub fn block_queue(&self, conn_id: &str, group_name: &str) {
        let key = (conn_id.to_string(), group_name.to_string());
        let queue_entry = self
            .queues
            .entry(key)
            .or_insert_with(|| Mutex::new(OutQueue::default()));
        queue_entry.lock().expect("queue poisoned").blocked = true;
    }

    /// Releases a held queue, flushing everything in order.
    pub fn unblock_queue(
        &self,
        conn: &Arc<dyn Connection>,
        group: &Arc<CommunicationGroup>,
    ) {
        let key = (
            conn.remote_id().to_string(),
            group.name().to_string(),
        );
        if let Some(queue_entry) = self.queues.get(&key) {
            let mut queue = queue_entry.lock().expect("queue poisoned");
            queue.blocked = false;
            Self::flush_locked(&mut queue, conn, group);
        }
    }

    fn flush_locked(
        queue: &mut OutQueue,
        conn: &Arc<dyn Connection>,
        group: &Arc<CommunicationGroup>,
    ) {
        while let Some(node) = queue.pending.pop_front() {
            let wrapped = XmlNode::new("group")
                .attr("name", group.name())
                .attr("publisher", group.publisher())
                .child(node.clone());

            let sent_group = Arc::downgrade(group);
            let sent_node = node.clone();
            conn.enqueue(
                &wrapped,
                Some(Arc::new(move || {
                    if let Some(group) = sent_group.upgrade() {
                        group.notify_sent(&sent_node);
                    }
                })),
            );
            group.notify_enqueued(&node);
            trace!(group = group.name(), to = conn.remote_id(), "stanza enqueued");
        }
    }

    /// Drops every stanza still cancellable (not yet handed to the
    /// transport) for `conn`.
    pub fn cancel_messages(&self, conn_id: &str) {
        for entry in self.queues.iter() {
            if entry.key().0 == conn_id {
                entry.value().lock().expect("queue poisoned").pending.clear();
            }
        }
    }
}

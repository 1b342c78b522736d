// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex, Weak};

use crate::{
    transport::{Connection, ConnectionStatus, SentCallback},
    util::Signal,
    xml::XmlNode,
};

/// An in-memory connection for tests: stanzas queue locally until
/// [`SimulatedConnection::flush`] pumps them synchronously into the peer's
/// receive path.
pub struct SimulatedConnection {
    local: String,
    remote: String,
    status: Mutex<ConnectionStatus>,
    queue: Mutex<Vec<(XmlNode, Option<SentCallback>)>>,
    peer: Mutex<Weak<SimulatedConnection>>,
    received_signal: Signal<XmlNode>,
    status_signal: Signal<ConnectionStatus>,
    account_name: Mutex<Option<String>>,
    certificate: Mutex<Option<Vec<u8>>>,
}

impl SimulatedConnection {
    /// Creates two linked endpoints.
    pub fn pair(
        a: impl Into<String>,
        b: impl Into<String>,
    ) -> (Arc<Self>, Arc<Self>) {
        let a_name = a.into();
        let b_name = b.into();
        let left = Arc::new(Self::endpoint(a_name.clone(), b_name.clone()));
        let right = Arc::new(Self::endpoint(b_name, a_name));
        *left.peer.lock().expect("peer slot poisoned") = Arc::downgrade(&right);
        *right.peer.lock().expect("peer slot poisoned") = Arc::downgrade(&left);
        (left, right)
    }

    fn endpoint(local: String, remote: String) -> Self {
        Self {
            local,
            remote,
            status: Mutex::new(ConnectionStatus::Open),
            queue: Mutex::new(Vec::new()),
            peer: Mutex::new(Weak::new()),
            received_signal: Signal::new(),
            status_signal: Signal::new(),
            account_name: Mutex::new(None),
            certificate: Mutex::new(None),
        }
    }

    /// Sets the account this endpoint authenticates as (test fixture).
    pub fn set_account(&self, account: impl Into<String>) {
        *self.account_name.lock().expect("account poisoned") = Some(account.into());
    }

    pub fn set_peer_certificate(&self, der: Vec<u8>) {
        *self.certificate.lock().expect("certificate poisoned") = Some(der);
    }

    /// Delivers every queued stanza into the peer, in order, on this stack.
    pub fn flush(&self) {
        let items: Vec<_> = std::mem::take(
            &mut *self.queue.lock().expect("queue poisoned"),
        );
        let peer = self.peer.lock().expect("peer slot poisoned").upgrade();
        for (node, sent) in items {
            if let Some(peer) = &peer {
                peer.received_signal.emit(&node);
            }
            if let Some(sent) = sent {
                sent();
            }
        }
    }

    /// Number of stanzas waiting for a flush.
    pub fn queued(&self) -> usize {
        self.queue.lock().expect("queue poisoned").len()
    }
}

impl Connection for SimulatedConnection {
    fn network(&self) -> &str {
        "simulated"
    }

    fn local_id(&self) -> &str {
        &self.local
    }

    fn remote_id(&self) -> &str {
        &self.remote
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status poisoned")
    }

    fn enqueue(&self, node: &XmlNode, sent: Option<SentCallback>) {
        if self.status() != ConnectionStatus::Open {
            return;
        }
        self.queue
            .lock()
            .expect("queue poisoned")
            .push((node.clone(), sent));
    }

    fn received(&self) -> &Signal<XmlNode> {
        &self.received_signal
    }

    fn status_changed(&self) -> &Signal<ConnectionStatus> {
        &self.status_signal
    }

    fn close(&self) {
        {
            let mut status = self.status.lock().expect("status poisoned");
            if *status == ConnectionStatus::Closed {
                return;
            }
            *status = ConnectionStatus::Closed;
        }
        self.queue.lock().expect("queue poisoned").clear();
        self.status_signal.emit(&ConnectionStatus::Closed);

        if let Some(peer) = self.peer.lock().expect("peer slot poisoned").upgrade()
            && peer.status() != ConnectionStatus::Closed
        {
            peer.close();
        }
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.certificate.lock().expect("certificate poisoned").clone()
    }

    fn account(&self) -> Option<String> {
        self.account_name.lock().expect("account poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_flush_delivers_in_order() {
        let (a, b) = SimulatedConnection::pair("left", "right");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        b.received().connect(move |node| {
            seen2.lock().expect("seen").push(node.name.clone());
        });

        a.enqueue(&XmlNode::new("one"), None);
        a.enqueue(&XmlNode::new("two"), None);
        assert_eq!(a.queued(), 2);
        assert!(seen.lock().expect("seen").is_empty(), "nothing before flush");

        a.flush();
        assert_eq!(*seen.lock().expect("seen"), vec!["one", "two"]);
    }

    #[test]
    fn test_sent_hook_fires_on_flush() {
        let (a, _b) = SimulatedConnection::pair("left", "right");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        a.enqueue(
            &XmlNode::new("ping"),
            Some(Arc::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        a.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_propagates_and_drops_queue() {
        let (a, b) = SimulatedConnection::pair("left", "right");
        a.enqueue(&XmlNode::new("lost"), None);
        a.close();

        assert_eq!(a.status(), ConnectionStatus::Closed);
        assert_eq!(b.status(), ConnectionStatus::Closed);
        assert_eq!(a.queued(), 0);
        a.enqueue(&XmlNode::new("ignored"), None);
        assert_eq!(a.queued(), 0);
    }
}

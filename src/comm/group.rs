// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::{
    comm::{GroupTarget, method::CommunicationMethod, registry::CommunicationManager},
    transport::Connection,
    xml::XmlNode,
};

/// A named, potentially multi-connection channel with a designated
/// publisher and a target receiving inbound stanzas.
pub struct CommunicationGroup {
    name: String,
    /// Publisher identity as it appears in the wrapper: `"me"` when this
    /// process publishes, otherwise the publisher's connection id.
    publisher: String,
    /// Acceptable methods in preference order.
    methods: Vec<String>,
    manager: Weak<CommunicationManager>,
    target: Mutex<Weak<dyn GroupTarget>>,
    method: Mutex<Option<Arc<dyn CommunicationMethod>>>,
}

impl CommunicationGroup {
    /// Opens a group published by this process.
    pub fn open(
        manager: &Arc<CommunicationManager>,
        name: impl Into<String>,
        methods: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            publisher: "me".to_string(),
            methods,
            manager: Arc::downgrade(manager),
            target: Mutex::new(Weak::<NullTarget>::new() as Weak<dyn GroupTarget>),
            method: Mutex::new(None),
        })
    }

    /// Joins a group published by a remote peer.
    pub fn join(
        manager: &Arc<CommunicationManager>,
        name: impl Into<String>,
        publisher: &Arc<dyn Connection>,
        methods: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            publisher: publisher.remote_id().to_string(),
            methods,
            manager: Arc::downgrade(manager),
            target: Mutex::new(Weak::<NullTarget>::new() as Weak<dyn GroupTarget>),
            method: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn is_publisher(&self) -> bool {
        self.publisher == "me"
    }

    pub fn set_target(&self, target: &Arc<dyn GroupTarget>) {
        *self.target.lock().expect("target poisoned") = Arc::downgrade(target);
    }

    pub fn clear_target(&self) {
        *self.target.lock().expect("target poisoned") =
            Weak::<NullTarget>::new() as Weak<dyn GroupTarget>;
    }

    pub fn set_method(&self, method: Arc<dyn CommunicationMethod>) {
        *self.method.lock().expect("method poisoned") = Some(method);
    }

    pub fn method(&self) -> Option<Arc<dyn CommunicationMethod>> {
        self.method.lock().expect("method poisoned").clone()
    }

    pub fn manager(&self) -> Option<Arc<CommunicationManager>> {
        self.manager.upgrade()
    }

    fn target(&self) -> Option<Arc<dyn GroupTarget>> {
        self.target.lock().expect("target poisoned").upgrade()
    }

    /// Inbound stanza from the registry: let the routing method relay it if
    /// needed, then hand it to the target.
    pub fn deliver(self: &Arc<Self>, from: &Arc<dyn Connection>, node: &XmlNode) {
        if let Some(method) = self.method() {
            method.relay(self, from, node);
        }
        match self.target() {
            Some(target) => target.received(from, node),
            None => debug!(group = %self.name, "stanza for dropped target"),
        }
    }

    /// Unicast; never blocks.
    pub fn send_single(self: &Arc<Self>, to: &Arc<dyn Connection>, node: XmlNode) {
        if let Some(method) = self.method() {
            method.send_single(self, to, node);
        }
    }

    /// Multicast per the routing method; never blocks.
    pub fn send_all(self: &Arc<Self>, except: Option<&str>, node: XmlNode) {
        if let Some(method) = self.method() {
            method.send_all(self, except, node);
        }
    }

    pub fn notify_enqueued(&self, node: &XmlNode) {
        if let Some(target) = self.target() {
            target.enqueued(node);
        }
    }

    pub fn notify_sent(&self, node: &XmlNode) {
        if let Some(target) = self.target() {
            target.sent(node);
        }
    }
}

struct NullTarget;
impl GroupTarget for NullTarget {
    fn received(&self, _from: &Arc<dyn Connection>, _node: &XmlNode) {}
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    comm::group::CommunicationGroup,
    transport::Connection,
    xml::XmlNode,
};

/// Routing policy for one network within one group.
pub trait CommunicationMethod: Send + Sync {
    /// Wire name of the method (`"central"`).
    fn name(&self) -> &'static str;

    /// Network tag this method routes for.
    fn network(&self) -> &str;

    fn add_member(&self, conn: Arc<dyn Connection>);
    fn remove_member(&self, conn_id: &str);
    fn members(&self) -> Vec<Arc<dyn Connection>>;
    fn is_member(&self, conn_id: &str) -> bool;

    fn send_single(
        &self,
        group: &Arc<CommunicationGroup>,
        to: &Arc<dyn Connection>,
        node: XmlNode,
    );

    fn send_all(
        &self,
        group: &Arc<CommunicationGroup>,
        except: Option<&str>,
        node: XmlNode,
    );

    /// Called for every inbound stanza before target delivery; the central
    /// method uses this to re-broadcast member traffic at the publisher.
    fn relay(
        &self,
        group: &Arc<CommunicationGroup>,
        from: &Arc<dyn Connection>,
        node: &XmlNode,
    );
}

/// Star routing: the publisher relays everything.
///
/// At the publisher `send-all` multicasts directly; at a joined member it
/// unicasts to the publisher, which re-broadcasts. This buys a total order
/// of messages across the group for one extra hop.
pub struct CentralMethod {
    network: String,
    members: Mutex<Vec<Arc<dyn Connection>>>,
    /// The publisher connection on joined groups; `None` when this process
    /// is the publisher.
    publisher_conn: Option<Arc<dyn Connection>>,
}

impl CentralMethod {
    pub fn for_publisher(network: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            network: network.into(),
            members: Mutex::new(Vec::new()),
            publisher_conn: None,
        })
    }

    pub fn for_joined(
        network: impl Into<String>,
        publisher: Arc<dyn Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            network: network.into(),
            members: Mutex::new(vec![Arc::clone(&publisher)]),
            publisher_conn: Some(publisher),
        })
    }

    fn enqueue_to(
        &self,
        group: &Arc<CommunicationGroup>,
        conn: &Arc<dyn Connection>,
        node: XmlNode,
    ) {
        if let Some(manager) = group.manager() {
            manager.send(conn, group, node);
        }
    }
}

impl CommunicationMethod for CentralMethod {
    fn name(&self) -> &'static str {
        "central"
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn add_member(&self, conn: Arc<dyn Connection>) {
        let mut members = self.members.lock().expect("members poisoned");
        if !members.iter().any(|m| m.remote_id() == conn.remote_id()) {
            members.push(conn);
        }
    }

    fn remove_member(&self, conn_id: &str) {
        self.members
            .lock()
            .expect("members poisoned")
            .retain(|m| m.remote_id() != conn_id);
    }

    fn members(&self) -> Vec<Arc<dyn Connection>> {
        self.members.lock().expect("members poisoned").clone()
    }

    fn is_member(&self, conn_id: &str) -> bool {
        self.members
            .lock()
            .expect("members poisoned")
            .iter()
            .any(|m| m.remote_id() == conn_id)
    }

    fn send_single(
        &self,
        group: &Arc<CommunicationGroup>,
        to: &Arc<dyn Connection>,
        node: XmlNode,
    ) {
        self.enqueue_to(group, to, node);
    }

    fn send_all(
        &self,
        group: &Arc<CommunicationGroup>,
        except: Option<&str>,
        node: XmlNode,
    ) {
        match &self.publisher_conn {
            // Joined member: everything goes through the star center.
            Some(publisher) => {
                if except != Some(publisher.remote_id()) {
                    self.enqueue_to(group, publisher, node);
                }
            },
            // Publisher: multicast to every other member.
            None => {
                for member in self.members() {
                    if Some(member.remote_id()) == except {
                        continue;
                    }
                    self.enqueue_to(group, &member, node.clone());
                }
            },
        }
    }

    fn relay(
        &self,
        group: &Arc<CommunicationGroup>,
        from: &Arc<dyn Connection>,
        node: &XmlNode,
    ) {
        // Only the star center re-broadcasts.
        if self.publisher_conn.is_some() {
            return;
        }
        if !self.is_member(from.remote_id()) {
            debug!(group = group.name(), from = from.remote_id(), "relay from non-member");
            return;
        }
        for member in self.members() {
            if member.remote_id() == from.remote_id() {
                continue;
            }
            self.enqueue_to(group, &member, node.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        comm::{GroupTarget, registry::CommunicationManager},
        transport::simulated::SimulatedConnection,
    };

    struct CountingTarget {
        received: AtomicUsize,
    }

    impl GroupTarget for CountingTarget {
        fn received(&self, _from: &Arc<dyn Connection>, _node: &XmlNode) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_central_relay_at_publisher() {
        let manager = Arc::new(CommunicationManager::new());

        // Publisher side with two members attached; the `member_*` halves
        // are what the server holds, the `remote_*` halves play the peers.
        let (member_a, remote_a) = SimulatedConnection::pair("server", "alice");
        let (member_b, remote_b) = SimulatedConnection::pair("server", "bob");
        let conn_a: Arc<dyn Connection> = member_a.clone();
        let conn_b: Arc<dyn Connection> = member_b.clone();
        manager.register(conn_a.clone());
        manager.register(conn_b.clone());

        let group = CommunicationGroup::open(&manager, "InfSession_1", vec![
            "central".to_string(),
        ]);
        let method = CentralMethod::for_publisher("simulated");
        method.add_member(conn_a.clone());
        method.add_member(conn_b.clone());
        group.set_method(method);
        manager.bind(conn_a.remote_id(), &group);
        manager.bind(conn_b.remote_id(), &group);

        let target = Arc::new(CountingTarget {
            received: AtomicUsize::new(0),
        });
        let target_dyn: Arc<dyn GroupTarget> = target.clone();
        group.set_target(&target_dyn);

        // A stanza from alice is delivered to the target and re-broadcast
        // to bob (but not back to alice).
        let wrapper = XmlNode::new("group")
            .attr("name", "InfSession_1")
            .attr("publisher", "me")
            .child(XmlNode::new("request").attr("user", 1));
        remote_a.enqueue(&wrapper, None);
        remote_a.flush();

        assert_eq!(target.received.load(Ordering::SeqCst), 1);
        assert_eq!(member_b.queued(), 1, "relay copy waits on bob's pipe");
        assert_eq!(member_a.queued(), 0, "no echo back to the sender");

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        remote_b.received().connect(move |node| {
            assert_eq!(node.name, "group");
            assert_eq!(node.get_attr("name"), Some("InfSession_1"));
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        member_b.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_joined_member_sends_via_publisher() {
        let manager = Arc::new(CommunicationManager::new());

        let (to_publisher, publisher_side) =
            SimulatedConnection::pair("alice", "server");
        let conn: Arc<dyn Connection> = to_publisher.clone();
        manager.register(conn.clone());

        let group =
            CommunicationGroup::join(&manager, "InfSession_1", &conn, vec![
                "central".to_string(),
            ]);
        group.set_method(CentralMethod::for_joined("simulated", conn.clone()));
        manager.bind(conn.remote_id(), &group);

        group.send_all(None, XmlNode::new("request").attr("user", 2));
        assert_eq!(to_publisher.queued(), 1, "unicast to the star center");

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        publisher_side.received().connect(move |node| {
            assert_eq!(node.get_attr("publisher"), Some("server"));
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        to_publisher.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

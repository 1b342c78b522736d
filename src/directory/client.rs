// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    acl::SheetSet,
    comm::{
        GroupTarget,
        group::CommunicationGroup,
        method::{CentralMethod, CommunicationMethod},
        registry::CommunicationManager,
    },
    directory::{
        DIRECTORY_GROUP, NODE_TYPE_SUBDIRECTORY,
        node::{NodeKind, NodeTree},
    },
    error::RequestError,
    text::{buffer::DefaultTextBuffer, session::TextSession},
    transport::{Connection, ConnectionStatus},
    util::Signal,
    xml::XmlNode,
};

/// Kinds of asynchronous directory requests a client can have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Explore,
    AddNode,
    RemoveNode,
    RenameNode,
    Subscribe,
    QueryAcl,
    SetAcl,
    QueryAccountList,
    CreateAccount,
    RemoveAccount,
}

/// What a finished request resolved to.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// The affected (or created) node.
    Node(u64),
    Acl(SheetSet),
    Accounts(Vec<(String, Option<String>)>),
    Done,
}

/// A first-class pending request: callers watch `finished`, the directory
/// deduplicates concurrent issues, and cancellation is best effort (a
/// response arriving after `cancel` is discarded).
pub struct PendingRequest {
    pub seq: u32,
    pub request_type: RequestType,
    pub node: u64,
    cancelled: AtomicBool,
    result: Mutex<Option<Result<RequestOutcome, String>>>,
    pub finished: Signal<Result<RequestOutcome, String>>,
}

impl PendingRequest {
    fn new(seq: u32, request_type: RequestType, node: u64) -> Arc<Self> {
        Arc::new(Self {
            seq,
            request_type,
            node,
            cancelled: AtomicBool::new(false),
            result: Mutex::new(None),
            finished: Signal::new(),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn result(&self) -> Option<Result<RequestOutcome, String>> {
        self.result.lock().expect("result poisoned").clone()
    }

    fn finish(&self, outcome: Result<RequestOutcome, String>) {
        if self.is_cancelled() {
            return;
        }
        *self.result.lock().expect("result poisoned") = Some(outcome.clone());
        self.finished.emit(&outcome);
    }
}

#[derive(Debug, Default)]
pub struct BrowserSignals {
    pub node_added: Signal<u64>,
    pub node_removed: Signal<u64>,
    pub acl_changed: Signal<u64>,
}

/// The client-side directory: a request-issuing proxy whose tree mirrors
/// the server's as exploration progresses. Semantics match the server-local
/// browser.
pub struct ClientDirectory {
    conn: Arc<dyn Connection>,
    manager: Arc<CommunicationManager>,
    group: Arc<CommunicationGroup>,
    tree: Mutex<NodeTree>,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<PendingRequest>>>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    pub signals: BrowserSignals,
}

/// A subscribed session and the groups that carry it.
struct SessionHandle {
    session: Arc<TextSession>,
    _group: Arc<CommunicationGroup>,
    _sync_group: Option<Arc<CommunicationGroup>>,
}

/// Target adapter (the directory itself is held by the application).
pub struct ClientTarget {
    directory: Weak<ClientDirectory>,
}

impl GroupTarget for ClientTarget {
    fn received(&self, from: &Arc<dyn Connection>, node: &XmlNode) {
        if let Some(directory) = self.directory.upgrade() {
            directory.handle_message(from, node);
        }
    }
}

impl ClientDirectory {
    /// Joins the server's directory group on an authenticated connection.
    pub fn connect(
        manager: &Arc<CommunicationManager>,
        conn: Arc<dyn Connection>,
    ) -> (Arc<Self>, Arc<ClientTarget>) {
        manager.register(Arc::clone(&conn));
        let group = CommunicationGroup::join(manager, DIRECTORY_GROUP, &conn, vec![
            "central".to_string(),
        ]);
        group.set_method(CentralMethod::for_joined(
            conn.network().to_string(),
            Arc::clone(&conn),
        ) as Arc<dyn CommunicationMethod>);
        manager.bind(conn.remote_id(), &group);

        let directory = Arc::new(Self {
            conn: Arc::clone(&conn),
            manager: Arc::clone(manager),
            group: Arc::clone(&group),
            tree: Mutex::new(NodeTree::new()),
            next_seq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            signals: BrowserSignals::default(),
        });

        let target = Arc::new(ClientTarget {
            directory: Arc::downgrade(&directory),
        });
        let target_dyn: Arc<dyn GroupTarget> =
            Arc::clone(&target) as Arc<dyn GroupTarget>;
        group.set_target(&target_dyn);

        // A dying transport cancels everything still outstanding.
        let weak = Arc::downgrade(&directory);
        conn.status_changed().connect(move |status| {
            if *status == ConnectionStatus::Closed
                && let Some(directory) = weak.upgrade()
            {
                directory.fail_all_pending("connection closed");
            }
        });

        (directory, target)
    }

    pub fn tree(&self) -> &Mutex<NodeTree> {
        &self.tree
    }

    pub fn session(&self, node: u64) -> Option<Arc<TextSession>> {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .get(&node)
            .map(|h| Arc::clone(&h.session))
    }

    // ---- issuing requests ----------------------------------------------

    fn issue(
        &self,
        request_type: RequestType,
        node_id: u64,
        mut stanza: XmlNode,
    ) -> Arc<PendingRequest> {
        // Deduplicate concurrent issues of the same operation.
        if let Some(existing) = self.find_pending(node_id, request_type) {
            return existing;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        stanza.set_attr("seq", seq);
        let request = PendingRequest::new(seq, request_type, node_id);
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(seq, Arc::clone(&request));
        self.group.send_all(None, stanza);
        request
    }

    /// All outstanding requests for `node` of the given type.
    pub fn list_pending_requests(
        &self,
        node: u64,
        request_type: RequestType,
    ) -> Vec<Arc<PendingRequest>> {
        self.pending
            .lock()
            .expect("pending poisoned")
            .values()
            .filter(|r| r.node == node && r.request_type == request_type)
            .cloned()
            .collect()
    }

    fn find_pending(
        &self,
        node: u64,
        request_type: RequestType,
    ) -> Option<Arc<PendingRequest>> {
        self.pending
            .lock()
            .expect("pending poisoned")
            .values()
            .find(|r| {
                r.node == node && r.request_type == request_type && !r.is_cancelled()
            })
            .cloned()
    }

    /// The node an outstanding request operates on.
    pub fn iter_from_request(&self, request: &PendingRequest) -> Option<u64> {
        let tree = self.tree.lock().expect("tree poisoned");
        tree.contains(request.node).then_some(request.node)
    }

    pub fn explore(&self, node: u64) -> Arc<PendingRequest> {
        self.issue(
            RequestType::Explore,
            node,
            XmlNode::new("explore-node").attr("id", node),
        )
    }

    pub fn add_subdirectory(&self, parent: u64, name: &str) -> Arc<PendingRequest> {
        self.issue(
            RequestType::AddNode,
            parent,
            XmlNode::new("add-node")
                .attr("parent", parent)
                .attr("name", name)
                .attr("type", NODE_TYPE_SUBDIRECTORY),
        )
    }

    pub fn add_note(
        &self,
        parent: u64,
        name: &str,
        note_type: &str,
    ) -> Arc<PendingRequest> {
        self.issue(
            RequestType::AddNode,
            parent,
            XmlNode::new("add-node")
                .attr("parent", parent)
                .attr("name", name)
                .attr("type", note_type),
        )
    }

    /// `add_note` with the creator subscribed as soon as the node exists.
    pub fn add_note_subscribed(
        self: &Arc<Self>,
        parent: u64,
        name: &str,
        note_type: &str,
    ) -> Arc<PendingRequest> {
        let request = self.add_note(parent, name, note_type);
        let directory = Arc::downgrade(self);
        request.finished.connect(move |outcome| {
            if let (Ok(RequestOutcome::Node(id)), Some(directory)) =
                (outcome, directory.upgrade())
            {
                directory.subscribe(*id);
            }
        });
        request
    }

    pub fn remove_node(&self, node: u64) -> Arc<PendingRequest> {
        self.issue(
            RequestType::RemoveNode,
            node,
            XmlNode::new("remove-node").attr("id", node),
        )
    }

    pub fn rename_node(&self, node: u64, name: &str) -> Arc<PendingRequest> {
        self.issue(
            RequestType::RenameNode,
            node,
            XmlNode::new("rename-node").attr("id", node).attr("name", name),
        )
    }

    /// Subscribes to the session behind a leaf; completion happens when the
    /// announced synchronization finishes.
    pub fn subscribe(&self, node: u64) -> Arc<PendingRequest> {
        self.issue(
            RequestType::Subscribe,
            node,
            XmlNode::new("subscribe-session").attr("id", node),
        )
    }

    pub fn query_acl(&self, node: u64) -> Arc<PendingRequest> {
        self.issue(
            RequestType::QueryAcl,
            node,
            XmlNode::new("query-acl").attr("id", node),
        )
    }

    pub fn set_acl(&self, node: u64, sheets: &SheetSet) -> Arc<PendingRequest> {
        self.issue(
            RequestType::SetAcl,
            node,
            XmlNode::new("set-acl").attr("id", node).child(sheets.to_xml()),
        )
    }

    pub fn query_acl_account_list(&self) -> Arc<PendingRequest> {
        self.issue(
            RequestType::QueryAccountList,
            0,
            XmlNode::new("query-acl-account-list"),
        )
    }

    pub fn create_acl_account(
        &self,
        id: &str,
        name: Option<&str>,
        password: Option<&str>,
    ) -> Arc<PendingRequest> {
        let mut stanza = XmlNode::new("create-acl-account").attr("id", id);
        if let Some(name) = name {
            stanza.set_attr("name", name);
        }
        if let Some(password) = password {
            stanza.set_attr("password", password);
        }
        self.issue(RequestType::CreateAccount, 0, stanza)
    }

    pub fn remove_acl_account(&self, id: &str) -> Arc<PendingRequest> {
        self.issue(
            RequestType::RemoveAccount,
            0,
            XmlNode::new("remove-acl-account").attr("id", id),
        )
    }

    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .expect("pending poisoned")
            .drain()
            .map(|(_, r)| r)
            .collect();
        for request in drained {
            request.finish(Err(reason.to_string()));
        }
    }

    // ---- inbound -------------------------------------------------------

    fn take_request(&self, node: &XmlNode) -> Option<Arc<PendingRequest>> {
        let seq: u32 = node.get_attr("seq")?.parse().ok()?;
        let request = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(&seq)?;
        if request.is_cancelled() {
            debug!(seq, "discarding response to a cancelled request");
            return None;
        }
        Some(request)
    }

    /// Peeks at a pending request without removing it (multi-stanza
    /// responses such as explore).
    fn peek_request(&self, node: &XmlNode) -> Option<Arc<PendingRequest>> {
        let seq: u32 = node.get_attr("seq")?.parse().ok()?;
        self.pending
            .lock()
            .expect("pending poisoned")
            .get(&seq)
            .cloned()
    }

    fn handle_message(self: &Arc<Self>, _from: &Arc<dyn Connection>, node: &XmlNode) {
        match node.name.as_str() {
            "explore-begin" => {
                // Nothing to stage; children arrive as add-node stanzas.
            },
            "explore-end" => {
                if let Some(request) = self.take_request(node) {
                    if let Ok(id) = node.parse_attr::<u64>("id") {
                        let mut tree = self.tree.lock().expect("tree poisoned");
                        let _ = tree.mark_explored(id);
                    }
                    request.finish(Ok(RequestOutcome::Node(request.node)));
                }
            },
            "add-node" => self.handle_add_node(node),
            "remove-node" => {
                if let Ok(id) = node.parse_attr::<u64>("id") {
                    {
                        let mut tree = self.tree.lock().expect("tree poisoned");
                        let _ = tree.remove(id);
                    }
                    if let Some(handle) =
                        self.sessions.lock().expect("sessions poisoned").remove(&id)
                    {
                        handle.session.close();
                    }
                    self.signals.node_removed.emit(&id);
                }
                if let Some(request) = self.take_request(node) {
                    request.finish(Ok(RequestOutcome::Done));
                }
            },
            "rename-node" => {
                if let (Ok(id), Ok(name)) =
                    (node.parse_attr::<u64>("id"), node.req_attr("name"))
                {
                    let mut tree = self.tree.lock().expect("tree poisoned");
                    let _ = tree.rename(id, name);
                }
                if let Some(request) = self.take_request(node) {
                    request.finish(Ok(RequestOutcome::Done));
                }
            },
            "subscribe-session" => self.handle_subscribe(node),
            "acl" => {
                if let Some(request) = self.take_request(node) {
                    let outcome = node
                        .find_child("acl")
                        .ok_or_else(|| "response without sheets".to_string())
                        .and_then(|acl| {
                            SheetSet::from_xml(acl).map_err(|e| e.to_string())
                        })
                        .map(RequestOutcome::Acl);
                    request.finish(outcome);
                }
            },
            "set-acl" => {
                if let Some(request) = self.take_request(node) {
                    request.finish(Ok(RequestOutcome::Done));
                }
            },
            "acl-changed" => {
                if let (Ok(id), Some(acl)) =
                    (node.parse_attr::<u64>("id"), node.find_child("acl"))
                {
                    if let Ok(sheets) = SheetSet::from_xml(acl) {
                        let mut tree = self.tree.lock().expect("tree poisoned");
                        if let Some(entry) = tree.get_mut(id) {
                            entry.sheets = sheets;
                        }
                    }
                    self.signals.acl_changed.emit(&id);
                }
            },
            "acl-account-list" => {
                if let Some(request) = self.take_request(node) {
                    let accounts = node
                        .elements()
                        .filter(|e| e.name == "account")
                        .filter_map(|e| {
                            e.get_attr("id").map(|id| {
                                (
                                    id.to_string(),
                                    e.get_attr("name").map(str::to_string),
                                )
                            })
                        })
                        .collect();
                    request.finish(Ok(RequestOutcome::Accounts(accounts)));
                }
            },
            "acl-account-added" | "acl-account-removed" => {
                if let Some(request) = self.take_request(node) {
                    request.finish(Ok(RequestOutcome::Done));
                }
            },
            "request-failed" => {
                let text = node
                    .find_child("text")
                    .map(|t| t.inner_text())
                    .unwrap_or_else(|| "request failed".to_string());
                if let Some(request) = self.take_request(node) {
                    request.finish(Err(text));
                }
            },
            other => {
                warn!(stanza = other, "unexpected directory message");
            },
        }
    }

    fn handle_add_node(self: &Arc<Self>, node: &XmlNode) {
        let parsed = (
            node.parse_attr::<u64>("id"),
            node.parse_attr::<u64>("parent"),
            node.req_attr("name"),
            node.req_attr("type"),
        );
        let (Ok(id), Ok(parent), Ok(name), Ok(node_type)) = parsed else {
            warn!("malformed add-node");
            return;
        };

        let kind = if node_type == NODE_TYPE_SUBDIRECTORY {
            NodeKind::Subdirectory { children: None }
        } else {
            NodeKind::Leaf {
                note_type: node_type.to_string(),
            }
        };

        {
            let mut tree = self.tree.lock().expect("tree poisoned");
            let _ = tree.mark_explored(parent);
            if !tree.contains(id)
                && let Err(e) = tree.insert(Some(id), parent, name, kind, SheetSet::new())
            {
                warn!("cannot mirror node {id}: {e}");
                return;
            }
        }
        self.signals.node_added.emit(&id);

        // add-node is both the broadcast and the response to our own
        // add requests; explore children share the explore seq.
        if let Some(request) = self.peek_request(node)
            && request.request_type == RequestType::AddNode
            && let Some(request) = self.take_request(node)
        {
            request.finish(Ok(RequestOutcome::Node(id)));
        }
    }

    /// `<subscribe-session id group sync-group method/>`: join both groups
    /// and start the synchronizing session.
    fn handle_subscribe(self: &Arc<Self>, node: &XmlNode) {
        let Ok(id) = node.parse_attr::<u64>("id") else {
            warn!("subscribe-session without id");
            return;
        };
        let (Ok(group_name), Ok(sync_group_name)) =
            (node.req_attr("group"), node.req_attr("sync-group"))
        else {
            warn!("subscribe-session without group names");
            return;
        };

        let session =
            TextSession::new_synchronizing(Box::new(DefaultTextBuffer::new()));

        let main_group =
            CommunicationGroup::join(&self.manager, group_name, &self.conn, vec![
                "central".to_string(),
            ]);
        main_group.set_method(CentralMethod::for_joined(
            self.conn.network().to_string(),
            Arc::clone(&self.conn),
        ) as Arc<dyn CommunicationMethod>);
        let target: Arc<dyn GroupTarget> =
            Arc::clone(&session) as Arc<dyn GroupTarget>;
        main_group.set_target(&target);
        self.manager.bind(self.conn.remote_id(), &main_group);
        session.set_subscription_group(Arc::clone(&main_group));

        let sync_group =
            CommunicationGroup::join(&self.manager, sync_group_name, &self.conn, vec![
                "central".to_string(),
            ]);
        sync_group.set_method(CentralMethod::for_joined(
            self.conn.network().to_string(),
            Arc::clone(&self.conn),
        ) as Arc<dyn CommunicationMethod>);
        sync_group.set_target(&target);
        self.manager.bind(self.conn.remote_id(), &sync_group);

        // Resolve the pending subscribe once the sync finishes either way.
        if let Some(request) = self.take_request(node) {
            let session_signals = &session.signals;
            let done = Arc::clone(&request);
            session_signals.synchronization_complete.connect(move |()| {
                done.finish(Ok(RequestOutcome::Node(id)));
            });
            let failed = request;
            session_signals.synchronization_failed.connect(move |reason| {
                failed.finish(Err(reason.clone()));
            });
        }

        self.sessions.lock().expect("sessions poisoned").insert(id, SessionHandle {
            session,
            _group: main_group,
            _sync_group: Some(sync_group),
        });
    }
}

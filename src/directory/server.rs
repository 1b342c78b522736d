// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    acl::{ACCOUNT_DEFAULT, AccountStore, AclAccount, AclMask, SheetSet},
    comm::{
        GroupTarget,
        group::CommunicationGroup,
        method::{CentralMethod, CommunicationMethod},
        registry::CommunicationManager,
    },
    directory::{
        DIRECTORY_GROUP, NODE_TYPE_SUBDIRECTORY, NOTE_TYPE_TEXT,
        node::{NodeKind, NodeTree},
        storage::{DirectoryStorage, StorageNode},
    },
    error::RequestError,
    session::SessionStatus,
    text::{
        buffer::DefaultTextBuffer,
        filesystem_format::PersistedTextSession,
        session::TextSession,
    },
    transport::{Connection, ConnectionStatus},
    util::{Signal, generate_group_suffix},
    xml::{XmlNode, request_failed_seq},
};

/// A live session bound to a leaf node.
struct SessionEntry {
    session: Arc<TextSession>,
    group: Arc<CommunicationGroup>,
    method: Arc<CentralMethod>,
}

/// A registered client connection.
struct ConnEntry {
    conn: Arc<dyn Connection>,
    account: String,
    group: Arc<CommunicationGroup>,
    /// Keeps the group's weakly-held target alive for the connection's
    /// lifetime.
    _target: Arc<DirectoryTarget>,
}

#[derive(Debug, Default)]
pub struct DirectorySignals {
    pub node_added: Signal<u64>,
    pub node_removed: Signal<u64>,
    pub acl_changed: Signal<u64>,
}

/// The server side of the tree: owns nodes, storage, live sessions and the
/// per-connection directory groups, and multiplexes one session across all
/// of its subscribers.
pub struct ServerDirectory {
    tree: Mutex<NodeTree>,
    storage: Arc<dyn DirectoryStorage>,
    pub accounts: Arc<AccountStore>,
    manager: Arc<CommunicationManager>,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    connections: Mutex<HashMap<String, ConnEntry>>,
    pub signals: DirectorySignals,
}

impl ServerDirectory {
    pub fn new(
        storage: Arc<dyn DirectoryStorage>,
        accounts: Arc<AccountStore>,
        manager: Arc<CommunicationManager>,
    ) -> Result<Arc<Self>> {
        let mut tree = NodeTree::new();
        // Root sheets come back from storage together with the rest.
        let stored_acl = storage.read_acl()?;
        if let Some(root_sheets) = stored_acl.get("/") {
            tree.get_mut(0).expect("root exists").sheets = root_sheets.clone();
        }

        let directory = Arc::new(Self {
            tree: Mutex::new(tree),
            storage,
            accounts,
            manager,
            sessions: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            signals: DirectorySignals::default(),
        });
        directory.populate_children(0)?;

        // Re-attach persisted sheets to explored nodes.
        {
            let mut tree = directory.tree.lock().expect("tree poisoned");
            for id in tree.ids() {
                if let Ok(path) = tree.path_of(id)
                    && let Some(sheets) = stored_acl.get(&path)
                    && let Some(node) = tree.get_mut(id)
                {
                    node.sheets = sheets.clone();
                }
            }
        }
        Ok(directory)
    }

    // ---- connections ---------------------------------------------------

    /// Registers an authenticated client connection: its directory group
    /// is created and bound, and the connection's certificate or SASL
    /// outcome determines the account identity.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let account = self.identify(&conn);
        info!(remote = conn.remote_id(), account, "directory connection");

        self.manager.register(Arc::clone(&conn));
        let group = CommunicationGroup::open(&self.manager, DIRECTORY_GROUP, vec![
            "central".to_string(),
        ]);
        let method = CentralMethod::for_publisher(conn.network());
        method.add_member(Arc::clone(&conn));
        group.set_method(method);
        let target = DirectoryTarget::new(self);
        let target_dyn: Arc<dyn GroupTarget> =
            Arc::clone(&target) as Arc<dyn GroupTarget>;
        group.set_target(&target_dyn);
        self.manager.bind(conn.remote_id(), &group);

        let directory = Arc::downgrade(self);
        let conn_id = conn.remote_id().to_string();
        conn.status_changed().connect(move |status| {
            if *status == ConnectionStatus::Closed
                && let Some(directory) = directory.upgrade()
            {
                directory.remove_connection(&conn_id);
            }
        });

        self.connections.lock().expect("connections poisoned").insert(
            conn.remote_id().to_string(),
            ConnEntry {
                conn,
                account,
                group,
                _target: target,
            },
        );
    }

    /// Account identity: the account whose DN list contains the peer
    /// certificate's subject, else the SASL account, else `default`.
    fn identify(&self, conn: &Arc<dyn Connection>) -> String {
        if let Some(der) = conn.peer_certificate() {
            let presented = crate::transport::tls::PresentedCertificate {
                der,
                ca_trusted: false,
                hostname_matches: false,
            };
            if let Ok(dn) = presented.subject_dn()
                && let Some(account) = self.accounts.lookup_by_dn(&dn)
            {
                self.accounts.touch(&account.id);
                return account.id;
            }
        }
        conn.account()
            .unwrap_or_else(|| ACCOUNT_DEFAULT.to_string())
    }

    pub fn remove_connection(&self, conn_id: &str) {
        if self
            .connections
            .lock()
            .expect("connections poisoned")
            .remove(conn_id)
            .is_none()
        {
            return;
        }
        debug!(conn_id, "directory connection removed");
        self.manager.cancel_messages(conn_id);
        self.manager.unregister(conn_id);

        for entry in self.sessions.lock().expect("sessions poisoned").values() {
            entry.method.remove_member(conn_id);
            entry.session.connection_closed(conn_id);
        }
    }

    fn account_of(&self, conn_id: &str) -> String {
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(conn_id)
            .map(|e| e.account.clone())
            .unwrap_or_else(|| ACCOUNT_DEFAULT.to_string())
    }

    // ---- local tree operations ----------------------------------------

    /// Fetches a subdirectory's children from storage, if not yet done.
    pub fn explore(&self, id: u64) -> Result<Vec<u64>, RequestError> {
        {
            let tree = self.tree.lock().expect("tree poisoned");
            let node = tree.get(id).ok_or(RequestError::NoSuchNode(id))?;
            if !node.is_subdirectory() {
                return Err(RequestError::NotASubdirectory);
            }
            if node.is_explored() && id != 0 {
                return Ok(tree.children(id)?.to_vec());
            }
            if id == 0 && !tree.children(0)?.is_empty() {
                return Ok(tree.children(0)?.to_vec());
            }
        }
        self.populate_children(id)
    }

    fn populate_children(&self, id: u64) -> Result<Vec<u64>, RequestError> {
        let path = {
            let tree = self.tree.lock().expect("tree poisoned");
            tree.path_of(id)?
        };
        let stored = self.storage.read_subdirectory(&path).map_err(|e| {
            RequestError::InvalidAttribute {
                attribute: "id".to_string(),
                value: format!("{id}: {e}"),
            }
        })?;

        let mut tree = self.tree.lock().expect("tree poisoned");
        tree.mark_explored(id)?;
        let mut children = Vec::new();
        for entry in stored {
            let kind = match &entry {
                StorageNode::Subdirectory { .. } => NodeKind::Subdirectory {
                    children: None,
                },
                StorageNode::Note { note_type, .. } => NodeKind::Leaf {
                    note_type: note_type.clone(),
                },
            };
            children.push(tree.insert(
                None,
                id,
                entry.name(),
                kind,
                SheetSet::new(),
            )?);
        }
        Ok(children)
    }

    pub fn add_subdirectory(
        &self,
        parent: u64,
        name: &str,
        sheets: SheetSet,
    ) -> Result<u64, RequestError> {
        self.explore(parent)?;
        let id = {
            let mut tree = self.tree.lock().expect("tree poisoned");
            let id = tree.insert(
                None,
                parent,
                name,
                NodeKind::Subdirectory {
                    children: Some(Vec::new()),
                },
                sheets,
            )?;
            let path = tree.path_of(id)?;
            self.storage.create_subdirectory(&path).map_err(|e| {
                RequestError::InvalidAttribute {
                    attribute: "name".to_string(),
                    value: format!("{name}: {e}"),
                }
            })?;
            id
        };
        self.persist_acl();
        self.broadcast_node_added(id, None);
        self.signals.node_added.emit(&id);
        Ok(id)
    }

    /// Creates a leaf. With `session`, the tree adopts that session's
    /// buffer (publishing an already-running document).
    pub fn add_note(
        self: &Arc<Self>,
        parent: u64,
        name: &str,
        note_type: &str,
        sheets: SheetSet,
        session: Option<Arc<TextSession>>,
    ) -> Result<u64, RequestError> {
        if note_type != NOTE_TYPE_TEXT {
            return Err(RequestError::InvalidAttribute {
                attribute: "type".to_string(),
                value: note_type.to_string(),
            });
        }
        self.explore(parent)?;

        let id = {
            let mut tree = self.tree.lock().expect("tree poisoned");
            tree.insert(
                None,
                parent,
                name,
                NodeKind::Leaf {
                    note_type: note_type.to_string(),
                },
                sheets,
            )?
        };

        let session = match session {
            Some(adopted) => adopted,
            None => TextSession::new_running(Box::new(DefaultTextBuffer::new())),
        };
        self.install_session(id, session);
        if let Err(e) = self.save_session(id) {
            warn!(id, "failed to persist new note: {e}");
        }
        self.persist_acl();
        self.broadcast_node_added(id, None);
        self.signals.node_added.emit(&id);
        Ok(id)
    }

    /// Removes a node, recursively closing every live session within it.
    pub fn remove_node(&self, id: u64) -> Result<(), RequestError> {
        let (removed, path) = {
            let mut tree = self.tree.lock().expect("tree poisoned");
            let path = tree.path_of(id)?;
            (tree.remove(id)?, path)
        };

        {
            let mut sessions = self.sessions.lock().expect("sessions poisoned");
            for removed_id in &removed {
                if let Some(entry) = sessions.remove(removed_id) {
                    entry.session.close();
                }
            }
        }

        if let Err(e) = self.storage.remove_node(&path) {
            warn!(?path, "failed to remove storage node: {e}");
        }
        self.persist_acl();
        self.broadcast(
            XmlNode::new("remove-node").attr("id", id),
            None,
        );
        self.signals.node_removed.emit(&id);
        Ok(())
    }

    pub fn rename_node(&self, id: u64, name: &str) -> Result<(), RequestError> {
        let old_path = {
            let tree = self.tree.lock().expect("tree poisoned");
            tree.path_of(id)?
        };
        {
            let mut tree = self.tree.lock().expect("tree poisoned");
            tree.rename(id, name)?;
        }
        // Best effort on storage: re-persist under the new path.
        let new_path = {
            let tree = self.tree.lock().expect("tree poisoned");
            tree.path_of(id)?
        };
        if old_path != new_path
            && let Err(e) = self.storage.remove_node(&old_path)
        {
            warn!(?old_path, "failed to drop old storage path: {e}");
        }
        if let Err(e) = self.save_session(id) {
            debug!(id, "no session content to move: {e}");
        }
        self.broadcast(
            XmlNode::new("rename-node").attr("id", id).attr("name", name),
            None,
        );
        Ok(())
    }

    pub fn check_acl(
        &self,
        id: u64,
        account: &str,
        mask: AclMask,
    ) -> Result<AclMask, RequestError> {
        self.tree
            .lock()
            .expect("tree poisoned")
            .check_acl(id, account, mask)
    }

    pub fn set_acl(&self, id: u64, sheets: SheetSet) -> Result<(), RequestError> {
        {
            let mut tree = self.tree.lock().expect("tree poisoned");
            let node = tree.get_mut(id).ok_or(RequestError::NoSuchNode(id))?;
            for (account, sheet) in sheets.iter() {
                node.sheets.set(account, *sheet);
            }
        }
        self.persist_acl();
        let acl_xml = {
            let tree = self.tree.lock().expect("tree poisoned");
            tree.get(id)
                .map(|n| n.sheets.to_xml())
                .unwrap_or_else(|| XmlNode::new("acl"))
        };
        self.broadcast(
            XmlNode::new("acl-changed").attr("id", id).child(acl_xml),
            None,
        );
        self.signals.acl_changed.emit(&id);
        Ok(())
    }

    pub fn query_acl(&self, id: u64) -> Result<SheetSet, RequestError> {
        let tree = self.tree.lock().expect("tree poisoned");
        Ok(tree
            .get(id)
            .ok_or(RequestError::NoSuchNode(id))?
            .sheets
            .clone())
    }

    fn persist_acl(&self) {
        let map = self.tree.lock().expect("tree poisoned").sheets_by_path();
        if let Err(e) = self.storage.write_acl(&map) {
            warn!("failed to persist ACL: {e}");
        }
    }

    // ---- sessions ------------------------------------------------------

    /// The live session for a leaf, loading it from storage on first use.
    pub fn session_for(
        self: &Arc<Self>,
        id: u64,
    ) -> Result<Arc<TextSession>, RequestError> {
        if let Some(entry) = self.sessions.lock().expect("sessions poisoned").get(&id) {
            return Ok(Arc::clone(&entry.session));
        }

        let path = {
            let tree = self.tree.lock().expect("tree poisoned");
            let node = tree.get(id).ok_or(RequestError::NoSuchNode(id))?;
            if node.note_type() != Some(NOTE_TYPE_TEXT) {
                return Err(RequestError::NotALeaf);
            }
            tree.path_of(id)?
        };

        let persisted = self.storage.read_text(&path).map_err(|e| {
            RequestError::InvalidAttribute {
                attribute: "id".to_string(),
                value: format!("{id}: {e}"),
            }
        })?;
        let buffer = DefaultTextBuffer::from_chunk(persisted.content);
        let session = TextSession::new_running(Box::new(buffer));
        for user in persisted.users {
            let mut record = crate::session::users::User::new(user.id, user.name);
            record.hue = user.hue;
            if let Err(e) = session.users.add(record) {
                warn!(id, "skipping malformed persisted user: {e}");
            }
        }
        Ok(self.install_session(id, session))
    }

    fn install_session(
        self: &Arc<Self>,
        id: u64,
        session: Arc<TextSession>,
    ) -> Arc<TextSession> {
        let group = CommunicationGroup::open(
            &self.manager,
            format!("InfSession_{id}"),
            vec!["central".to_string()],
        );
        let method = CentralMethod::for_publisher("any");
        group.set_method(Arc::clone(&method) as Arc<dyn CommunicationMethod>);
        let target: Arc<dyn GroupTarget> =
            Arc::clone(&session) as Arc<dyn GroupTarget>;
        group.set_target(&target);
        session.set_subscription_group(Arc::clone(&group));

        // Subscribers complete (or abandon) their synchronization through
        // these hooks; see subscribe_connection.
        let directory = Arc::downgrade(self);
        session.sync_acknowledged.connect(move |conn_id| {
            if let Some(directory) = directory.upgrade() {
                directory.finish_subscription(id, conn_id);
            }
        });
        let directory = Arc::downgrade(self);
        session.sync_cancelled.connect(move |conn_id| {
            if let Some(directory) = directory.upgrade() {
                directory.abort_subscription(id, conn_id);
            }
        });

        // Joining a user is gated by its own permission bit.
        let directory = Arc::downgrade(self);
        session.set_join_gate(move |conn_id| {
            directory
                .upgrade()
                .map(|d| d.require_acl(conn_id, id, AclMask::CAN_JOIN_USER).is_ok())
                .unwrap_or(false)
        });

        self.sessions.lock().expect("sessions poisoned").insert(id, SessionEntry {
            session: Arc::clone(&session),
            group,
            method,
        });
        session
    }

    /// Writes a session's buffer back to storage and clears the modified
    /// flag; used by autosave and the periodic directory sync.
    pub fn save_session(&self, id: u64) -> Result<(), RequestError> {
        let entry_session = {
            let sessions = self.sessions.lock().expect("sessions poisoned");
            sessions.get(&id).map(|e| Arc::clone(&e.session))
        };
        let Some(session) = entry_session else {
            return Err(RequestError::NoSuchNode(id));
        };

        let path = {
            let tree = self.tree.lock().expect("tree poisoned");
            tree.path_of(id)?
        };
        let persisted = PersistedTextSession::capture(
            session.content_snapshot(),
            &session.users.snapshot(),
        );
        self.storage.write_text(&path, &persisted).map_err(|e| {
            RequestError::InvalidAttribute {
                attribute: "id".to_string(),
                value: format!("{id}: {e}"),
            }
        })?;
        session.mark_saved();
        Ok(())
    }

    /// Every node with a live modified session (directory sync sweep).
    pub fn dirty_sessions(&self) -> Vec<u64> {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .iter()
            .filter(|(_, e)| {
                e.session.status() == SessionStatus::Running
                    && e.session.buffer_modified()
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Writes plain-text copies of every live document under `dir`
    /// (the daemon's periodic directory sync). Returns how many documents
    /// were written.
    pub fn write_plain_copies(&self, dir: &std::path::Path) -> usize {
        let live: Vec<(u64, Arc<TextSession>)> = {
            let sessions = self.sessions.lock().expect("sessions poisoned");
            sessions
                .iter()
                .filter(|(_, e)| e.session.status() == SessionStatus::Running)
                .map(|(id, e)| (*id, Arc::clone(&e.session)))
                .collect()
        };

        let mut written = 0;
        for (id, session) in live {
            let Ok(path) = self.tree.lock().expect("tree poisoned").path_of(id) else {
                continue;
            };
            let target = crate::directory::storage::storage_path_for(dir, &path);
            if let Some(parent) = target.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                warn!(?target, "cannot create sync directory: {e}");
                continue;
            }
            let text = session.content_snapshot().to_plain_text();
            match std::fs::write(&target, text) {
                Ok(()) => written += 1,
                Err(e) => warn!(?target, "failed to write plain copy: {e}"),
            }
        }
        written
    }

    /// Saves every modified live document; used by autosave and shutdown.
    pub fn save_dirty_sessions(&self) -> usize {
        let mut saved = 0;
        for id in self.dirty_sessions() {
            match self.save_session(id) {
                Ok(()) => saved += 1,
                Err(e) => warn!(id, "autosave failed: {e}"),
            }
        }
        saved
    }

    /// Runs request-log pruning on every live session.
    pub fn cleanup_sessions(&self) {
        for entry in self.sessions.lock().expect("sessions poisoned").values() {
            entry.session.cleanup();
        }
    }

    // ---- wire handling -------------------------------------------------

    fn broadcast(&self, node: XmlNode, except: Option<&str>) {
        let connections = self.connections.lock().expect("connections poisoned");
        for (conn_id, entry) in connections.iter() {
            if Some(conn_id.as_str()) == except {
                continue;
            }
            entry.group.send_single(&entry.conn, node.clone());
        }
    }

    fn broadcast_node_added(&self, id: u64, except: Option<&str>) {
        if let Some(node) = self.node_added_xml(id) {
            self.broadcast(node, except);
        }
    }

    fn node_added_xml(&self, id: u64) -> Option<XmlNode> {
        let tree = self.tree.lock().expect("tree poisoned");
        let node = tree.get(id)?;
        let node_type = match &node.kind {
            NodeKind::Subdirectory { .. } => NODE_TYPE_SUBDIRECTORY,
            NodeKind::Leaf { note_type } => note_type.as_str(),
        };
        Some(
            XmlNode::new("add-node")
                .attr("id", id)
                .attr("parent", node.parent.unwrap_or(0))
                .attr("name", node.name.clone())
                .attr("type", node_type),
        )
    }

    fn require_acl(
        &self,
        conn_id: &str,
        id: u64,
        bit: AclMask,
    ) -> Result<(), RequestError> {
        let account = self.account_of(conn_id);
        let granted = self.check_acl(id, &account, bit)?;
        if granted.contains(bit) {
            Ok(())
        } else {
            Err(RequestError::NotAuthorized)
        }
    }

    fn reply(&self, conn: &Arc<dyn Connection>, node: XmlNode) {
        let connections = self.connections.lock().expect("connections poisoned");
        if let Some(entry) = connections.get(conn.remote_id()) {
            entry.group.send_single(&entry.conn, node);
        }
    }

    fn handle_message(
        self: &Arc<Self>,
        conn: &Arc<dyn Connection>,
        node: &XmlNode,
    ) -> Result<(), RequestError> {
        let conn_id = conn.remote_id().to_string();
        let seq = node.get_attr("seq").map(str::to_string);
        let with_seq = |mut reply: XmlNode| {
            if let Some(seq) = &seq {
                reply.set_attr("seq", seq.clone());
            }
            reply
        };

        match node.name.as_str() {
            "explore-node" => {
                let id: u64 = node.parse_attr("id")?;
                self.require_acl(&conn_id, id, AclMask::CAN_EXPLORE_NODE)?;
                let children = self.explore(id)?;

                self.reply(
                    conn,
                    with_seq(
                        XmlNode::new("explore-begin")
                            .attr("id", id)
                            .attr("total", children.len()),
                    ),
                );
                for child in children {
                    if let Some(added) = self.node_added_xml(child) {
                        self.reply(conn, with_seq(added));
                    }
                }
                self.reply(conn, with_seq(XmlNode::new("explore-end").attr("id", id)));
            },
            "add-node" => {
                let parent: u64 = node.parse_attr("parent")?;
                let name = node.req_attr("name")?;
                let node_type = node.req_attr("type")?;

                let id = if node_type == NODE_TYPE_SUBDIRECTORY {
                    self.require_acl(&conn_id, parent, AclMask::CAN_ADD_SUBDIRECTORY)?;
                    self.add_subdirectory(parent, name, SheetSet::new())?
                } else {
                    self.require_acl(&conn_id, parent, AclMask::CAN_ADD_DOCUMENT)?;
                    self.add_note(parent, name, node_type, SheetSet::new(), None)?
                };
                if let Some(added) = self.node_added_xml(id) {
                    self.reply(conn, with_seq(added));
                }
            },
            "remove-node" => {
                let id: u64 = node.parse_attr("id")?;
                self.require_acl(&conn_id, id, AclMask::CAN_REMOVE_NODE)?;
                self.remove_node(id)?;
                self.reply(conn, with_seq(XmlNode::new("remove-node").attr("id", id)));
            },
            "rename-node" => {
                let id: u64 = node.parse_attr("id")?;
                let name = node.req_attr("name")?;
                self.require_acl(&conn_id, id, AclMask::CAN_REMOVE_NODE)?;
                self.rename_node(id, name)?;
                self.reply(
                    conn,
                    with_seq(
                        XmlNode::new("rename-node").attr("id", id).attr("name", name),
                    ),
                );
            },
            "subscribe-session" => {
                let id: u64 = node.parse_attr("id")?;
                self.require_acl(&conn_id, id, AclMask::CAN_SUBSCRIBE_SESSION)?;
                self.subscribe_connection(conn, id, seq.as_deref())?;
            },
            "query-acl" => {
                let id: u64 = node.parse_attr("id")?;
                self.require_acl(&conn_id, id, AclMask::CAN_QUERY_ACL)?;
                let sheets = self.query_acl(id)?;
                self.reply(
                    conn,
                    with_seq(XmlNode::new("acl").attr("id", id).child(sheets.to_xml())),
                );
            },
            "set-acl" => {
                let id: u64 = node.parse_attr("id")?;
                self.require_acl(&conn_id, id, AclMask::CAN_SET_ACL)?;
                let sheets = node
                    .find_child("acl")
                    .ok_or_else(|| RequestError::MissingField("acl".to_string()))
                    .and_then(|acl| {
                        SheetSet::from_xml(acl).map_err(|e| {
                            RequestError::InvalidAttribute {
                                attribute: "acl".to_string(),
                                value: e.to_string(),
                            }
                        })
                    })?;
                self.set_acl(id, sheets)?;
                self.reply(conn, with_seq(XmlNode::new("set-acl").attr("id", id)));
            },
            "query-acl-account-list" => {
                self.require_acl(&conn_id, 0, AclMask::CAN_QUERY_ACCOUNT_LIST)?;
                let mut reply = XmlNode::new("acl-account-list");
                for account in self.accounts.list() {
                    reply.push(account.to_client_xml());
                }
                self.reply(conn, with_seq(reply));
            },
            "create-acl-account" => {
                self.require_acl(&conn_id, 0, AclMask::CAN_SET_ACL)?;
                let id = node.req_attr("id")?;
                let mut account = AclAccount::new(id);
                account.name = node.get_attr("name").map(str::to_string);
                if let Some(password) = node.get_attr("password") {
                    account.set_password(password);
                }
                for cert in node.elements() {
                    if cert.name == "certificate" {
                        account.certificate_dns.push(cert.inner_text());
                    }
                }
                let client_view = account.to_client_xml();
                self.accounts
                    .insert(account)
                    .map_err(|_| RequestError::AccountExists(id.to_string()))?;
                self.reply(
                    conn,
                    with_seq(XmlNode::new("acl-account-added").child(client_view)),
                );
            },
            "remove-acl-account" => {
                self.require_acl(&conn_id, 0, AclMask::CAN_SET_ACL)?;
                let id = node.req_attr("id")?;
                let removed = self
                    .accounts
                    .remove(id)
                    .map_err(|e| RequestError::InvalidAttribute {
                        attribute: "id".to_string(),
                        value: e.to_string(),
                    })?;
                if removed.is_none() {
                    return Err(RequestError::NoSuchAccount(id.to_string()));
                }
                self.reply(
                    conn,
                    with_seq(XmlNode::new("acl-account-removed").attr("id", id)),
                );
            },
            other => {
                return Err(RequestError::UnexpectedMessage(other.to_string()));
            },
        }
        Ok(())
    }

    /// Subscribes `conn` to the session on leaf `id`: answer with the group
    /// names, hold main-group traffic, and run the synchronization on a
    /// dedicated group until `<sync-ack/>`.
    fn subscribe_connection(
        self: &Arc<Self>,
        conn: &Arc<dyn Connection>,
        id: u64,
        seq: Option<&str>,
    ) -> Result<(), RequestError> {
        let session = self.session_for(id)?;
        let (main_group, method) = {
            let sessions = self.sessions.lock().expect("sessions poisoned");
            let entry = sessions.get(&id).expect("session just ensured");
            (Arc::clone(&entry.group), Arc::clone(&entry.method))
        };

        let sync_group_name =
            format!("{}_sync_{}", main_group.name(), generate_group_suffix());

        let mut reply = XmlNode::new("subscribe-session")
            .attr("id", id)
            .attr("group", main_group.name())
            .attr("sync-group", sync_group_name.clone())
            .attr("method", "central");
        if let Some(seq) = seq {
            reply.set_attr("seq", seq);
        }
        self.reply(conn, reply);

        // Membership is effective immediately, but everything on the main
        // group stays queued until the joiner acknowledges the sync.
        method.add_member(Arc::clone(conn));
        self.manager.bind(conn.remote_id(), &main_group);
        self.manager.block_queue(conn.remote_id(), main_group.name());

        let sync_group = CommunicationGroup::open(
            &self.manager,
            sync_group_name,
            vec!["central".to_string()],
        );
        let sync_method = CentralMethod::for_publisher(conn.network());
        sync_method.add_member(Arc::clone(conn));
        sync_group.set_method(sync_method);
        let target: Arc<dyn GroupTarget> =
            Arc::clone(&session) as Arc<dyn GroupTarget>;
        sync_group.set_target(&target);
        self.manager.bind(conn.remote_id(), &sync_group);

        session.synchronize_to(conn, sync_group);
        Ok(())
    }

    fn finish_subscription(&self, id: u64, conn_id: &str) {
        let (group, conn) = {
            let sessions = self.sessions.lock().expect("sessions poisoned");
            let Some(entry) = sessions.get(&id) else { return };
            let Some(conn) = self.manager.connection(conn_id) else {
                return;
            };
            (Arc::clone(&entry.group), conn)
        };
        debug!(id, conn_id, "subscription synchronized");
        self.manager.unblock_queue(&conn, &group);
    }

    fn abort_subscription(&self, id: u64, conn_id: &str) {
        let sessions = self.sessions.lock().expect("sessions poisoned");
        let Some(entry) = sessions.get(&id) else { return };
        debug!(id, conn_id, "subscription cancelled before ack");
        self.manager.cancel_messages(conn_id);
        entry.method.remove_member(conn_id);
        entry.session.connection_closed(conn_id);
    }

}

/// Adapter giving the directory group a target that can reach back to the
/// owning `Arc<ServerDirectory>`.
pub struct DirectoryTarget {
    directory: Weak<ServerDirectory>,
}

impl DirectoryTarget {
    pub fn new(directory: &Arc<ServerDirectory>) -> Arc<Self> {
        Arc::new(Self {
            directory: Arc::downgrade(directory),
        })
    }
}

impl GroupTarget for DirectoryTarget {
    fn received(&self, from: &Arc<dyn Connection>, node: &XmlNode) {
        let Some(directory) = self.directory.upgrade() else {
            return;
        };
        if let Err(e) = directory.handle_message(from, node) {
            // ACL denials and malformed requests are answered, not fatal.
            debug!(from = from.remote_id(), "request failed: {e}");
            directory.reply(
                from,
                request_failed_seq(&e, node.get_attr("seq")),
            );
        }
    }
}

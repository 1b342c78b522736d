// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    algorithm::{
        algorithm::Algorithm,
        request::{Request, RequestKind},
        state_vector::StateVector,
    },
    comm::{GroupTarget, group::CommunicationGroup},
    error::{RequestError, SyncError},
    operation::Operation,
    session::{
        SessionSignals, SessionStatus,
        sync::SyncProgress,
        users::{User, UserFlags, UserStatus, UserTable},
    },
    text::{
        buffer::TextBuffer,
        chunk::{Chunk, Segment},
        delete::DeleteOperation,
        insert::InsertOperation,
        move_op::MoveOperation,
        record::SessionRecorder,
    },
    transport::Connection,
    util::Signal,
    xml::{XmlNode, request_failed},
};

/// Converts a chunk into its `<segment author="…">text</segment>` children.
pub fn chunk_to_segments(chunk: &Chunk) -> Vec<XmlNode> {
    chunk
        .segments()
        .iter()
        .map(|seg| {
            XmlNode::new("segment")
                .attr("author", seg.author)
                .text(seg.text.clone())
        })
        .collect()
}

/// Rebuilds a chunk from `<segment>` children of `node`.
pub fn chunk_from_segments(node: &XmlNode) -> Result<Chunk> {
    let mut chunk = Chunk::new();
    for seg in node.elements() {
        if seg.name != "segment" {
            bail!("unexpected <{}> inside a chunk", seg.name);
        }
        let author: u32 = seg.parse_attr("author")?;
        chunk.append(Segment::new(author, seg.inner_text()));
    }
    Ok(chunk)
}

/// Encodes an operation into its wire element.
///
/// Deletes are transmitted as `(pos, len)` only; the receiving side
/// recovers the removed text from its buffer when it needs reversibility.
pub fn operation_to_xml(op: &Operation) -> XmlNode {
    match op {
        Operation::NoOp => XmlNode::new("no-op"),
        Operation::Split(split) => XmlNode::new("split")
            .child(operation_to_xml(&split.first))
            .child(operation_to_xml(&split.second)),
        Operation::Insert(ins) => {
            let mut node = XmlNode::new("insert").attr("pos", ins.position);
            for seg in chunk_to_segments(&ins.chunk) {
                node.push(seg);
            }
            node
        },
        Operation::Delete(del) => XmlNode::new("delete")
            .attr("pos", del.position)
            .attr("len", del.len()),
        Operation::Move(mv) => XmlNode::new("move")
            .attr("pos", mv.position)
            .attr("len", mv.length),
    }
}

pub fn operation_from_xml(node: &XmlNode) -> Result<Operation> {
    match node.name.as_str() {
        "no-op" => Ok(Operation::NoOp),
        "split" => {
            let mut parts = node.elements();
            let first = parts.next().context("<split> without first part")?;
            let second = parts.next().context("<split> without second part")?;
            Ok(Operation::split(
                operation_from_xml(first)?,
                operation_from_xml(second)?,
            ))
        },
        "insert" => {
            let pos: usize = node.parse_attr("pos")?;
            Ok(Operation::Insert(InsertOperation::new(
                pos,
                chunk_from_segments(node)?,
            )))
        },
        "delete" => {
            let pos: usize = node.parse_attr("pos")?;
            let len: usize = node.parse_attr("len")?;
            Ok(Operation::Delete(DeleteOperation::from_len(pos, len)))
        },
        "move" => {
            let pos: usize = node.parse_attr("pos")?;
            let len: i64 = node.parse_attr("len")?;
            Ok(Operation::Move(MoveOperation::new(pos, len)))
        },
        other => bail!("unknown operation element <{other}>"),
    }
}

/// `<request user="…" time="…"><do|undo|redo>…</…></request>`
pub fn request_to_xml(request: &Request) -> XmlNode {
    let mut node = XmlNode::new("request")
        .attr("user", request.user)
        .attr("time", request.vector.encode());
    let kind = match &request.kind {
        RequestKind::Do(op) => XmlNode::new("do").child(operation_to_xml(op)),
        RequestKind::Undo => XmlNode::new("undo"),
        RequestKind::Redo => XmlNode::new("redo"),
    };
    node.push(kind);
    node
}

pub fn request_from_xml(node: &XmlNode) -> Result<Request> {
    let user: u32 = node.parse_attr("user")?;
    let vector = StateVector::decode(node.req_attr("time")?)?;
    let kind_node = node.first_element().context("<request> without payload")?;
    let kind = match kind_node.name.as_str() {
        "do" => RequestKind::Do(operation_from_xml(
            kind_node.first_element().context("<do> without operation")?,
        )?),
        "undo" => RequestKind::Undo,
        "redo" => RequestKind::Redo,
        other => bail!("unknown request payload <{other}>"),
    };
    Ok(Request::new(user, vector, kind))
}

fn user_to_xml(tag: &str, user: &User, log_begin: u32) -> XmlNode {
    XmlNode::new(tag)
        .attr("id", user.id)
        .attr("name", user.name.clone())
        .attr("status", user.status.as_str())
        .attr("hue", user.hue)
        .attr("caret", user.caret)
        .attr("selection", user.selection)
        .attr("log-begin", log_begin)
}

fn user_from_xml(node: &XmlNode) -> Result<(User, u32)> {
    let mut user = User::new(node.parse_attr("id")?, node.req_attr("name")?);
    user.status = UserStatus::parse(node.req_attr("status")?)
        .context("bad user status")?;
    user.hue = node.parse_attr("hue").unwrap_or(0.0);
    user.caret = node.parse_attr("caret").unwrap_or(0);
    user.selection = node.parse_attr("selection").unwrap_or(0);
    let log_begin = node.parse_attr("log-begin").unwrap_or(0);
    Ok((user, log_begin))
}

/// State being accumulated by a joining client; nothing touches the live
/// session until `<sync-end/>` verifies, so a failed sync leaves no partial
/// state behind.
#[derive(Default)]
struct SyncReceive {
    progress: SyncProgress,
    users: Vec<(User, u32)>,
    content: Chunk,
    requests: Vec<Request>,
}

/// One outgoing synchronization awaiting `<sync-ack/>`. Holds the sync
/// group alive until the joiner acknowledges or cancels.
struct OutgoingSync {
    _sync_group: Arc<CommunicationGroup>,
}

struct Inner {
    algorithm: Algorithm,
    buffer: Box<dyn TextBuffer>,
}

/// A collaborative text-editing session.
///
/// Owns the user table, the buffer and the adOPTed algorithm; attaches to
/// a subscription group as its target, synchronizes joiners and feeds
/// every received `<request>` through the transformation engine.
pub struct TextSession {
    inner: Mutex<Inner>,
    pub users: Arc<UserTable>,
    status: Mutex<SessionStatus>,
    pub signals: SessionSignals,
    /// The connection id of every acknowledged sync is announced here; the
    /// directory moves the subscriber into the main group.
    pub sync_acknowledged: Signal<String>,
    pub sync_cancelled: Signal<String>,
    group: Mutex<Option<Arc<CommunicationGroup>>>,
    sync_in: Mutex<Option<SyncReceive>>,
    syncs_out: Mutex<HashMap<String, OutgoingSync>>,
    /// Users joined by this process.
    local_users: Mutex<HashSet<u32>>,
    /// Names we asked the publisher to join and wait to see confirmed.
    pending_joins: Mutex<HashSet<String>>,
    /// Connection id → users joined over it (publisher side).
    connection_users: Mutex<HashMap<String, HashSet<u32>>>,
    recorder: Mutex<Option<SessionRecorder>>,
    /// Publisher-side authorization hook for `<user-join>`, installed once
    /// by the directory to enforce the join permission bit.
    join_gate: OnceCell<Box<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl TextSession {
    /// A running session around an existing buffer (server start, or a
    /// locally published document).
    pub fn new_running(buffer: Box<dyn TextBuffer>) -> Arc<Self> {
        let session = Self::with_status(buffer, SessionStatus::Running);
        Arc::new(session)
    }

    /// A session that expects to be synchronized by its publisher.
    pub fn new_synchronizing(buffer: Box<dyn TextBuffer>) -> Arc<Self> {
        let session = Self::with_status(buffer, SessionStatus::Synchronizing);
        *session.sync_in.lock().expect("sync poisoned") =
            Some(SyncReceive::default());
        Arc::new(session)
    }

    fn with_status(buffer: Box<dyn TextBuffer>, status: SessionStatus) -> Self {
        let users = Arc::new(UserTable::new());

        // Other users' carets follow every buffer mutation, on the same
        // stack as the apply call.
        let table = Arc::clone(&users);
        buffer.signals().inserted.connect(move |ins| {
            table.adjust_selections_for_insert(
                ins.user,
                ins.pos,
                ins.chunk.len_chars(),
            );
        });
        let table = Arc::clone(&users);
        buffer.signals().erased.connect(move |erased| {
            table.adjust_selections_for_erase(
                erased.user,
                erased.pos,
                erased.chunk.len_chars(),
            );
        });

        Self {
            inner: Mutex::new(Inner {
                algorithm: Algorithm::new(),
                buffer,
            }),
            users,
            status: Mutex::new(status),
            signals: SessionSignals::default(),
            sync_acknowledged: Signal::new(),
            sync_cancelled: Signal::new(),
            group: Mutex::new(None),
            sync_in: Mutex::new(None),
            syncs_out: Mutex::new(HashMap::new()),
            local_users: Mutex::new(HashSet::new()),
            pending_joins: Mutex::new(HashSet::new()),
            connection_users: Mutex::new(HashMap::new()),
            recorder: Mutex::new(None),
            join_gate: OnceCell::new(),
        }
    }

    pub fn set_join_gate<F>(&self, gate: F)
    where F: Fn(&str) -> bool + Send + Sync + 'static {
        let _ = self.join_gate.set(Box::new(gate));
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("status poisoned")
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().expect("status poisoned") = status;
    }

    /// Attaches the main subscription group.
    pub fn set_subscription_group(&self, group: Arc<CommunicationGroup>) {
        *self.group.lock().expect("group poisoned") = Some(group);
    }

    pub fn subscription_group(&self) -> Option<Arc<CommunicationGroup>> {
        self.group.lock().expect("group poisoned").clone()
    }

    /// Starts recording every executed request to an XML journal.
    pub fn set_recorder(&self, recorder: SessionRecorder) {
        *self.recorder.lock().expect("recorder poisoned") = Some(recorder);
    }

    pub fn content_snapshot(&self) -> Chunk {
        let inner = self.inner.lock().expect("session poisoned");
        let mut chunk = Chunk::new();
        for seg in inner.buffer.runs() {
            chunk.append(seg);
        }
        chunk
    }

    pub fn buffer_modified(&self) -> bool {
        self.inner.lock().expect("session poisoned").buffer.is_modified()
    }

    pub fn mark_saved(&self) {
        self.inner
            .lock()
            .expect("session poisoned")
            .buffer
            .set_modified(false);
    }

    // ---- local editing -------------------------------------------------

    /// Joins a user locally (publisher side assigns the id directly).
    pub fn join_local_user(
        &self,
        name: &str,
        hue: f64,
    ) -> Result<u32, SyncError> {
        // Rejoining under a known name reclaims the old id.
        if let Some(existing) = self.users.lookup_by_name(name) {
            if existing.status != UserStatus::Unavailable {
                return Err(SyncError::NameInUse(name.to_string()));
            }
            self.users.set_status(existing.id, UserStatus::Active)?;
            self.local_users
                .lock()
                .expect("local users poisoned")
                .insert(existing.id);
            self.broadcast_user(existing.id);
            return Ok(existing.id);
        }

        let mut user = User::new(self.users.next_free_id(), name);
        user.status = UserStatus::Active;
        user.flags = UserFlags::LOCAL;
        user.hue = hue;
        let id = user.id;
        self.users.add(user)?;
        self.local_users
            .lock()
            .expect("local users poisoned")
            .insert(id);
        self.broadcast_user(id);
        Ok(id)
    }

    /// Asks the remote publisher to join a user (client side).
    pub fn request_user_join(&self, name: &str, hue: f64) {
        self.pending_joins
            .lock()
            .expect("pending joins poisoned")
            .insert(name.to_string());
        self.send_to_group(
            None,
            XmlNode::new("user-join")
                .attr("name", name)
                .attr("hue", hue),
        );
    }

    fn broadcast_user(&self, id: u32) {
        if let Some(user) = self.users.get(id) {
            let log_begin = {
                let inner = self.inner.lock().expect("session poisoned");
                inner.algorithm.log().start(id)
            };
            self.send_to_group(None, user_to_xml("user", &user, log_begin));
        }
    }

    /// Executes and broadcasts a local request.
    pub fn issue_request(&self, user: u32, kind: RequestKind) -> Result<()> {
        if !self
            .local_users
            .lock()
            .expect("local users poisoned")
            .contains(&user)
        {
            bail!("user {user} is not local to this session");
        }

        let request = {
            let inner = &mut *self.inner.lock().expect("session poisoned");
            let request = inner.algorithm.execute_request(
                user,
                kind,
                inner.buffer.as_mut(),
                &self.users,
            )?;
            self.record(&request);
            request
        };

        self.send_to_group(None, request_to_xml(&request));
        Ok(())
    }

    pub fn insert_text(&self, user: u32, pos: usize, text: &str) -> Result<()> {
        self.issue_request(
            user,
            RequestKind::Do(Operation::Insert(InsertOperation::new(
                pos,
                Chunk::from_text(user, text),
            ))),
        )
    }

    /// Issues a reversible delete: the removed chunk is looked up before
    /// the request executes.
    pub fn delete_text(&self, user: u32, pos: usize, len: usize) -> Result<()> {
        let chunk = {
            let inner = self.inner.lock().expect("session poisoned");
            inner.buffer.slice(pos, len)?
        };
        self.issue_request(
            user,
            RequestKind::Do(Operation::Delete(DeleteOperation::from_chunk(
                pos, chunk,
            ))),
        )
    }

    pub fn undo(&self, user: u32) -> Result<()> {
        self.issue_request(user, RequestKind::Undo)
    }

    pub fn redo(&self, user: u32) -> Result<()> {
        self.issue_request(user, RequestKind::Redo)
    }

    /// Moves the local user's caret; broadcast but never logged.
    pub fn set_selection(&self, user: u32, pos: usize, selection: i64) -> Result<()> {
        self.issue_request(
            user,
            RequestKind::Do(Operation::Move(MoveOperation::new(pos, selection))),
        )
    }

    fn record(&self, request: &Request) {
        if let Some(recorder) = self
            .recorder
            .lock()
            .expect("recorder poisoned")
            .as_mut()
        {
            if let Err(e) = recorder.record_request(request) {
                warn!("session record failed: {e}");
            }
        }
    }

    fn send_to_group(&self, except: Option<&str>, node: XmlNode) {
        if let Some(group) = self.subscription_group() {
            group.send_all(except, node);
        }
    }

    // ---- synchronization: publisher side -------------------------------

    /// Serializes the full session state as sync body stanzas.
    fn sync_messages(&self) -> Vec<XmlNode> {
        let inner = self.inner.lock().expect("session poisoned");
        let mut out = Vec::new();

        for user in self.users.snapshot() {
            out.push(user_to_xml(
                "sync-user",
                &user,
                inner.algorithm.log().start(user.id),
            ));
        }

        for seg in inner.buffer.runs() {
            out.push(
                XmlNode::new("sync-segment")
                    .attr("author", seg.author)
                    .text(seg.text),
            );
        }

        let log = inner.algorithm.log();
        for user in log.user_ids() {
            for seq in log.start(user)..log.count(user) {
                if let Some(entry) = log.get(user, seq) {
                    let mut node = request_to_xml(&entry.request);
                    node.name = "sync-request".to_string();
                    out.push(node);
                }
            }
        }
        out
    }

    /// Sends the whole session to a joiner over its dedicated sync group.
    /// Main-group traffic for that connection must be blocked by the
    /// caller until the ack arrives.
    pub fn synchronize_to(
        self: &Arc<Self>,
        conn: &Arc<dyn Connection>,
        sync_group: Arc<CommunicationGroup>,
    ) {
        let messages = self.sync_messages();
        sync_group.send_single(
            conn,
            XmlNode::new("sync-begin").attr("num-messages", messages.len()),
        );
        for message in messages {
            sync_group.send_single(conn, message);
        }
        sync_group.send_single(conn, XmlNode::new("sync-end"));

        self.syncs_out.lock().expect("syncs poisoned").insert(
            conn.remote_id().to_string(),
            OutgoingSync {
                _sync_group: sync_group,
            },
        );
    }

    /// Publisher-side bookkeeping for users joined over a connection, so a
    /// closed connection marks them unavailable.
    pub fn bind_user_to_connection(&self, conn_id: &str, user: u32) {
        self.connection_users
            .lock()
            .expect("connection users poisoned")
            .entry(conn_id.to_string())
            .or_default()
            .insert(user);
    }

    /// A subscriber's transport went away: its users depart, and any sync
    /// in flight towards it fails.
    pub fn connection_closed(&self, conn_id: &str) {
        if let Some(users) = self
            .connection_users
            .lock()
            .expect("connection users poisoned")
            .remove(conn_id)
        {
            for user in users {
                let _ = self.users.set_status(user, UserStatus::Unavailable);
                {
                    let inner = &mut *self.inner.lock().expect("session poisoned");
                    inner.algorithm.forget_peer(user);
                }
                self.send_to_group(
                    Some(conn_id),
                    XmlNode::new("user-status-change")
                        .attr("id", user)
                        .attr("status", UserStatus::Unavailable.as_str()),
                );
            }
        }
        self.syncs_out.lock().expect("syncs poisoned").remove(conn_id);
    }

    // ---- synchronization: joiner side ----------------------------------

    fn handle_sync_stanza(
        &self,
        from: &Arc<dyn Connection>,
        node: &XmlNode,
    ) -> Result<(), SyncError> {
        let mut guard = self.sync_in.lock().expect("sync poisoned");
        let Some(sync) = guard.as_mut() else {
            return Err(SyncError::UnexpectedNode(node.name.clone()));
        };

        match node.name.as_str() {
            "sync-begin" => {
                let count: u32 = node
                    .parse_attr("num-messages")
                    .map_err(|e| SyncError::MalformedBegin(e.to_string()))?;
                sync.progress.begin(count)?;
            },
            "sync-user" => {
                sync.progress.body(&node.name)?;
                let (user, log_begin) = user_from_xml(node)
                    .map_err(|e| SyncError::UnexpectedNode(e.to_string()))?;
                sync.users.push((user, log_begin));
            },
            "sync-segment" => {
                sync.progress.body(&node.name)?;
                let author: u32 = node
                    .parse_attr("author")
                    .map_err(|e| SyncError::UnexpectedNode(e.to_string()))?;
                sync.content.append(Segment::new(author, node.inner_text()));
            },
            "sync-request" => {
                sync.progress.body(&node.name)?;
                let request = request_from_xml(node)
                    .map_err(|e| SyncError::UnexpectedNode(e.to_string()))?;
                sync.requests.push(request);
            },
            "sync-end" => {
                sync.progress.end()?;
                let staged = guard.take().expect("checked above");
                drop(guard);
                self.finish_sync_in(from, staged)?;
            },
            "sync-cancel" => {
                drop(guard);
                self.fail_sync(SyncError::SenderCancelled);
                return Ok(());
            },
            other => return Err(SyncError::UnexpectedNode(other.to_string())),
        }
        Ok(())
    }

    fn finish_sync_in(
        &self,
        from: &Arc<dyn Connection>,
        staged: SyncReceive,
    ) -> Result<(), SyncError> {
        let offsets: Vec<(u32, u32)> = staged
            .users
            .iter()
            .map(|(user, log_begin)| (user.id, *log_begin))
            .collect();

        for (user, _) in staged.users {
            self.users.add(user)?;
        }

        {
            let inner = &mut *self.inner.lock().expect("session poisoned");
            inner
                .buffer
                .insert_chunk(0, &staged.content, 0)
                .map_err(|e| SyncError::UnexpectedNode(e.to_string()))?;
            inner.buffer.set_modified(false);
            inner
                .algorithm
                .restore(&offsets, staged.requests)
                .map_err(|e| SyncError::UnexpectedNode(e.to_string()))?;
        }

        self.set_status(SessionStatus::Running);
        // Only now does the publisher release held main-group traffic.
        if let Some(group) = self.subscription_group() {
            group.send_single(from, XmlNode::new("sync-ack"));
        }
        self.signals.synchronization_complete.emit(&());
        debug!("synchronization complete");
        Ok(())
    }

    fn fail_sync(&self, error: SyncError) {
        *self.sync_in.lock().expect("sync poisoned") = None;
        self.set_status(SessionStatus::Closed);
        self.signals
            .synchronization_failed
            .emit(&error.to_string());
    }

    // ---- running-state message handling --------------------------------

    fn handle_request(&self, node: &XmlNode) -> Result<()> {
        let request = request_from_xml(node)?;
        {
            let inner = &mut *self.inner.lock().expect("session poisoned");
            inner.algorithm.receive_request(
                request.clone(),
                inner.buffer.as_mut(),
                &self.users,
            )?;
        }
        self.record(&request);
        Ok(())
    }

    /// Publisher handling of `<user-join>`: allocate an id (or revive the
    /// old record) and broadcast the result to every member.
    fn handle_user_join(
        &self,
        from: &Arc<dyn Connection>,
        node: &XmlNode,
    ) -> Result<()> {
        let group = self.subscription_group();
        let Some(group) = group else {
            bail!("user-join without a subscription group");
        };
        if !group.is_publisher() {
            // Relayed copy of another member's join; only the publisher
            // allocates ids, its <user> broadcast is what counts here.
            return Ok(());
        }

        if let Some(gate) = self.join_gate.get()
            && !gate(from.remote_id())
        {
            group.send_single(from, request_failed(&RequestError::NotAuthorized));
            return Ok(());
        }

        let name = node.req_attr("name")?;
        let hue: f64 = node.parse_attr("hue").unwrap_or(0.0);

        let user = match self.users.lookup_by_name(name) {
            Some(existing) if existing.status == UserStatus::Unavailable => {
                self.users.set_status(existing.id, UserStatus::Active)?;
                self.users.get(existing.id).expect("just updated")
            },
            Some(existing) => {
                // Name collisions are answered, not fatal.
                let err = SyncError::NameInUse(existing.name);
                group.send_single(from, request_failed(&err));
                return Ok(());
            },
            None => {
                let mut user = User::new(self.users.next_free_id(), name);
                user.status = UserStatus::Active;
                user.hue = hue;
                self.users.add(user.clone())?;
                user
            },
        };

        self.bind_user_to_connection(from.remote_id(), user.id);
        let log_begin = {
            let inner = self.inner.lock().expect("session poisoned");
            inner.algorithm.log().start(user.id)
        };
        self.send_to_group(None, user_to_xml("user", &user, log_begin));
        Ok(())
    }

    /// `<user …/>` broadcast from the publisher.
    fn handle_user_announce(&self, node: &XmlNode) -> Result<()> {
        let (user, _) = user_from_xml(node)?;
        let id = user.id;
        let name = user.name.clone();

        match self.users.get(id) {
            Some(_) => {
                self.users.set_status(id, user.status)?;
            },
            None => {
                self.users.add(user)?;
            },
        }

        // A join we asked for comes back as a plain announce; the matching
        // name marks the user as ours.
        if self
            .pending_joins
            .lock()
            .expect("pending joins poisoned")
            .remove(&name)
        {
            self.local_users
                .lock()
                .expect("local users poisoned")
                .insert(id);
        }
        Ok(())
    }

    fn handle_status_change(&self, node: &XmlNode) -> Result<()> {
        let id: u32 = node.parse_attr("id")?;
        let status = UserStatus::parse(node.req_attr("status")?)
            .context("bad user status")?;
        self.users.set_status(id, status)?;
        if status == UserStatus::Unavailable {
            let inner = &mut *self.inner.lock().expect("session poisoned");
            inner.algorithm.forget_peer(id);
        }
        Ok(())
    }

    /// Closes the session: tells the group, drops the target and fires the
    /// closed signal exactly once.
    pub fn close(&self) {
        {
            let mut status = self.status.lock().expect("status poisoned");
            if *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closed;
        }
        self.send_to_group(None, XmlNode::new("session-close"));
        if let Some(group) = self.group.lock().expect("group poisoned").take() {
            group.clear_target();
        }
        if let Some(mut recorder) = self.recorder.lock().expect("recorder poisoned").take()
        {
            let _ = recorder.finish();
        }
        self.signals.closed.emit(&());
    }

    /// Periodic log pruning entry point, driven by the owner's timer.
    pub fn cleanup(&self) {
        let inner = &mut *self.inner.lock().expect("session poisoned");
        inner.algorithm.cleanup();
    }

    fn fatal(&self, context: &str, err: &anyhow::Error) {
        warn!("{context}: {err:#}");
        self.signals.error.emit(&format!("{context}: {err}"));
        self.close();
    }
}

impl GroupTarget for TextSession {
    fn received(&self, from: &Arc<dyn Connection>, node: &XmlNode) {
        // Publisher-side sync control stanzas arrive on the sync group.
        match node.name.as_str() {
            "sync-ack" => {
                if self
                    .syncs_out
                    .lock()
                    .expect("syncs poisoned")
                    .remove(from.remote_id())
                    .is_some()
                {
                    self.sync_acknowledged.emit(&from.remote_id().to_string());
                }
                return;
            },
            "sync-cancel" if self.status() == SessionStatus::Running => {
                if self
                    .syncs_out
                    .lock()
                    .expect("syncs poisoned")
                    .remove(from.remote_id())
                    .is_some()
                {
                    self.sync_cancelled.emit(&from.remote_id().to_string());
                }
                return;
            },
            _ => {},
        }

        if self.status() == SessionStatus::Synchronizing {
            if let Err(e) = self.handle_sync_stanza(from, node) {
                warn!("synchronization failed: {e}");
                self.fail_sync(e);
            }
            return;
        }

        let result = match node.name.as_str() {
            "request" => self.handle_request(node),
            "user-join" => self.handle_user_join(from, node),
            "user" => self.handle_user_announce(node),
            "user-status-change" => self.handle_status_change(node),
            "session-close" => {
                self.close();
                Ok(())
            },
            other => {
                Err(RequestError::UnexpectedMessage(other.to_string()).into())
            },
        };

        if let Err(e) = result {
            // Apply and protocol errors are fatal to the session; the
            // buffer is the source of truth and must not diverge.
            self.fatal("failed to process session message", &e);
        }
    }
}

impl std::fmt::Debug for TextSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextSession")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

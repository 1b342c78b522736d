// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use infinote_rs::{
    acl::{AccountStore, AclMask, AclSheet, SheetSet},
    comm::registry::CommunicationManager,
    directory::{
        NOTE_TYPE_TEXT,
        client::{ClientDirectory, ClientTarget, RequestOutcome},
        server::ServerDirectory,
        storage::FilesystemStorage,
    },
    session::{SessionStatus, users::UserStatus},
    text::session::TextSession,
    transport::{Connection, simulated::SimulatedConnection},
};

/// One simulated client attached to the server.
struct Client {
    directory: Arc<ClientDirectory>,
    _target: Arc<ClientTarget>,
    /// The server's endpoint of the pipe.
    server_end: Arc<SimulatedConnection>,
    /// The client's endpoint of the pipe.
    client_end: Arc<SimulatedConnection>,
}

struct Fixture {
    server: Arc<ServerDirectory>,
    clients: Vec<Client>,
    _root: tempfile::TempDir,
}

impl Fixture {
    fn new(root_sheet: AclSheet) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let storage =
            Arc::new(FilesystemStorage::new(root.path()).expect("storage"));
        let accounts = Arc::new(AccountStore::new());
        let manager = Arc::new(CommunicationManager::new());
        let server =
            ServerDirectory::new(storage, accounts, manager).expect("directory");

        let mut sheets = SheetSet::new();
        sheets.set("default", root_sheet);
        server.set_acl(0, sheets).expect("seed acl");

        Self {
            server,
            clients: Vec::new(),
            _root: root,
        }
    }

    fn permissive() -> AclSheet {
        AclSheet::new(AclMask::all(), AclMask::all())
    }

    fn connect(&mut self, name: &str) -> usize {
        let (server_end, client_end) = SimulatedConnection::pair("server", name);
        let server_conn: Arc<dyn Connection> = server_end.clone();
        self.server.add_connection(server_conn);

        let client_manager = Arc::new(CommunicationManager::new());
        let client_conn: Arc<dyn Connection> = client_end.clone();
        let (directory, target) =
            ClientDirectory::connect(&client_manager, client_conn);

        self.clients.push(Client {
            directory,
            _target: target,
            server_end,
            client_end,
        });
        self.clients.len() - 1
    }

    /// Pumps stanzas in both directions until everything settled.
    fn pump(&self) {
        for _ in 0..64 {
            let mut quiet = true;
            for client in &self.clients {
                if client.client_end.queued() > 0 {
                    client.client_end.flush();
                    quiet = false;
                }
                if client.server_end.queued() > 0 {
                    client.server_end.flush();
                    quiet = false;
                }
            }
            if quiet {
                return;
            }
        }
        panic!("stanza storm: connections never settled");
    }

    fn client(&self, idx: usize) -> &Arc<ClientDirectory> {
        &self.clients[idx].directory
    }
}

/// Joins a user on a subscribed session and returns its id.
fn join_user(fixture: &Fixture, session: &Arc<TextSession>, name: &str) -> u32 {
    session.request_user_join(name, 0.5);
    fixture.pump();
    session
        .users
        .lookup_by_name(name)
        .unwrap_or_else(|| panic!("user {name} not joined"))
        .id
}

#[test]
fn test_explore_subscribe_edit_converge() {
    let mut fixture = Fixture::new(Fixture::permissive());
    let doc = fixture
        .server
        .add_note(0, "doc", NOTE_TYPE_TEXT, SheetSet::new(), None)
        .expect("add note");

    let a = fixture.connect("clientA");

    // Explore mirrors the root.
    let explore = fixture.client(a).explore(0);
    fixture.pump();
    assert!(matches!(
        explore.result(),
        Some(Ok(RequestOutcome::Node(0)))
    ));
    assert!(fixture.client(a).tree().lock().expect("tree").contains(doc));

    // Subscribe runs the full synchronization.
    let subscribe = fixture.client(a).subscribe(doc);
    fixture.pump();
    assert!(matches!(
        subscribe.result(),
        Some(Ok(RequestOutcome::Node(_)))
    ));
    let session_a = fixture.client(a).session(doc).expect("session");
    assert_eq!(session_a.status(), SessionStatus::Running);

    // Join and edit from A; the server's buffer follows.
    let alice = join_user(&fixture, &session_a, "alice");
    session_a.insert_text(alice, 0, "hello").expect("insert");
    fixture.pump();

    let server_session = fixture.server.session_for(doc).expect("server session");
    assert_eq!(server_session.content_snapshot().to_plain_text(), "hello");

    // A second subscriber syncs in the live state, then edits.
    let b = fixture.connect("clientB");
    fixture.client(b).explore(0);
    fixture.pump();
    fixture.client(b).subscribe(doc);
    fixture.pump();
    let session_b = fixture.client(b).session(doc).expect("session b");
    assert_eq!(session_b.status(), SessionStatus::Running);
    assert_eq!(session_b.content_snapshot().to_plain_text(), "hello");
    assert!(
        session_b.users.lookup_by_name("alice").is_some(),
        "synchronized user table"
    );

    let bob = join_user(&fixture, &session_b, "bob");
    session_b.insert_text(bob, 5, " world").expect("insert");
    fixture.pump();

    for session in [&session_a, &session_b, &server_session] {
        assert_eq!(session.content_snapshot().to_plain_text(), "hello world");
    }

    // Concurrent edits from both sides still converge through the relay.
    session_a.insert_text(alice, 0, ">").expect("insert");
    session_b.delete_text(bob, 5, 6).expect("delete");
    fixture.pump();

    let expected = server_session.content_snapshot().to_plain_text();
    assert_eq!(expected, ">hello");
    assert_eq!(session_a.content_snapshot().to_plain_text(), expected);
    assert_eq!(session_b.content_snapshot().to_plain_text(), expected);
}

#[test]
fn test_rename_collision_fails_over_the_wire() {
    let mut fixture = Fixture::new(Fixture::permissive());
    let a = fixture.connect("clientA");

    let add_a = fixture.client(a).add_subdirectory(0, "a");
    fixture.pump();
    let Some(Ok(RequestOutcome::Node(node_a))) = add_a.result() else {
        panic!("add a failed: {:?}", add_a.result());
    };
    fixture.client(a).add_subdirectory(0, "b");
    fixture.pump();

    let rename = fixture.client(a).rename_node(node_a, "b");
    fixture.pump();
    match rename.result() {
        Some(Err(text)) => assert!(text.contains("already exists"), "{text}"),
        other => panic!("rename must fail, got {other:?}"),
    }

    // Both children remain as before.
    let tree = fixture.client(a).tree().lock().expect("tree");
    assert_eq!(tree.get(node_a).expect("node a").name, "a");
    assert_eq!(tree.children(0).expect("root").len(), 2);
}

#[test]
fn test_acl_denial_is_answered_not_fatal() {
    // Everything allowed except removing nodes.
    let allowed = AclMask::all() & !AclMask::CAN_REMOVE_NODE;
    let mut fixture = Fixture::new(AclSheet::new(AclMask::all(), allowed));
    let doc = fixture
        .server
        .add_note(0, "doc", NOTE_TYPE_TEXT, SheetSet::new(), None)
        .expect("add note");

    let a = fixture.connect("clientA");
    fixture.client(a).explore(0);
    fixture.pump();

    let remove = fixture.client(a).remove_node(doc);
    fixture.pump();
    assert!(matches!(remove.result(), Some(Err(_))));
    assert!(fixture.client(a).tree().lock().expect("tree").contains(doc));

    // The connection survives the denial and keeps working.
    let query = fixture.client(a).query_acl(0);
    fixture.pump();
    assert!(matches!(query.result(), Some(Ok(RequestOutcome::Acl(_)))));
}

#[test]
fn test_remove_node_closes_sessions_recursively() {
    let mut fixture = Fixture::new(Fixture::permissive());
    let dir = fixture
        .server
        .add_subdirectory(0, "project", SheetSet::new())
        .expect("subdir");
    let doc = fixture
        .server
        .add_note(dir, "doc", NOTE_TYPE_TEXT, SheetSet::new(), None)
        .expect("note");

    let a = fixture.connect("clientA");
    fixture.client(a).explore(0);
    fixture.pump();
    fixture.client(a).explore(dir);
    fixture.pump();
    fixture.client(a).subscribe(doc);
    fixture.pump();

    let session = fixture.client(a).session(doc).expect("session");
    assert_eq!(session.status(), SessionStatus::Running);

    let remove = fixture.client(a).remove_node(dir);
    fixture.pump();
    assert!(matches!(remove.result(), Some(Ok(_))));

    // Deleting the subdirectory closed the live session underneath it.
    assert_eq!(session.status(), SessionStatus::Closed);
    let tree = fixture.client(a).tree().lock().expect("tree");
    assert!(!tree.contains(doc));
    assert!(!tree.contains(dir));
}

#[test]
fn test_departed_user_record_persists() {
    let mut fixture = Fixture::new(Fixture::permissive());
    let doc = fixture
        .server
        .add_note(0, "doc", NOTE_TYPE_TEXT, SheetSet::new(), None)
        .expect("note");

    let a = fixture.connect("clientA");
    fixture.client(a).explore(0);
    fixture.pump();
    fixture.client(a).subscribe(doc);
    fixture.pump();
    let session_a = fixture.client(a).session(doc).expect("session");
    let alice = join_user(&fixture, &session_a, "alice");
    session_a.insert_text(alice, 0, "hi").expect("insert");
    fixture.pump();

    // The transport goes away; the server marks alice unavailable but
    // keeps the record.
    fixture.clients[a].client_end.close();
    let server_session = fixture.server.session_for(doc).expect("server session");
    let record = server_session
        .users
        .lookup_by_name("alice")
        .expect("record persists");
    assert_eq!(record.status, UserStatus::Unavailable);
}

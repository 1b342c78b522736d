// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use infinote_rs::{
    acl::AccountStore,
    comm::registry::CommunicationManager,
    directory::{
        NOTE_TYPE_TEXT, server::ServerDirectory, storage::FilesystemStorage,
    },
    session::users::User,
    text::{
        chunk::{Chunk, Segment},
        filesystem_format::PersistedTextSession,
    },
};

fn server(root: &std::path::Path) -> Arc<ServerDirectory> {
    let storage = Arc::new(FilesystemStorage::new(root).expect("storage"));
    let accounts = Arc::new(AccountStore::new());
    let manager = Arc::new(CommunicationManager::new());
    ServerDirectory::new(storage, accounts, manager).expect("directory")
}

#[test]
fn test_session_filesystem_roundtrip() {
    // Reading back a persisted session yields the chunk sequence that was
    // written, authors included.
    let root = tempfile::tempdir().expect("tempdir");

    let mut content = Chunk::new();
    content.append(Segment::new(1, "alpha "));
    content.append(Segment::new(2, "beta"));
    content.append(Segment::new(1, " gamma"));

    let users = vec![User::new(1, "alice"), User::new(2, "bob")];

    {
        let directory = server(root.path());
        let doc = directory
            .add_note(0, "doc", NOTE_TYPE_TEXT, Default::default(), None)
            .expect("add note");
        let session = directory.session_for(doc).expect("session");
        for user in &users {
            session.users.add(user.clone()).expect("user");
        }
        session.join_local_user("writer-1", 0.1).expect("join");
        // Write the content through the buffer path so authorship runs
        // through the normal segment machinery.
        let writer = session.users.lookup_by_name("writer-1").expect("writer").id;
        session
            .insert_text(writer, 0, &content.to_plain_text())
            .expect("insert");
        directory.save_session(doc).expect("save");
    }

    // A fresh server over the same root sees the document.
    let directory = server(root.path());
    let doc = directory
        .explore(0)
        .expect("explore")
        .into_iter()
        .next()
        .expect("one child");
    let session = directory.session_for(doc).expect("reload");
    assert_eq!(
        session.content_snapshot().to_plain_text(),
        content.to_plain_text()
    );
}

#[test]
fn test_raw_format_preserves_chunk_sequence() {
    let mut content = Chunk::new();
    content.append(Segment::new(1, "Hello, "));
    content.append(Segment::new(2, "world"));
    content.append(Segment::new(1, "!"));

    let users = vec![
        User::new(1, "alice"),
        User::new(2, "bob"),
        User::new(9, "silent"),
    ];
    let persisted = PersistedTextSession::capture(content.clone(), &users);
    let restored =
        PersistedTextSession::from_bytes(&persisted.to_bytes()).expect("parse");

    assert_eq!(restored.content, content);
    let names: Vec<&str> = restored.users.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"], "only contributors persist");
}

#[test]
fn test_adopting_a_running_session() {
    use infinote_rs::text::{buffer::DefaultTextBuffer, session::TextSession};

    // Publishing an already-running document: the tree adopts the live
    // session's buffer instead of creating a fresh one.
    let root = tempfile::tempdir().expect("tempdir");
    let directory = server(root.path());

    let mut buffer = DefaultTextBuffer::new();
    {
        use infinote_rs::text::buffer::TextBuffer;
        buffer
            .insert_chunk(0, &Chunk::from_text(1, "drafted offline"), 1)
            .expect("seed");
    }
    let session = TextSession::new_running(Box::new(buffer));

    let doc = directory
        .add_note(0, "published", NOTE_TYPE_TEXT, Default::default(), Some(session))
        .expect("adopt");

    let adopted = directory.session_for(doc).expect("same session");
    assert_eq!(
        adopted.content_snapshot().to_plain_text(),
        "drafted offline"
    );

    // And it went to storage with the adopted content.
    let fresh = server(root.path());
    let id = fresh.explore(0).expect("explore")[0];
    let reloaded = fresh.session_for(id).expect("reload");
    assert_eq!(
        reloaded.content_snapshot().to_plain_text(),
        "drafted offline"
    );
}

#[test]
fn test_acl_survives_restart() {
    use infinote_rs::acl::{AclMask, AclSheet, SheetSet};

    let root = tempfile::tempdir().expect("tempdir");
    {
        let directory = server(root.path());
        let mut sheets = SheetSet::new();
        sheets.set(
            "default",
            AclSheet::new(AclMask::CAN_EXPLORE_NODE, AclMask::CAN_EXPLORE_NODE),
        );
        directory.set_acl(0, sheets).expect("set acl");
    }

    let directory = server(root.path());
    let granted = directory
        .check_acl(0, "anyone", AclMask::CAN_EXPLORE_NODE)
        .expect("check");
    assert_eq!(granted, AclMask::CAN_EXPLORE_NODE);
}

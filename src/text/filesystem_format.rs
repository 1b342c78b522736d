// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    error::StorageError,
    session::users::User,
    text::chunk::{Chunk, Segment},
    xml::{XmlChild, XmlNode},
};

/// A text document as persisted by the directory:
///
/// ```text
/// <inf-text-session>
///   <user id="U" name="N" hue="H"/>
///   <buffer>
///     <segment author="U">text</segment>
///   </buffer>
/// </inf-text-session>
/// ```
///
/// Only users who contributed to the buffer are persisted; the segment
/// order reconstructs the buffer concatenatively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedTextSession {
    pub users: Vec<PersistedUser>,
    pub content: Chunk,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedUser {
    pub id: u32,
    pub name: String,
    pub hue: f64,
}

impl PersistedTextSession {
    /// Captures buffer content plus the contributing subset of `users`.
    pub fn capture(content: Chunk, users: &[User]) -> Self {
        let contributors: std::collections::BTreeSet<u32> =
            content.segments().iter().map(|s| s.author).collect();
        let users = users
            .iter()
            .filter(|u| contributors.contains(&u.id))
            .map(|u| PersistedUser {
                id: u.id,
                name: u.name.clone(),
                hue: u.hue,
            })
            .collect();
        Self { users, content }
    }

    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("inf-text-session");
        for user in &self.users {
            root.push(
                XmlNode::new("user")
                    .attr("id", user.id)
                    .attr("name", user.name.clone())
                    .attr("hue", user.hue),
            );
        }
        let mut buffer = XmlNode::new("buffer");
        for seg in self.content.segments() {
            buffer.push(
                XmlNode::new("segment")
                    .attr("author", seg.author)
                    .text(seg.text.clone()),
            );
        }
        root.push(buffer);
        root
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_vec();
        out.extend_from_slice(&self.to_xml().to_bytes());
        out.push(b'\n');
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let root = XmlNode::from_bytes(bytes)
            .map_err(|e| StorageError::MalformedDocument(e.to_string()))?;
        Self::from_xml(&root)
    }

    pub fn from_xml(root: &XmlNode) -> Result<Self, StorageError> {
        if root.name != "inf-text-session" {
            return Err(StorageError::NotATextSession);
        }

        let mut out = PersistedTextSession::default();
        for child in root.elements() {
            match child.name.as_str() {
                "user" => {
                    let user = PersistedUser {
                        id: child
                            .parse_attr("id")
                            .map_err(|e| StorageError::MalformedDocument(e.to_string()))?,
                        name: child
                            .req_attr("name")
                            .map_err(|e| StorageError::MalformedDocument(e.to_string()))?
                            .to_string(),
                        hue: child.parse_attr("hue").unwrap_or(0.0),
                    };
                    out.users.push(user);
                },
                "buffer" => {
                    for seg in child.elements() {
                        if seg.name != "segment" {
                            return Err(StorageError::MalformedDocument(format!(
                                "unexpected <{}> in buffer",
                                seg.name
                            )));
                        }
                        let author = seg.parse_attr("author").map_err(|e| {
                            StorageError::MalformedDocument(e.to_string())
                        })?;
                        // Whitespace-only segments are significant; take
                        // the raw character data as-is.
                        let text = seg
                            .children
                            .iter()
                            .filter_map(|c| match c {
                                XmlChild::Text(t) => Some(t.as_str()),
                                XmlChild::Element(_) => None,
                            })
                            .collect::<String>();
                        out.content.append(Segment::new(author, text));
                    }
                },
                other => {
                    return Err(StorageError::MalformedDocument(format!(
                        "unexpected <{other}> in text session"
                    )));
                },
            }
        }
        Ok(out)
    }
}

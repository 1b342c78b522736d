// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    acl::SheetSet,
    error::StorageError,
    text::filesystem_format::PersistedTextSession,
    xml::XmlNode,
};

/// A directory entry as the storage backend sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageNode {
    Subdirectory { name: String },
    Note { name: String, note_type: String },
}

impl StorageNode {
    pub fn name(&self) -> &str {
        match self {
            StorageNode::Subdirectory { name } => name,
            StorageNode::Note { name, .. } => name,
        }
    }
}

/// The single storage interface behind the server directory.
///
/// Node paths are slash-separated tree paths (`"/a/doc"`); sibling order
/// returned by `read_subdirectory` is authoritative and preserved across
/// explorations.
pub trait DirectoryStorage: Send + Sync {
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, StorageError>;
    fn create_subdirectory(&self, path: &str) -> Result<(), StorageError>;
    fn read_text(&self, path: &str) -> Result<PersistedTextSession, StorageError>;
    fn write_text(
        &self,
        path: &str,
        doc: &PersistedTextSession,
    ) -> Result<(), StorageError>;
    fn remove_node(&self, path: &str) -> Result<(), StorageError>;

    /// The node-path → sheet-set map, persisted as one document.
    fn read_acl(&self) -> Result<BTreeMap<String, SheetSet>, StorageError>;
    fn write_acl(&self, acl: &BTreeMap<String, SheetSet>) -> Result<(), StorageError>;
}

/// Stores the tree under a root directory: subdirectories map to
/// directories, text notes to `<name>.xml` documents, the ACL to a single
/// `global-acl.xml` beside the root.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
}

const NOTE_SUFFIX: &str = ".xml";
const ACL_FILE: &str = "global-acl.xml";

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir_path(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        out
    }

    fn note_path(&self, path: &str) -> PathBuf {
        let mut full = self.dir_path(path);
        let name = format!(
            "{}{NOTE_SUFFIX}",
            full.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        full.pop();
        full.join(name)
    }

    fn acl_path(&self) -> PathBuf {
        self.root.join(ACL_FILE)
    }
}

impl DirectoryStorage for FilesystemStorage {
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, StorageError> {
        let dir = self.dir_path(path);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == ACL_FILE {
                continue;
            }
            if entry.file_type()?.is_dir() {
                out.push(StorageNode::Subdirectory { name: file_name });
            } else if let Some(name) = file_name.strip_suffix(NOTE_SUFFIX) {
                out.push(StorageNode::Note {
                    name: name.to_string(),
                    note_type: crate::directory::NOTE_TYPE_TEXT.to_string(),
                });
            } else {
                debug!(?file_name, "ignoring unrecognized storage entry");
            }
        }
        // Storage order is the sibling order; keep it stable.
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    fn create_subdirectory(&self, path: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(self.dir_path(path))?;
        Ok(())
    }

    fn read_text(&self, path: &str) -> Result<PersistedTextSession, StorageError> {
        let bytes = std::fs::read(self.note_path(path))?;
        PersistedTextSession::from_bytes(&bytes)
    }

    fn write_text(
        &self,
        path: &str,
        doc: &PersistedTextSession,
    ) -> Result<(), StorageError> {
        let full = self.note_path(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, doc.to_bytes())?;
        Ok(())
    }

    fn remove_node(&self, path: &str) -> Result<(), StorageError> {
        let dir = self.dir_path(path);
        if dir.is_dir() {
            std::fs::remove_dir_all(dir)?;
            return Ok(());
        }
        match std::fs::remove_file(self.note_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_acl(&self) -> Result<BTreeMap<String, SheetSet>, StorageError> {
        let bytes = match std::fs::read(self.acl_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            },
            Err(e) => return Err(e.into()),
        };
        let root = XmlNode::from_bytes(&bytes)
            .map_err(|e| StorageError::MalformedDocument(e.to_string()))?;

        let mut out = BTreeMap::new();
        for node in root.elements() {
            if node.name != "node" {
                continue;
            }
            let path = node
                .req_attr("path")
                .map_err(|e| StorageError::MalformedDocument(e.to_string()))?
                .to_string();
            if let Some(acl) = node.find_child("acl") {
                let sheets = SheetSet::from_xml(acl)
                    .map_err(|e| StorageError::MalformedDocument(e.to_string()))?;
                out.insert(path, sheets);
            }
        }
        Ok(out)
    }

    fn write_acl(&self, acl: &BTreeMap<String, SheetSet>) -> Result<(), StorageError> {
        let mut root = XmlNode::new("directory-acl");
        for (path, sheets) in acl {
            if sheets.is_empty() {
                continue;
            }
            root.push(
                XmlNode::new("node")
                    .attr("path", path.clone())
                    .child(sheets.to_xml()),
            );
        }
        let mut bytes = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_vec();
        bytes.extend_from_slice(&root.to_bytes());
        std::fs::write(self.acl_path(), bytes)?;
        Ok(())
    }
}

/// Storage path helpers shared with the daemon.
pub fn storage_path_for(root: &Path, tree_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in tree_path.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acl::{AclMask, AclSheet},
        text::chunk::{Chunk, Segment},
    };

    #[test]
    fn test_tree_roundtrip() -> Result<(), StorageError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FilesystemStorage::new(dir.path())?;

        storage.create_subdirectory("/docs")?;
        let mut content = Chunk::new();
        content.append(Segment::new(1, "hello"));
        let doc = PersistedTextSession {
            users: vec![],
            content,
        };
        storage.write_text("/docs/readme", &doc)?;
        storage.write_text("/top", &doc)?;

        let root_nodes = storage.read_subdirectory("/")?;
        assert_eq!(root_nodes, vec![
            StorageNode::Subdirectory {
                name: "docs".to_string()
            },
            StorageNode::Note {
                name: "top".to_string(),
                note_type: "InfText".to_string()
            },
        ]);

        let restored = storage.read_text("/docs/readme")?;
        assert_eq!(restored.content.to_plain_text(), "hello");

        storage.remove_node("/docs")?;
        assert!(storage.read_text("/docs/readme").is_err());
        Ok(())
    }

    #[test]
    fn test_acl_roundtrip() -> Result<(), StorageError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FilesystemStorage::new(dir.path())?;

        let mut sheets = SheetSet::new();
        sheets.set(
            "default",
            AclSheet::new(AclMask::CAN_EXPLORE_NODE, AclMask::CAN_EXPLORE_NODE),
        );
        let mut acl = BTreeMap::new();
        acl.insert("/pub".to_string(), sheets.clone());

        storage.write_acl(&acl)?;
        let restored = storage.read_acl()?;
        assert_eq!(restored.get("/pub"), Some(&sheets));

        // The ACL document does not show up as a directory node.
        let nodes = storage.read_subdirectory("/")?;
        assert!(nodes.is_empty());
        Ok(())
    }
}

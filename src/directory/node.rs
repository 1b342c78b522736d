// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, HashMap};

use crate::{
    acl::{ACCOUNT_DEFAULT, ACCOUNT_ROOT, AclMask, SheetSet},
    error::RequestError,
};

/// What a node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Subdirectory {
        /// `Some` once the children were fetched from storage or from the
        /// publisher; ordering is the storage order.
        children: Option<Vec<u64>>,
    },
    /// A leaf with a plugin-defined type such as `"InfText"`.
    Leaf { note_type: String },
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    pub kind: NodeKind,
    pub sheets: SheetSet,
}

impl Node {
    pub fn is_subdirectory(&self) -> bool {
        matches!(self.kind, NodeKind::Subdirectory { .. })
    }

    pub fn is_explored(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Subdirectory { children: Some(_) }
        )
    }

    pub fn note_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf { note_type } => Some(note_type),
            NodeKind::Subdirectory { .. } => None,
        }
    }
}

/// The tree of nodes rooted at id 0.
///
/// The root always exists and counts as explored once constructed; ids are
/// unique across the tree and names among siblings.
#[derive(Debug)]
pub struct NodeTree {
    nodes: HashMap<u64, Node>,
    next_id: u64,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, Node {
            id: 0,
            name: String::new(),
            parent: None,
            kind: NodeKind::Subdirectory {
                children: Some(Vec::new()),
            },
            sheets: SheetSet::new(),
        });
        Self { nodes, next_id: 1 }
    }

    pub fn get(&self, id: u64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Children of an explored subdirectory, in sibling order.
    pub fn children(&self, id: u64) -> Result<&[u64], RequestError> {
        match &self.node(id)?.kind {
            NodeKind::Subdirectory {
                children: Some(children),
            } => Ok(children),
            NodeKind::Subdirectory { children: None } => Ok(&[]),
            NodeKind::Leaf { .. } => Err(RequestError::NotASubdirectory),
        }
    }

    fn node(&self, id: u64) -> Result<&Node, RequestError> {
        self.nodes.get(&id).ok_or(RequestError::NoSuchNode(id))
    }

    /// Slash-separated path from the root, used as the storage key.
    pub fn path_of(&self, id: u64) -> Result<String, RequestError> {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current)?;
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            cursor = node.parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn assert_name_free(
        &self,
        parent: u64,
        name: &str,
        ignore: Option<u64>,
    ) -> Result<(), RequestError> {
        for child in self.children(parent)? {
            if Some(*child) == ignore {
                continue;
            }
            if self.node(*child)?.name == name {
                return Err(RequestError::NodeNameExists(name.to_string()));
            }
        }
        Ok(())
    }

    /// Inserts a node under an explored parent, appending to the sibling
    /// order. A specific id can be forced (client mirror); otherwise the
    /// next free id is assigned.
    pub fn insert(
        &mut self,
        id: Option<u64>,
        parent: u64,
        name: impl Into<String>,
        kind: NodeKind,
        sheets: SheetSet,
    ) -> Result<u64, RequestError> {
        let name = name.into();
        if !self.node(parent)?.is_subdirectory() {
            return Err(RequestError::NotASubdirectory);
        }
        self.assert_name_free(parent, &name, None)?;

        let id = match id {
            Some(id) => {
                if self.nodes.contains_key(&id) {
                    return Err(RequestError::InvalidAttribute {
                        attribute: "id".to_string(),
                        value: id.to_string(),
                    });
                }
                self.next_id = self.next_id.max(id + 1);
                id
            },
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            },
        };

        self.nodes.insert(id, Node {
            id,
            name,
            parent: Some(parent),
            kind,
            sheets,
        });

        if let Some(Node {
            kind: NodeKind::Subdirectory { children: Some(children) },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.push(id);
        }
        Ok(id)
    }

    /// Marks a subdirectory as explored with the given child order (client
    /// mirror after an explore, server after a storage read).
    pub fn mark_explored(&mut self, id: u64) -> Result<(), RequestError> {
        match &mut self
            .nodes
            .get_mut(&id)
            .ok_or(RequestError::NoSuchNode(id))?
            .kind
        {
            NodeKind::Subdirectory { children } => {
                if children.is_none() {
                    *children = Some(Vec::new());
                }
                Ok(())
            },
            NodeKind::Leaf { .. } => Err(RequestError::NotASubdirectory),
        }
    }

    /// Renames a node; fails when a sibling already carries the name.
    pub fn rename(&mut self, id: u64, name: &str) -> Result<(), RequestError> {
        let node = self.node(id)?;
        let Some(parent) = node.parent else {
            return Err(RequestError::InvalidAttribute {
                attribute: "id".to_string(),
                value: "0".to_string(),
            });
        };
        self.assert_name_free(parent, name, Some(id))?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.name = name.to_string();
        }
        Ok(())
    }

    /// Removes a node and its whole subtree, returning every removed id
    /// (depth-first, leaves before their parents) so the caller can close
    /// live sessions and delete storage.
    pub fn remove(&mut self, id: u64) -> Result<Vec<u64>, RequestError> {
        if id == 0 {
            return Err(RequestError::InvalidAttribute {
                attribute: "id".to_string(),
                value: "0".to_string(),
            });
        }
        let node = self.node(id)?;
        let parent = node.parent;

        let mut removed = Vec::new();
        self.collect_subtree(id, &mut removed);
        for removed_id in &removed {
            self.nodes.remove(removed_id);
        }

        if let Some(parent) = parent
            && let Some(Node {
                kind: NodeKind::Subdirectory { children: Some(children) },
                ..
            }) = self.nodes.get_mut(&parent)
        {
            children.retain(|c| *c != id);
        }
        Ok(removed)
    }

    fn collect_subtree(&self, id: u64, out: &mut Vec<u64>) {
        if let Some(Node {
            kind: NodeKind::Subdirectory { children: Some(children) },
            ..
        }) = self.nodes.get(&id)
        {
            for child in children {
                self.collect_subtree(*child, out);
            }
        }
        out.push(id);
    }

    /// Evaluates permission bits for `account` at `id` (§ACL): walk towards
    /// the root; at each node the account's own sheet is consulted before
    /// the `default` sheet; undetermined bits at the root are denied. The
    /// `root` account is granted everything unconditionally.
    pub fn check_acl(
        &self,
        id: u64,
        account: &str,
        mask: AclMask,
    ) -> Result<AclMask, RequestError> {
        if account == ACCOUNT_ROOT {
            return Ok(mask);
        }

        let mut undetermined = mask;
        let mut granted = AclMask::empty();
        let mut cursor = Some(self.node(id)?);

        while let Some(node) = cursor {
            for sheets in [
                node.sheets.get(account),
                node.sheets.get(ACCOUNT_DEFAULT),
            ]
            .into_iter()
            .flatten()
            {
                let decided = undetermined & sheets.mask;
                granted |= decided & sheets.perms;
                undetermined &= !decided;
                if undetermined.is_empty() {
                    return Ok(granted);
                }
            }
            cursor = node.parent.and_then(|p| self.nodes.get(&p));
        }
        Ok(granted)
    }

    /// Every node id currently in the tree (tests, persistence walks).
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// ACL sheets per node path, for persistence.
    pub fn sheets_by_path(&self) -> BTreeMap<String, SheetSet> {
        let mut out = BTreeMap::new();
        for (id, node) in &self.nodes {
            if !node.sheets.is_empty()
                && let Ok(path) = self.path_of(*id)
            {
                out.insert(path, node.sheets.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclSheet;

    fn subdir() -> NodeKind {
        NodeKind::Subdirectory { children: None }
    }

    fn leaf() -> NodeKind {
        NodeKind::Leaf {
            note_type: "InfText".to_string(),
        }
    }

    #[test]
    fn test_rename_collision_rejected() {
        let mut tree = NodeTree::new();
        let a = tree
            .insert(None, 0, "a", subdir(), SheetSet::new())
            .expect("insert a");
        let _b = tree
            .insert(None, 0, "b", subdir(), SheetSet::new())
            .expect("insert b");

        let err = tree.rename(a, "b").expect_err("collision must fail");
        assert!(matches!(err, RequestError::NodeNameExists(_)));
        // Both children remain as before.
        assert_eq!(tree.get(a).expect("a lives").name, "a");
        assert_eq!(tree.children(0).expect("root children").len(), 2);

        tree.rename(a, "c").expect("free name is fine");
        assert_eq!(tree.get(a).expect("a").name, "c");
    }

    #[test]
    fn test_sibling_name_uniqueness_on_insert() {
        let mut tree = NodeTree::new();
        tree.insert(None, 0, "doc", leaf(), SheetSet::new())
            .expect("first");
        let err = tree
            .insert(None, 0, "doc", leaf(), SheetSet::new())
            .expect_err("duplicate sibling name");
        assert!(matches!(err, RequestError::NodeNameExists(_)));
    }

    #[test]
    fn test_recursive_removal_orders_leaves_first() {
        let mut tree = NodeTree::new();
        let top = tree
            .insert(None, 0, "top", subdir(), SheetSet::new())
            .expect("top");
        tree.mark_explored(top).expect("explore");
        let mid = tree
            .insert(None, top, "mid", subdir(), SheetSet::new())
            .expect("mid");
        tree.mark_explored(mid).expect("explore");
        let doc = tree
            .insert(None, mid, "doc", leaf(), SheetSet::new())
            .expect("doc");

        let removed = tree.remove(top).expect("remove");
        assert_eq!(removed, vec![doc, mid, top]);
        assert!(!tree.contains(doc));
        assert!(tree.children(0).expect("root").is_empty());
    }

    #[test]
    fn test_paths() {
        let mut tree = NodeTree::new();
        let a = tree
            .insert(None, 0, "a", subdir(), SheetSet::new())
            .expect("a");
        tree.mark_explored(a).expect("explore");
        let doc = tree
            .insert(None, a, "doc", leaf(), SheetSet::new())
            .expect("doc");

        assert_eq!(tree.path_of(0).expect("root"), "/");
        assert_eq!(tree.path_of(doc).expect("doc"), "/a/doc");
    }

    #[test]
    fn test_acl_inheritance_walk() {
        // Root denies exploring and subscribing by default; /pub opens
        // both. An account with no sheets of its own inherits through the
        // nearest ancestor.
        let mut tree = NodeTree::new();
        let deny = AclSheet::new(
            AclMask::CAN_EXPLORE_NODE | AclMask::CAN_SUBSCRIBE_SESSION,
            AclMask::empty(),
        );
        tree.get_mut(0).expect("root").sheets.set("default", deny);

        let pub_dir = tree
            .insert(None, 0, "pub", subdir(), SheetSet::new())
            .expect("pub");
        tree.mark_explored(pub_dir).expect("explore");
        let allow = AclSheet::new(
            AclMask::CAN_EXPLORE_NODE | AclMask::CAN_SUBSCRIBE_SESSION,
            AclMask::CAN_EXPLORE_NODE | AclMask::CAN_SUBSCRIBE_SESSION,
        );
        tree.get_mut(pub_dir)
            .expect("pub node")
            .sheets
            .set("default", allow);

        let doc = tree
            .insert(None, pub_dir, "doc", leaf(), SheetSet::new())
            .expect("doc");

        let bit = AclMask::CAN_SUBSCRIBE_SESSION;
        assert_eq!(
            tree.check_acl(pub_dir, "acct", bit).expect("pub"),
            bit
        );
        assert_eq!(
            tree.check_acl(0, "acct", bit).expect("root"),
            AclMask::empty()
        );
        assert_eq!(tree.check_acl(doc, "acct", bit).expect("doc"), bit);
    }

    #[test]
    fn test_acl_account_sheet_beats_default() {
        let mut tree = NodeTree::new();
        let root = tree.get_mut(0).expect("root");
        root.sheets.set(
            "default",
            AclSheet::new(AclMask::CAN_EXPLORE_NODE, AclMask::CAN_EXPLORE_NODE),
        );
        root.sheets.set(
            "banned",
            AclSheet::new(AclMask::CAN_EXPLORE_NODE, AclMask::empty()),
        );

        assert_eq!(
            tree.check_acl(0, "anyone", AclMask::CAN_EXPLORE_NODE)
                .expect("anyone"),
            AclMask::CAN_EXPLORE_NODE
        );
        assert_eq!(
            tree.check_acl(0, "banned", AclMask::CAN_EXPLORE_NODE)
                .expect("banned"),
            AclMask::empty()
        );
    }

    #[test]
    fn test_root_account_short_circuits() {
        let tree = NodeTree::new();
        assert_eq!(
            tree.check_acl(0, "root", AclMask::all()).expect("root account"),
            AclMask::all()
        );
    }

    #[test]
    fn test_undetermined_bits_denied_at_root() {
        let tree = NodeTree::new();
        assert_eq!(
            tree.check_acl(0, "acct", AclMask::CAN_SET_ACL).expect("check"),
            AclMask::empty()
        );
    }
}

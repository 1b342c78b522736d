// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::xml::XmlNode;

bitflags! {
    /// The permission bits controlled by ACL sheets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AclMask: u64 {
        const CAN_QUERY_ACCOUNT_LIST = 1 << 0;
        const CAN_QUERY_ACL          = 1 << 1;
        const CAN_SET_ACL            = 1 << 2;
        const CAN_ADD_SUBDIRECTORY   = 1 << 3;
        const CAN_ADD_DOCUMENT       = 1 << 4;
        const CAN_SYNC_IN            = 1 << 5;
        const CAN_REMOVE_NODE        = 1 << 6;
        const CAN_EXPLORE_NODE       = 1 << 7;
        const CAN_SUBSCRIBE_SESSION  = 1 << 8;
        const CAN_JOIN_USER          = 1 << 9;
    }
}

impl AclMask {
    /// Wire name of a single bit.
    pub fn bit_name(bit: AclMask) -> Option<&'static str> {
        Some(match bit {
            AclMask::CAN_QUERY_ACCOUNT_LIST => "can-query-account-list",
            AclMask::CAN_QUERY_ACL => "can-query-acl",
            AclMask::CAN_SET_ACL => "can-set-acl",
            AclMask::CAN_ADD_SUBDIRECTORY => "can-add-subdirectory",
            AclMask::CAN_ADD_DOCUMENT => "can-add-document",
            AclMask::CAN_SYNC_IN => "can-sync-in",
            AclMask::CAN_REMOVE_NODE => "can-remove-node",
            AclMask::CAN_EXPLORE_NODE => "can-explore-node",
            AclMask::CAN_SUBSCRIBE_SESSION => "can-subscribe-session",
            AclMask::CAN_JOIN_USER => "can-join-user",
            _ => return None,
        })
    }

    pub fn from_bit_name(name: &str) -> Option<AclMask> {
        Some(match name {
            "can-query-account-list" => AclMask::CAN_QUERY_ACCOUNT_LIST,
            "can-query-acl" => AclMask::CAN_QUERY_ACL,
            "can-set-acl" => AclMask::CAN_SET_ACL,
            "can-add-subdirectory" => AclMask::CAN_ADD_SUBDIRECTORY,
            "can-add-document" => AclMask::CAN_ADD_DOCUMENT,
            "can-sync-in" => AclMask::CAN_SYNC_IN,
            "can-remove-node" => AclMask::CAN_REMOVE_NODE,
            "can-explore-node" => AclMask::CAN_EXPLORE_NODE,
            "can-subscribe-session" => AclMask::CAN_SUBSCRIBE_SESSION,
            "can-join-user" => AclMask::CAN_JOIN_USER,
            _ => return None,
        })
    }
}

/// Sheet for one `(node, account)` pair: which bits are specified here and
/// their values. A bit outside `mask` is inherited from the parent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AclSheet {
    pub mask: AclMask,
    pub perms: AclMask,
}

impl AclSheet {
    pub fn new(mask: AclMask, perms: AclMask) -> Self {
        Self {
            mask,
            perms: perms & mask,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Merges `other` over this sheet: bits specified by `other` win.
    pub fn overlay(&mut self, other: &AclSheet) {
        self.perms = (self.perms & !other.mask) | (other.perms & other.mask);
        self.mask |= other.mask;
    }
}

/// All sheets of one node, keyed by account id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetSet {
    sheets: BTreeMap<String, AclSheet>,
}

impl SheetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str) -> Option<&AclSheet> {
        self.sheets.get(account)
    }

    /// Replaces the sheet for `account`; an empty sheet removes the entry.
    pub fn set(&mut self, account: impl Into<String>, sheet: AclSheet) {
        let account = account.into();
        if sheet.is_empty() {
            self.sheets.remove(&account);
        } else {
            self.sheets.insert(account, sheet);
        }
    }

    pub fn remove_account(&mut self, account: &str) {
        self.sheets.remove(account);
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AclSheet)> {
        self.sheets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `<acl><sheet id="…" mask="…" perms="…"/>…</acl>` with hex-encoded
    /// bit sets.
    pub fn to_xml(&self) -> XmlNode {
        let mut node = XmlNode::new("acl");
        for (account, sheet) in &self.sheets {
            node.push(
                XmlNode::new("sheet")
                    .attr("id", account.clone())
                    .attr("mask", format!("{:x}", sheet.mask.bits()))
                    .attr("perms", format!("{:x}", sheet.perms.bits())),
            );
        }
        node
    }

    pub fn from_xml(node: &XmlNode) -> Result<Self> {
        if node.name != "acl" {
            bail!("expected <acl>, got <{}>", node.name);
        }
        let mut out = Self::new();
        for sheet in node.elements() {
            if sheet.name != "sheet" {
                bail!("unexpected <{}> in <acl>", sheet.name);
            }
            let id = sheet.req_attr("id")?;
            let mask = u64::from_str_radix(sheet.req_attr("mask")?, 16)?;
            let perms = u64::from_str_radix(sheet.req_attr("perms")?, 16)?;
            out.set(
                id,
                AclSheet::new(
                    AclMask::from_bits_truncate(mask),
                    AclMask::from_bits_truncate(perms),
                ),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sheet_masks_perms() {
        let sheet = AclSheet::new(
            AclMask::CAN_EXPLORE_NODE | AclMask::CAN_SUBSCRIBE_SESSION,
            AclMask::CAN_SUBSCRIBE_SESSION | AclMask::CAN_SET_ACL,
        );
        // Values outside the mask are dropped.
        assert_eq!(sheet.perms, AclMask::CAN_SUBSCRIBE_SESSION);
    }

    #[test]
    fn test_overlay() {
        let mut base = AclSheet::new(
            AclMask::CAN_EXPLORE_NODE | AclMask::CAN_JOIN_USER,
            AclMask::CAN_EXPLORE_NODE,
        );
        base.overlay(&AclSheet::new(
            AclMask::CAN_EXPLORE_NODE,
            AclMask::empty(),
        ));
        assert!(base.mask.contains(AclMask::CAN_EXPLORE_NODE));
        assert!(!base.perms.contains(AclMask::CAN_EXPLORE_NODE));
        assert!(base.mask.contains(AclMask::CAN_JOIN_USER));
    }

    #[test]
    fn test_xml_roundtrip() -> Result<()> {
        let mut set = SheetSet::new();
        set.set(
            "default",
            AclSheet::new(AclMask::CAN_EXPLORE_NODE, AclMask::empty()),
        );
        set.set(
            "alice",
            AclSheet::new(AclMask::CAN_SET_ACL, AclMask::CAN_SET_ACL),
        );

        let restored = SheetSet::from_xml(&set.to_xml())?;
        assert_eq!(restored, set);
        Ok(())
    }

    #[test]
    fn test_bit_names_cover_all() {
        for bit in AclMask::all().iter() {
            let name = AclMask::bit_name(bit).expect("every bit has a name");
            assert_eq!(AclMask::from_bit_name(name), Some(bit));
        }
    }
}

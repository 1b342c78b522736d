// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    error::SaslCondition,
    transport::sasl::{
        MECHANISM_ANONYMOUS, MECHANISM_PLAIN, SaslServerBackend, parse_plain_response,
    },
    xml::XmlNode,
};

/// Server-side account record.
#[derive(Debug, Clone, PartialEq)]
pub struct AclAccount {
    /// Stable id; `"default"` and `"root"` are reserved.
    pub id: String,
    /// Human-readable name, optional.
    pub name: Option<String>,
    /// X.509 subject DNs that authenticate this account.
    pub certificate_dns: Vec<String>,
    /// 32-byte salt (16 prefix + 16 suffix), hex.
    pub password_salt: Option<String>,
    /// `SHA256(salt[0:16] || password || salt[16:32])`, hex.
    pub password_hash: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Not persisted to storage.
    pub transient: bool,
}

impl AclAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            certificate_dns: Vec::new(),
            password_salt: None,
            password_hash: None,
            first_seen: None,
            last_seen: None,
            transient: false,
        }
    }

    /// Sets a fresh salt and the matching hash for `password`.
    pub fn set_password(&mut self, password: &str) {
        let mut salt = [0u8; 32];
        rand::rng().fill(&mut salt);
        self.password_salt = Some(hex::encode(salt));
        self.password_hash = Some(hex::encode(hash_password(&salt, password)));
    }

    /// Verifies a password against the stored salted hash.
    pub fn check_password(&self, password: &str) -> bool {
        let (Some(salt_hex), Some(hash_hex)) =
            (&self.password_salt, &self.password_hash)
        else {
            return false;
        };
        let Ok(salt) = hex::decode(salt_hex) else {
            return false;
        };
        if salt.len() != 32 {
            return false;
        }
        hex::encode(hash_password(&salt, password)) == *hash_hex
    }

    /// The client-visible projection strips credentials.
    pub fn to_client_xml(&self) -> XmlNode {
        let mut node = XmlNode::new("account").attr("id", self.id.clone());
        if let Some(name) = &self.name {
            node.set_attr("name", name.clone());
        }
        node
    }

    /// Full storage serialization.
    pub fn to_storage_xml(&self) -> XmlNode {
        let mut node = XmlNode::new("account").attr("id", self.id.clone());
        if let Some(name) = &self.name {
            node.set_attr("name", name.clone());
        }
        if let Some(first_seen) = &self.first_seen {
            node.set_attr("first-seen", first_seen.to_rfc3339());
        }
        if let Some(last_seen) = &self.last_seen {
            node.set_attr("last-seen", last_seen.to_rfc3339());
        }
        if let Some(salt) = &self.password_salt {
            node.set_attr("password-salt", salt.clone());
        }
        if let Some(hash) = &self.password_hash {
            node.set_attr("password-hash", hash.clone());
        }
        for dn in &self.certificate_dns {
            node.push(XmlNode::new("certificate").text(dn.clone()));
        }
        node
    }

    pub fn from_storage_xml(node: &XmlNode) -> Result<Self> {
        if node.name != "account" {
            bail!("expected <account>, got <{}>", node.name);
        }
        let mut account = AclAccount::new(node.req_attr("id")?);
        account.name = node.get_attr("name").map(str::to_string);
        account.password_salt = node.get_attr("password-salt").map(str::to_string);
        account.password_hash = node.get_attr("password-hash").map(str::to_string);
        account.first_seen = node
            .get_attr("first-seen")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        account.last_seen = node
            .get_attr("last-seen")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        for cert in node.elements() {
            if cert.name == "certificate" {
                account.certificate_dns.push(cert.inner_text());
            }
        }
        Ok(account)
    }
}

fn hash_password(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&salt[0..16]);
    hasher.update(password.as_bytes());
    hasher.update(&salt[16..32]);
    hasher.finalize().into()
}

/// In-memory account table with optional file persistence.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: Mutex<BTreeMap<String, AclAccount>>,
    path: Option<PathBuf>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or initializes) a store backed by `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut accounts = BTreeMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let root = XmlNode::from_bytes(&bytes)
                    .with_context(|| format!("malformed account list {path:?}"))?;
                for node in root.elements() {
                    let account = AclAccount::from_storage_xml(node)?;
                    accounts.insert(account.id.clone(), account);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "starting with an empty account list");
            },
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {path:?}"));
            },
        }
        Ok(Self {
            accounts: Mutex::new(accounts),
            path: Some(path),
        })
    }

    pub fn get(&self, id: &str) -> Option<AclAccount> {
        self.accounts
            .lock()
            .expect("accounts poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<AclAccount> {
        self.accounts
            .lock()
            .expect("accounts poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn insert(&self, account: AclAccount) -> Result<()> {
        {
            let mut accounts = self.accounts.lock().expect("accounts poisoned");
            if accounts.contains_key(&account.id) {
                bail!("account {:?} already exists", account.id);
            }
            accounts.insert(account.id.clone(), account);
        }
        self.persist()
    }

    pub fn remove(&self, id: &str) -> Result<Option<AclAccount>> {
        let removed = self
            .accounts
            .lock()
            .expect("accounts poisoned")
            .remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Finds the account a presented certificate DN authenticates.
    pub fn lookup_by_dn(&self, dn: &str) -> Option<AclAccount> {
        self.accounts
            .lock()
            .expect("accounts poisoned")
            .values()
            .find(|a| a.certificate_dns.iter().any(|d| d == dn))
            .cloned()
    }

    /// Stamps the seen timestamps of `id` at login.
    pub fn touch(&self, id: &str) {
        let now = Utc::now();
        let mut accounts = self.accounts.lock().expect("accounts poisoned");
        if let Some(account) = accounts.get_mut(id) {
            if account.first_seen.is_none() {
                account.first_seen = Some(now);
            }
            account.last_seen = Some(now);
        }
        drop(accounts);
        let _ = self.persist();
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut root = XmlNode::new("accounts");
        for account in self
            .accounts
            .lock()
            .expect("accounts poisoned")
            .values()
            .filter(|a| !a.transient)
        {
            root.push(account.to_storage_xml());
        }
        let mut bytes = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_vec();
        bytes.extend_from_slice(&root.to_bytes());
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write account list {path:?}"))
    }
}

impl SaslServerBackend for AccountStore {
    fn mechanisms(&self) -> Vec<&'static str> {
        vec![MECHANISM_PLAIN, MECHANISM_ANONYMOUS]
    }

    fn authenticate(
        &self,
        mechanism: &str,
        initial_response: &[u8],
    ) -> Result<String, SaslCondition> {
        match mechanism {
            MECHANISM_ANONYMOUS => Ok(crate::acl::ACCOUNT_DEFAULT.to_string()),
            MECHANISM_PLAIN => {
                let (_, username, password) = parse_plain_response(initial_response)?;
                let account = self
                    .get(&username)
                    .ok_or(SaslCondition::NotAuthorized)?;
                if !account.check_password(&password) {
                    return Err(SaslCondition::NotAuthorized);
                }
                self.touch(&account.id);
                Ok(account.id)
            },
            _ => Err(SaslCondition::InvalidMechanism),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_scheme() {
        let mut account = AclAccount::new("alice");
        account.set_password("open sesame");

        assert!(account.check_password("open sesame"));
        assert!(!account.check_password("wrong"));

        // The scheme is SHA256(salt[0:16] || password || salt[16:32]).
        let salt = hex::decode(account.password_salt.as_ref().expect("salt"))
            .expect("hex salt");
        assert_eq!(salt.len(), 32);
        let mut hasher = Sha256::new();
        hasher.update(&salt[0..16]);
        hasher.update(b"open sesame");
        hasher.update(&salt[16..32]);
        assert_eq!(
            hex::encode(hasher.finalize()),
            *account.password_hash.as_ref().expect("hash")
        );
    }

    #[test]
    fn test_storage_roundtrip_strips_nothing() -> Result<()> {
        let mut account = AclAccount::new("bob");
        account.name = Some("Bob".into());
        account.set_password("pw");
        account.certificate_dns.push("CN=bob,O=example".into());
        account.first_seen = Some(Utc::now());
        account.last_seen = account.first_seen;

        let restored = AclAccount::from_storage_xml(&account.to_storage_xml())?;
        assert_eq!(restored.id, account.id);
        assert_eq!(restored.certificate_dns, account.certificate_dns);
        assert_eq!(restored.password_hash, account.password_hash);

        // The client projection must not leak credentials or DNs.
        let client = account.to_client_xml();
        assert!(client.get_attr("password-hash").is_none());
        assert!(client.get_attr("password-salt").is_none());
        assert!(client.elements().next().is_none());
        Ok(())
    }

    #[test]
    fn test_file_store_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("accounts.xml");

        {
            let store = AccountStore::open(path.clone())?;
            let mut account = AclAccount::new("alice");
            account.set_password("pw");
            store.insert(account)?;

            let mut transient = AclAccount::new("ghost");
            transient.transient = true;
            store.insert(transient)?;
        }

        let store = AccountStore::open(path)?;
        assert!(store.get("alice").is_some());
        assert!(store.get("ghost").is_none(), "transient accounts are not persisted");
        Ok(())
    }

    #[test]
    fn test_plain_sasl_backend() {
        let store = AccountStore::new();
        let mut account = AclAccount::new("alice");
        account.set_password("pw");
        store.insert(account).expect("insert");

        let ok = store.authenticate(MECHANISM_PLAIN, b"\0alice\0pw");
        assert_eq!(ok, Ok("alice".to_string()));

        let bad = store.authenticate(MECHANISM_PLAIN, b"\0alice\0nope");
        assert_eq!(bad, Err(SaslCondition::NotAuthorized));

        let anon = store.authenticate(MECHANISM_ANONYMOUS, b"");
        assert_eq!(anon, Ok("default".to_string()));
    }
}

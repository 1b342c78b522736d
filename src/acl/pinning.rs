// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use tracing::debug;

use crate::transport::tls::{CertificateDecider, PresentedCertificate};

/// Asks the user whether to trust a certificate the automatic rules could
/// not decide on.
pub trait PinQuery: Send + Sync {
    fn ask(
        &self,
        hostname: &str,
        presented: &PresentedCertificate,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Rejects everything that needs a query; for headless clients.
pub struct RejectQueries;

impl PinQuery for RejectQueries {
    fn ask(
        &self,
        _hostname: &str,
        _presented: &PresentedCertificate,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { false })
    }
}

/// Persistent `hostname → certificate fingerprint` map, one
/// `host=hex-sha256` pair per line.
#[derive(Debug, Default)]
pub struct PinStore {
    pins: Mutex<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl PinStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let mut pins = HashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((host, fp)) = line.split_once('=') {
                        pins.insert(host.trim().to_string(), fp.trim().to_string());
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e).with_context(|| format!("failed to read {path:?}")),
        }
        Ok(Self {
            pins: Mutex::new(pins),
            path: Some(path),
        })
    }

    pub fn get(&self, hostname: &str) -> Option<String> {
        self.pins
            .lock()
            .expect("pins poisoned")
            .get(hostname)
            .cloned()
    }

    pub fn set(&self, hostname: &str, fingerprint: &str) {
        self.pins
            .lock()
            .expect("pins poisoned")
            .insert(hostname.to_string(), fingerprint.to_string());
        if let Err(e) = self.persist() {
            debug!("failed to persist certificate pins: {e}");
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let pins = self.pins.lock().expect("pins poisoned");
        let mut out = String::new();
        let mut entries: Vec<_> = pins.iter().collect();
        entries.sort();
        for (host, fp) in entries {
            out.push_str(host);
            out.push('=');
            out.push_str(fp);
            out.push('\n');
        }
        std::fs::write(path, out).with_context(|| format!("failed to write {path:?}"))
    }
}

/// The client-side pinning policy:
///
/// | CA trust | pin        | outcome                                    |
/// |----------|------------|--------------------------------------------|
/// | yes      | none       | accept, pin                                |
/// | yes      | match      | accept                                     |
/// | yes      | mismatch   | replace pin if the hostname matches, else  |
/// |          |            | query                                      |
/// | no       | none       | query; pin on accept                       |
/// | no       | match      | accept                                     |
/// | no       | mismatch   | query; replace on accept                   |
pub struct PinningDecider {
    store: Arc<PinStore>,
    query: Arc<dyn PinQuery>,
}

impl PinningDecider {
    pub fn new(store: Arc<PinStore>, query: Arc<dyn PinQuery>) -> Self {
        Self { store, query }
    }

    async fn decide_inner(
        &self,
        hostname: &str,
        presented: &PresentedCertificate,
    ) -> bool {
        let fingerprint = presented.fingerprint();
        let pinned = self.store.get(hostname);

        match (&pinned, presented.ca_trusted) {
            (None, true) => {
                self.store.set(hostname, &fingerprint);
                true
            },
            (Some(pin), _) if *pin == fingerprint => true,
            (Some(_), true) if presented.hostname_matches => {
                // The host rolled its certificate; silently follow.
                self.store.set(hostname, &fingerprint);
                true
            },
            _ => {
                if self.query.ask(hostname, presented).await {
                    self.store.set(hostname, &fingerprint);
                    true
                } else {
                    false
                }
            },
        }
    }
}

impl CertificateDecider for PinningDecider {
    fn decide(
        &self,
        hostname: &str,
        presented: &PresentedCertificate,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let hostname = hostname.to_string();
        let presented = presented.clone();
        Box::pin(async move { self.decide_inner(&hostname, &presented).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingQuery {
        answer: bool,
        asked: AtomicUsize,
    }

    impl PinQuery for CountingQuery {
        fn ask(
            &self,
            _hostname: &str,
            _presented: &PresentedCertificate,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer;
            Box::pin(async move { answer })
        }
    }

    fn cert(der: &[u8], ca_trusted: bool, hostname_matches: bool) -> PresentedCertificate {
        PresentedCertificate {
            der: der.to_vec(),
            ca_trusted,
            hostname_matches,
        }
    }

    fn decider(answer: bool) -> (PinningDecider, Arc<PinStore>, Arc<CountingQuery>) {
        let store = Arc::new(PinStore::in_memory());
        let query = Arc::new(CountingQuery {
            answer,
            asked: AtomicUsize::new(0),
        });
        (
            PinningDecider::new(Arc::clone(&store), query.clone() as Arc<dyn PinQuery>),
            store,
            query,
        )
    }

    #[tokio::test]
    async fn test_trusted_cert_is_pinned_silently() {
        let (decider, store, query) = decider(false);
        let c = cert(b"cert-one", true, true);

        assert!(decider.decide_inner("host", &c).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 0);
        assert_eq!(store.get("host"), Some(c.fingerprint()));

        // Reconnect with the same certificate: no query either.
        assert!(decider.decide_inner("host", &c).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trusted_rollover_replaces_pin() {
        let (decider, store, query) = decider(false);
        let old = cert(b"cert-one", true, true);
        let new = cert(b"cert-two", true, true);

        assert!(decider.decide_inner("host", &old).await);
        assert!(decider.decide_inner("host", &new).await);
        assert_eq!(store.get("host"), Some(new.fingerprint()));
        assert_eq!(query.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trusted_hostname_mismatch_queries() {
        let (decider, store, query) = decider(true);
        let old = cert(b"cert-one", true, true);
        let moved = cert(b"cert-two", true, false);

        assert!(decider.decide_inner("host", &old).await);
        assert!(decider.decide_inner("host", &moved).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("host"), Some(moved.fingerprint()));
    }

    #[tokio::test]
    async fn test_untrusted_first_contact_queries() {
        let (decider, store, query) = decider(true);
        let c = cert(b"self-signed", false, true);

        assert!(decider.decide_inner("host", &c).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("host"), Some(c.fingerprint()));

        // Pinned now: the reconnect is silent.
        assert!(decider.decide_inner("host", &c).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_untrusted_mismatch_rejected_closes() {
        let (decider, store, query) = decider(false);
        let old = cert(b"self-signed", false, true);
        store.set("host", &old.fingerprint());

        let imposter = cert(b"evil", false, true);
        assert!(!decider.decide_inner("host", &imposter).await);
        assert_eq!(query.asked.load(Ordering::SeqCst), 1);
        // The rejected certificate must not replace the pin.
        assert_eq!(store.get("host"), Some(old.fingerprint()));
    }

    #[tokio::test]
    async fn test_pin_store_file_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pins");

        {
            let store = PinStore::open(path.clone())?;
            store.set("example.com", "aabbcc");
        }
        let store = PinStore::open(path)?;
        assert_eq!(store.get("example.com"), Some("aabbcc".to_string()));
        Ok(())
    }
}

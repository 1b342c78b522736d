// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    },
    client::WebPkiServerVerifier,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// What the transport learned about the certificate the server presented,
/// handed to the application's verification callback before the stream is
/// allowed to continue.
#[derive(Debug, Clone)]
pub struct PresentedCertificate {
    /// DER encoding of the end-entity certificate.
    pub der: Vec<u8>,
    /// Whether the chain verified against the configured CA roots.
    pub ca_trusted: bool,
    /// Whether the hostname we dialed appears in the certificate.
    pub hostname_matches: bool,
}

impl PresentedCertificate {
    /// SHA-256 fingerprint of the DER encoding, lowercase hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Subject DN, rendered in RFC 4514 order.
    pub fn subject_dn(&self) -> Result<String> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| anyhow::anyhow!("bad certificate DER: {e}"))?;
        Ok(cert.subject().to_string())
    }
}

/// The application decides whether to continue the handshake. The TLS
/// session stays suspended (no stanza flows) until this resolves; returning
/// `false` tears the connection down as `certificate-not-trusted`.
pub trait CertificateDecider: Send + Sync {
    fn decide(
        &self,
        hostname: &str,
        presented: &PresentedCertificate,
    ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Accepts everything; used where the decision is delegated entirely to
/// certificate pinning on reconnect, and in tests.
pub struct AcceptAll;

impl CertificateDecider for AcceptAll {
    fn decide(
        &self,
        _hostname: &str,
        _presented: &PresentedCertificate,
    ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }
}

/// rustls verifier that never fails the handshake but records the chain and
/// whether it would have verified, so the application callback can rule on
/// it afterwards.
#[derive(Debug)]
pub struct CapturingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    captured: Mutex<Option<PresentedCertificate>>,
}

impl CapturingVerifier {
    pub fn new(roots: Option<RootCertStore>) -> Arc<Self> {
        let inner = roots.and_then(|roots| {
            WebPkiServerVerifier::builder(Arc::new(roots)).build().ok()
        });
        Arc::new(Self {
            inner,
            captured: Mutex::new(None),
        })
    }

    /// The certificate captured during the last handshake.
    pub fn take_presented(&self) -> Option<PresentedCertificate> {
        self.captured.lock().expect("verifier state poisoned").take()
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let ca_trusted = match &self.inner {
            Some(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .is_ok(),
            None => false,
        };

        let hostname = match server_name {
            ServerName::DnsName(name) => name.as_ref().to_string(),
            other => other.to_str().into_owned(),
        };

        *self.captured.lock().expect("verifier state poisoned") =
            Some(PresentedCertificate {
                der: end_entity.as_ref().to_vec(),
                ca_trusted,
                hostname_matches: certificate_matches_hostname(
                    end_entity.as_ref(),
                    &hostname,
                ),
            });

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(verifier) => verifier.verify_tls12_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(verifier) => verifier.verify_tls13_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(verifier) => verifier.supported_verify_schemes(),
            None => vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ],
        }
    }
}

/// Checks the dialed hostname against the certificate's SANs (with a
/// common-name fallback for legacy certificates).
pub fn certificate_matches_hostname(der: &[u8], hostname: &str) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return false;
    };

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name
                && dns_name_matches(dns, hostname)
            {
                return true;
            }
        }
        return false;
    }

    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| dns_name_matches(cn, hostname))
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return hostname
            .split_once('.')
            .is_some_and(|(_, rest)| rest.eq_ignore_ascii_case(suffix));
    }
    pattern.eq_ignore_ascii_case(hostname)
}

/// Client TLS configuration around the capturing verifier.
pub fn client_config(verifier: Arc<CapturingVerifier>) -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

/// Server TLS configuration from PEM key and certificate chain files.
pub fn server_config(key_pem: &[u8], chain_pem: &[u8]) -> Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut &chain_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate chain PEM")?;
    if certs.is_empty() {
        bail!("certificate chain contains no certificates");
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("failed to parse private key PEM")?
        .context("no private key found")?;

    server_config_from_der(certs, key)
}

pub fn server_config_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid server certificate/key pair")
}

/// Loads a CA list PEM into a root store.
pub fn root_store(ca_pem: &[u8]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        store
            .add(cert.context("failed to parse CA certificate")?)
            .context("failed to add CA certificate")?;
    }
    Ok(store)
}

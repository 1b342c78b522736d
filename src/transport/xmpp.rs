// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use rustls::{RootCertStore, ServerConfig, pki_types::ServerName};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{SaslCondition, XmppError},
    transport::{
        Connection, ConnectionStatus, SentCallback,
        sasl::{SaslClientProvider, SaslServerBackend, decode_base64, encode_base64},
        tls::{CapturingVerifier, CertificateDecider, client_config},
    },
    util::Signal,
    xml::{StreamEvent, StreamScanner, XmlNode},
};

const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
const MAX_SASL_ATTEMPTS: u32 = 3;

/// Whether and how eagerly TLS is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityPolicy {
    #[serde(rename = "only-unsecured")]
    OnlyUnsecured,
    #[serde(rename = "only-tls")]
    OnlyTls,
    #[serde(rename = "both-prefer-unsecured")]
    BothPreferUnsecured,
    #[serde(rename = "both-prefer-tls")]
    #[default]
    BothPreferTls,
}

/// Progress of the XMPP negotiation, mirrored on both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmppStatus {
    Connected,
    OpeningStream,
    AwaitingFeatures,
    StarttlsNegotiating,
    SaslNegotiating,
    Authenticated,
    Closing,
    Closed,
}

pub trait AsyncStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Framed XML stream used while the negotiation runs in lockstep.
pub struct XmppStream {
    stream: Box<dyn AsyncStream>,
    scanner: StreamScanner,
    pending: VecDeque<StreamEvent>,
}

impl XmppStream {
    pub fn new(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            scanner: StreamScanner::new(),
            pending: VecDeque::new(),
        }
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|_| XmppError::ConnectionClosed)
    }

    async fn send_node(&mut self, node: &XmlNode) -> Result<(), XmppError> {
        self.send_bytes(&node.to_bytes()).await
    }

    /// Sends a fresh `<stream:stream>` header over the current security
    /// context.
    async fn send_header(&mut self, to: &str, from: &str) -> Result<(), XmppError> {
        let header = XmlNode::new("stream:stream")
            .attr("xmlns", "jabber:client")
            .attr("xmlns:stream", NS_STREAMS)
            .attr("version", "1.0")
            .attr("to", to)
            .attr("from", from);
        self.send_bytes(&header.to_open_tag_bytes()).await
    }

    /// Resets framing for a reopened stream.
    fn reopen(&mut self) {
        self.scanner = StreamScanner::new();
        self.pending.clear();
    }

    async fn next_event(&mut self) -> Result<StreamEvent, XmppError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let mut buf = [0u8; 8192];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|_| XmppError::ConnectionClosed)?;
            if n == 0 {
                return Err(XmppError::ConnectionClosed);
            }
            self.pending.extend(self.scanner.feed(&buf[..n])?);
        }
    }

    /// Waits for the peer's stream header.
    async fn await_header(&mut self) -> Result<XmlNode, XmppError> {
        match self.next_event().await? {
            StreamEvent::StreamStart(node) => Ok(node),
            StreamEvent::Stanza(node) => Err(XmppError::UnexpectedStanza(node.name)),
            StreamEvent::StreamEnd => Err(XmppError::ConnectionClosed),
        }
    }

    /// Waits for the next stanza.
    async fn await_stanza(&mut self) -> Result<XmlNode, XmppError> {
        match self.next_event().await? {
            StreamEvent::Stanza(node) => Ok(node),
            StreamEvent::StreamStart(_) => {
                Err(XmppError::UnexpectedStanza("stream:stream".into()))
            },
            StreamEvent::StreamEnd => Err(XmppError::ConnectionClosed),
        }
    }
}

/// What `<stream:features>` offered.
#[derive(Debug, Default)]
struct Features {
    starttls: bool,
    starttls_required: bool,
    mechanisms: Vec<String>,
}

fn parse_features(node: &XmlNode) -> Result<Features, XmppError> {
    if node.name != "stream:features" && node.name != "features" {
        return Err(XmppError::UnexpectedStanza(node.name.clone()));
    }
    let mut out = Features::default();
    if let Some(tls) = node.find_child("starttls") {
        out.starttls = true;
        out.starttls_required = tls.find_child("required").is_some();
    }
    if let Some(mechanisms) = node.find_child("mechanisms") {
        for mechanism in mechanisms.elements() {
            if mechanism.name == "mechanism" {
                out.mechanisms.push(mechanism.inner_text());
            }
        }
    }
    Ok(out)
}

/// Client-side negotiation parameters.
pub struct XmppClientConfig {
    pub local_hostname: String,
    pub remote_hostname: String,
    pub policy: SecurityPolicy,
    /// CA roots to judge the server certificate against; pinning handles
    /// the rest.
    pub roots: Option<RootCertStore>,
    pub decider: Arc<dyn CertificateDecider>,
    pub sasl: Arc<dyn SaslClientProvider>,
}

/// Negotiation outcome handed to [`XmppConnection::spawn`].
pub struct Negotiated {
    stream: XmppStream,
    secured: bool,
    peer_certificate: Option<Vec<u8>>,
    account: Option<String>,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("secured", &self.secured)
            .field("peer_certificate", &self.peer_certificate)
            .field("account", &self.account)
            .finish()
    }
}

/// Drives the client half of the state machine:
/// `connected → opening-stream → awaiting-features → [starttls] →
/// awaiting-features → [sasl] → awaiting-features → authenticated`.
pub async fn client_negotiate(
    tcp: TcpStream,
    cfg: &XmppClientConfig,
) -> Result<Negotiated, XmppError> {
    let mut status = XmppStatus::Connected;
    let mut stream = XmppStream::new(Box::new(tcp));
    let mut secured = false;
    let mut peer_certificate = None;

    // Initial stream.
    status = advance(status, XmppStatus::OpeningStream);
    stream
        .send_header(&cfg.remote_hostname, &cfg.local_hostname)
        .await?;
    status = advance(status, XmppStatus::AwaitingFeatures);
    stream.await_header().await?;
    let features = parse_features(&stream.await_stanza().await?)?;

    // STARTTLS.
    let want_tls = match cfg.policy {
        SecurityPolicy::OnlyUnsecured => {
            if features.starttls_required {
                return Err(XmppError::TlsRequired);
            }
            false
        },
        SecurityPolicy::OnlyTls => {
            if !features.starttls {
                return Err(XmppError::TlsUnsupported);
            }
            true
        },
        SecurityPolicy::BothPreferTls => features.starttls,
        SecurityPolicy::BothPreferUnsecured => features.starttls_required,
    };

    let features = if want_tls {
        status = advance(status, XmppStatus::StarttlsNegotiating);
        stream
            .send_node(&XmlNode::new("starttls").attr("xmlns", NS_TLS))
            .await?;
        let reply = stream.await_stanza().await?;
        if reply.name != "proceed" {
            return Err(XmppError::TlsHandshakeFailed(format!(
                "expected <proceed/>, got <{}>",
                reply.name
            )));
        }

        let verifier = CapturingVerifier::new(cfg.roots.clone());
        let connector =
            TlsConnector::from(Arc::new(client_config(Arc::clone(&verifier))));
        let server_name = ServerName::try_from(cfg.remote_hostname.clone())
            .map_err(|e| XmppError::TlsHandshakeFailed(e.to_string()))?;
        let tls = connector
            .connect(server_name, stream.stream)
            .await
            .map_err(|e| XmppError::TlsHandshakeFailed(e.to_string()))?;

        // The stream stays suspended here until the application rules on
        // the certificate.
        let presented = verifier
            .take_presented()
            .ok_or_else(|| XmppError::TlsHandshakeFailed("no certificate".into()))?;
        if !cfg.decider.decide(&cfg.remote_hostname, &presented).await {
            return Err(XmppError::CertificateNotTrusted);
        }
        peer_certificate = Some(presented.der.clone());
        secured = true;

        stream = XmppStream::new(Box::new(tls));
        status = advance(status, XmppStatus::OpeningStream);
        stream
            .send_header(&cfg.remote_hostname, &cfg.local_hostname)
            .await?;
        status = advance(status, XmppStatus::AwaitingFeatures);
        stream.await_header().await?;
        parse_features(&stream.await_stanza().await?)?
    } else {
        features
    };

    // SASL, with in-place retry across the provider's mechanisms.
    status = advance(status, XmppStatus::SaslNegotiating);
    let offered: Vec<&str> = cfg
        .sasl
        .mechanisms()
        .into_iter()
        .filter(|m| features.mechanisms.iter().any(|o| o == m))
        .collect();
    if offered.is_empty() {
        return Err(XmppError::NoSuitableMechanism);
    }

    let mut last_condition = SaslCondition::NotAuthorized;
    let mut authenticated = false;
    for mechanism in offered {
        let initial = cfg
            .sasl
            .initial_response(mechanism)
            .map_err(|_| XmppError::NoSuitableMechanism)?;
        stream
            .send_node(
                &XmlNode::new("auth")
                    .attr("xmlns", NS_SASL)
                    .attr("mechanism", mechanism)
                    .text(encode_base64(&initial)),
            )
            .await?;

        let reply = stream.await_stanza().await?;
        match reply.name.as_str() {
            "success" => {
                authenticated = true;
                break;
            },
            "failure" => {
                last_condition = reply
                    .first_element()
                    .and_then(|c| SaslCondition::from_element_name(&c.name))
                    .unwrap_or(SaslCondition::NotAuthorized);
                debug!(mechanism, condition = %last_condition, "SASL attempt failed, retrying");
            },
            other => return Err(XmppError::UnexpectedStanza(other.to_string())),
        }
    }
    if !authenticated {
        return Err(XmppError::AuthenticationFailed(last_condition));
    }

    // Final stream reopen.
    status = advance(status, XmppStatus::OpeningStream);
    stream.reopen();
    stream
        .send_header(&cfg.remote_hostname, &cfg.local_hostname)
        .await?;
    status = advance(status, XmppStatus::AwaitingFeatures);
    stream.await_header().await?;
    let _ = parse_features(&stream.await_stanza().await?)?;
    let _ = advance(status, XmppStatus::Authenticated);

    Ok(Negotiated {
        stream,
        secured,
        peer_certificate,
        account: None,
    })
}

/// Server-side negotiation parameters.
pub struct XmppServerConfig {
    pub local_hostname: String,
    pub policy: SecurityPolicy,
    pub tls: Option<Arc<ServerConfig>>,
    pub backend: Arc<dyn SaslServerBackend>,
}

/// Mirror of the client machine for an accepted connection.
pub async fn server_negotiate(
    tcp: TcpStream,
    cfg: &XmppServerConfig,
) -> Result<Negotiated, XmppError> {
    let mut stream = XmppStream::new(Box::new(tcp));
    let mut secured = false;
    let mut sasl_attempts = 0u32;
    let mut account = None;

    stream.await_header().await?;
    stream
        .send_header("", &cfg.local_hostname)
        .await?;
    stream.send_node(&server_features(cfg, secured)).await?;

    loop {
        let stanza = stream.await_stanza().await?;
        match stanza.name.as_str() {
            "starttls" => {
                let Some(tls_config) = cfg.tls.as_ref().filter(|_| !secured) else {
                    stream
                        .send_node(&XmlNode::new("failure").attr("xmlns", NS_TLS))
                        .await?;
                    return Err(XmppError::TlsUnsupported);
                };
                stream
                    .send_node(&XmlNode::new("proceed").attr("xmlns", NS_TLS))
                    .await?;

                let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
                let tls = acceptor
                    .accept(stream.stream)
                    .await
                    .map_err(|e| XmppError::TlsHandshakeFailed(e.to_string()))?;
                secured = true;

                stream = XmppStream::new(Box::new(tls));
                stream.await_header().await?;
                stream.send_header("", &cfg.local_hostname).await?;
                stream.send_node(&server_features(cfg, secured)).await?;
            },
            "auth" => {
                if cfg.policy == SecurityPolicy::OnlyTls && !secured {
                    return Err(XmppError::TlsRequired);
                }
                let mechanism = stanza.req_attr("mechanism").map_err(|_| {
                    XmppError::UnexpectedStanza("auth without mechanism".into())
                })?;
                let payload = decode_base64(&stanza.inner_text())
                    .map_err(|e| XmppError::XmlNotWellFormed(e.to_string()))?;

                match cfg.backend.authenticate(mechanism, &payload) {
                    Ok(authenticated) => {
                        account = Some(authenticated);
                        stream
                            .send_node(&XmlNode::new("success").attr("xmlns", NS_SASL))
                            .await?;
                        break;
                    },
                    Err(condition) => {
                        sasl_attempts += 1;
                        warn!(mechanism, %condition, attempt = sasl_attempts, "SASL failure");
                        stream
                            .send_node(
                                &XmlNode::new("failure")
                                    .attr("xmlns", NS_SASL)
                                    .child(XmlNode::new(condition.element_name())),
                            )
                            .await?;
                        if sasl_attempts >= MAX_SASL_ATTEMPTS {
                            return Err(XmppError::AuthenticationFailed(condition));
                        }
                        // Retry without tearing down TCP/TLS.
                    },
                }
            },
            other => return Err(XmppError::UnexpectedStanza(other.to_string())),
        }
    }

    // Post-authentication stream reopen.
    stream.reopen();
    stream.await_header().await?;
    stream.send_header("", &cfg.local_hostname).await?;
    stream
        .send_node(&XmlNode::new("stream:features"))
        .await?;

    Ok(Negotiated {
        stream,
        secured,
        peer_certificate: None,
        account,
    })
}

fn server_features(cfg: &XmppServerConfig, secured: bool) -> XmlNode {
    let mut features = XmlNode::new("stream:features");
    if !secured
        && cfg.tls.is_some()
        && cfg.policy != SecurityPolicy::OnlyUnsecured
    {
        let mut starttls = XmlNode::new("starttls").attr("xmlns", NS_TLS);
        if cfg.policy == SecurityPolicy::OnlyTls {
            starttls = starttls.child(XmlNode::new("required"));
        }
        features.push(starttls);
    }
    if secured || cfg.policy != SecurityPolicy::OnlyTls {
        let mut mechanisms = XmlNode::new("mechanisms").attr("xmlns", NS_SASL);
        for mechanism in cfg.backend.mechanisms() {
            mechanisms.push(XmlNode::new("mechanism").text(mechanism));
        }
        features.push(mechanisms);
    }
    features
}

fn advance(from: XmppStatus, to: XmppStatus) -> XmppStatus {
    debug!(?from, ?to, "xmpp state");
    to
}

/// An authenticated XMPP connection carrying group-wrapped stanzas.
pub struct XmppConnection {
    local_id: String,
    remote_id: String,
    network: &'static str,
    status: Mutex<ConnectionStatus>,
    received_signal: Signal<XmlNode>,
    status_signal: Signal<ConnectionStatus>,
    out_tx: mpsc::UnboundedSender<(Vec<u8>, Option<SentCallback>)>,
    cancel: CancellationToken,
    peer_certificate: Option<Vec<u8>>,
    account: Option<String>,
    secured: bool,
    reader: Mutex<Option<ReaderState>>,
}

/// Read half plus the framing state carried over from negotiation; the
/// stream root is already open there.
struct ReaderState {
    read_half: tokio::io::ReadHalf<Box<dyn AsyncStream>>,
    scanner: StreamScanner,
    pending: VecDeque<StreamEvent>,
}

impl XmppConnection {
    /// Wraps a finished negotiation. Call [`XmppConnection::start`] once
    /// inbound handlers are connected; stanzas arriving before that would
    /// have no receiver.
    pub fn spawn(
        negotiated: Negotiated,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Arc<Self> {
        let Negotiated {
            stream,
            secured,
            peer_certificate,
            account,
        } = negotiated;
        let XmppStream {
            stream, scanner, pending,
        } = stream;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let (out_tx, mut out_rx) =
            mpsc::unbounded_channel::<(Vec<u8>, Option<SentCallback>)>();
        let cancel = CancellationToken::new();

        let conn = Arc::new(Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            network: "jabber",
            status: Mutex::new(ConnectionStatus::Open),
            received_signal: Signal::new(),
            status_signal: Signal::new(),
            out_tx,
            cancel: cancel.clone(),
            peer_certificate,
            account,
            secured,
            reader: Mutex::new(Some(ReaderState {
                read_half,
                scanner,
                pending,
            })),
        });

        // Writer drains the outbound queue; `sent` hooks fire after the
        // bytes hit the kernel.
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    item = out_rx.recv() => {
                        let Some((bytes, sent)) = item else { break };
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                        if let Some(sent) = sent {
                            sent();
                        }
                    }
                }
            }
        });

        conn
    }

    /// Starts the read loop. Handlers connected to [`Connection::received`]
    /// from here on see every stanza.
    pub fn start(self: &Arc<Self>) {
        let Some(state) = self
            .reader
            .lock()
            .expect("reader slot poisoned")
            .take()
        else {
            return;
        };
        let ReaderState {
            mut read_half,
            mut scanner,
            pending,
        } = state;

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            for event in pending {
                if let StreamEvent::Stanza(node) = event {
                    conn.received_signal.emit(&node);
                }
            }

            let mut buf = [0u8; 8192];
            loop {
                let n = tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    res = read_half.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                match scanner.feed(&buf[..n]) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                StreamEvent::Stanza(node) => {
                                    conn.received_signal.emit(&node);
                                },
                                StreamEvent::StreamStart(_) => {},
                                StreamEvent::StreamEnd => {
                                    conn.close();
                                },
                            }
                        }
                    },
                    Err(e) => {
                        // Framing errors are fatal to the connection.
                        warn!(remote = %conn.remote_id, "stream error: {e}");
                        conn.close();
                        break;
                    },
                }
            }
            conn.set_status(ConnectionStatus::Closed);
        });
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut cur = self.status.lock().expect("status poisoned");
            if *cur == status {
                return;
            }
            *cur = status;
        }
        self.status_signal.emit(&status);
    }

    /// Whether STARTTLS completed on this connection.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Whitespace keepalive, armed by the owner's idle timeout.
    pub fn send_keepalive(&self) {
        let _ = self.out_tx.send((b" ".to_vec(), None));
    }
}

impl Connection for XmppConnection {
    fn network(&self) -> &str {
        self.network
    }

    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status poisoned")
    }

    fn enqueue(&self, node: &XmlNode, sent: Option<SentCallback>) {
        let _ = self.out_tx.send((node.to_bytes(), sent));
    }

    fn received(&self) -> &Signal<XmlNode> {
        &self.received_signal
    }

    fn status_changed(&self) -> &Signal<ConnectionStatus> {
        &self.status_signal
    }

    fn close(&self) {
        self.set_status(ConnectionStatus::Closing);
        let _ = self.out_tx.send((b"</stream:stream>".to_vec(), None));
        self.cancel.cancel();
        self.set_status(ConnectionStatus::Closed);
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_certificate.clone()
    }

    fn account(&self) -> Option<String> {
        self.account.clone()
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// A typed error that can be reported over the wire as
/// `<request-failed domain="…" code="…"><text>…</text></request-failed>`.
///
/// Every error domain carries a stable numeric code per variant; codes are
/// part of the protocol and must not be renumbered.
pub trait WireError: std::error::Error {
    /// Stable domain name used in the `domain` attribute.
    fn domain(&self) -> &'static str;

    /// Stable per-variant code used in the `code` attribute.
    fn code(&self) -> u32;
}

/// Transport and XMPP stream errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmppError {
    #[error("the peer does not support TLS")]
    TlsUnsupported,
    #[error("the peer requires TLS but local policy forbids it")]
    TlsRequired,
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("the peer certificate is not trusted")]
    CertificateNotTrusted,
    #[error("no suitable SASL mechanism offered")]
    NoSuitableMechanism,
    #[error("SASL authentication failed: {0}")]
    AuthenticationFailed(SaslCondition),
    #[error("stream error from peer: {0}")]
    StreamError(String),
    #[error("received XML is not well-formed: {0}")]
    XmlNotWellFormed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unexpected stanza <{0}> in this stream state")]
    UnexpectedStanza(String),
}

impl WireError for XmppError {
    fn domain(&self) -> &'static str {
        "INF_XMPP_CONNECTION_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            XmppError::TlsUnsupported => 1,
            XmppError::TlsRequired => 2,
            XmppError::TlsHandshakeFailed(_) => 3,
            XmppError::CertificateNotTrusted => 4,
            XmppError::NoSuitableMechanism => 5,
            XmppError::AuthenticationFailed(_) => 6,
            XmppError::StreamError(_) => 7,
            XmppError::XmlNotWellFormed(_) => 8,
            XmppError::ConnectionClosed => 9,
            XmppError::UnexpectedStanza(_) => 10,
        }
    }
}

/// SASL failure conditions from RFC 3920 §6.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCondition {
    Aborted,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslCondition {
    pub fn element_name(&self) -> &'static str {
        match self {
            SaslCondition::Aborted => "aborted",
            SaslCondition::IncorrectEncoding => "incorrect-encoding",
            SaslCondition::InvalidAuthzid => "invalid-authzid",
            SaslCondition::InvalidMechanism => "invalid-mechanism",
            SaslCondition::MechanismTooWeak => "mechanism-too-weak",
            SaslCondition::NotAuthorized => "not-authorized",
            SaslCondition::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "aborted" => SaslCondition::Aborted,
            "incorrect-encoding" => SaslCondition::IncorrectEncoding,
            "invalid-authzid" => SaslCondition::InvalidAuthzid,
            "invalid-mechanism" => SaslCondition::InvalidMechanism,
            "mechanism-too-weak" => SaslCondition::MechanismTooWeak,
            "not-authorized" => SaslCondition::NotAuthorized,
            "temporary-auth-failure" => SaslCondition::TemporaryAuthFailure,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SaslCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.element_name())
    }
}

/// Authentication and authorization errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not authorized")]
    Unauthorized,
    #[error("temporary authentication failure")]
    TemporaryFailure,
}

impl WireError for AuthError {
    fn domain(&self) -> &'static str {
        "INF_AUTHENTICATION_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            AuthError::InvalidCredentials => 1,
            AuthError::Unauthorized => 2,
            AuthError::TemporaryFailure => 3,
        }
    }
}

/// Session synchronization errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("unexpected node <{0}> during synchronization")]
    UnexpectedNode(String),
    #[error("user id {0} already in use")]
    IdInUse(u32),
    #[error("user name {0:?} already in use")]
    NameInUse(String),
    #[error("connection closed during synchronization")]
    ConnectionClosed,
    #[error("synchronization cancelled by sender")]
    SenderCancelled,
    #[error("synchronization cancelled by receiver")]
    ReceiverCancelled,
    #[error("malformed <sync-begin>: {0}")]
    MalformedBegin(String),
    #[error("unexpected <sync-end>: expected {expected} messages, got {got}")]
    UnexpectedEnd { expected: u32, got: u32 },
    #[error("message count mismatch: announced {announced}, received {received}")]
    CountMismatch { announced: u32, received: u32 },
}

impl WireError for SyncError {
    fn domain(&self) -> &'static str {
        "INF_SESSION_SYNC_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            SyncError::UnexpectedNode(_) => 1,
            SyncError::IdInUse(_) => 2,
            SyncError::NameInUse(_) => 3,
            SyncError::ConnectionClosed => 4,
            SyncError::SenderCancelled => 5,
            SyncError::ReceiverCancelled => 6,
            SyncError::MalformedBegin(_) => 7,
            SyncError::UnexpectedEnd { .. } => 8,
            SyncError::CountMismatch { .. } => 9,
        }
    }
}

/// Errors applying text operations to a buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error("delete of {len} characters at {pos} exceeds buffer length {buffer_len}")]
    InvalidDelete {
        pos: usize,
        len: usize,
        buffer_len: usize,
    },
    #[error("move to {pos} with selection {len} is outside the buffer")]
    InvalidMove { pos: usize, len: i64 },
    #[error("insert at {pos} exceeds buffer length {buffer_len}")]
    InvalidInsert { pos: usize, buffer_len: usize },
    #[error("deleted text does not match buffer content at {pos}")]
    TextMismatch { pos: usize },
}

impl WireError for TextError {
    fn domain(&self) -> &'static str {
        "INF_TEXT_OPERATION_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            TextError::InvalidDelete { .. } => 1,
            TextError::InvalidMove { .. } => 2,
            TextError::InvalidInsert { .. } => 3,
            TextError::TextMismatch { .. } => 4,
        }
    }
}

/// Errors processing a request stanza, reported back to the requester.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid value for attribute {attribute:?}: {value:?}")]
    InvalidAttribute { attribute: String, value: String },
    #[error("no such user with id {0}")]
    NoSuchUser(u32),
    #[error("missing required attribute {0:?}")]
    MissingField(String),
    #[error("operation not authorized")]
    NotAuthorized,
    #[error("no such node with id {0}")]
    NoSuchNode(u64),
    #[error("a sibling named {0:?} already exists")]
    NodeNameExists(String),
    #[error("node is not a subdirectory")]
    NotASubdirectory,
    #[error("node is not a leaf")]
    NotALeaf,
    #[error("no such account {0:?}")]
    NoSuchAccount(String),
    #[error("account {0:?} already exists")]
    AccountExists(String),
    #[error("request out of sequence for user {user}: got {got}, expected {expected}")]
    OutOfSequence { user: u32, got: u32, expected: u32 },
    #[error("unexpected message <{0}>")]
    UnexpectedMessage(String),
}

impl WireError for RequestError {
    fn domain(&self) -> &'static str {
        "INF_REQUEST_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            RequestError::InvalidAttribute { .. } => 1,
            RequestError::NoSuchUser(_) => 2,
            RequestError::MissingField(_) => 3,
            RequestError::NotAuthorized => 4,
            RequestError::NoSuchNode(_) => 5,
            RequestError::NodeNameExists(_) => 6,
            RequestError::NotASubdirectory => 7,
            RequestError::NotALeaf => 8,
            RequestError::NoSuchAccount(_) => 9,
            RequestError::AccountExists(_) => 10,
            RequestError::OutOfSequence { .. } => 11,
            RequestError::UnexpectedMessage(_) => 12,
        }
    }
}

/// Errors from directory storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored node is not a text session")]
    NotATextSession,
    #[error("malformed stored document: {0}")]
    MalformedDocument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError for StorageError {
    fn domain(&self) -> &'static str {
        "INF_STORAGE_ERROR"
    }

    fn code(&self) -> u32 {
        match self {
            StorageError::NotATextSession => 1,
            StorageError::MalformedDocument(_) => 2,
            StorageError::Io(_) => 3,
        }
    }
}

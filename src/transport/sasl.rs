// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::SaslCondition;

/// Mechanisms in the minimum set.
pub const MECHANISM_PLAIN: &str = "PLAIN";
pub const MECHANISM_ANONYMOUS: &str = "ANONYMOUS";

/// Credentials a client presents; the pluggable side of the client SASL
/// context. A provider may be asked again after a failure when the caller
/// retries with a different mechanism or credential set.
pub trait SaslClientProvider: Send + Sync {
    /// Mechanisms this provider can serve, strongest first.
    fn mechanisms(&self) -> Vec<&'static str>;

    /// Builds the initial response for `mechanism`.
    fn initial_response(&self, mechanism: &str) -> Result<Vec<u8>>;
}

/// Username/password credentials for `PLAIN`.
pub struct PlainCredentials {
    pub authzid: String,
    pub username: String,
    pub password: String,
}

impl SaslClientProvider for PlainCredentials {
    fn mechanisms(&self) -> Vec<&'static str> {
        vec![MECHANISM_PLAIN]
    }

    fn initial_response(&self, mechanism: &str) -> Result<Vec<u8>> {
        if mechanism != MECHANISM_PLAIN {
            bail!("unsupported mechanism {mechanism}");
        }
        let mut out = Vec::new();
        out.extend_from_slice(self.authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Ok(out)
    }
}

/// Anonymous access; the server maps it to the `default` account.
pub struct Anonymous;

impl SaslClientProvider for Anonymous {
    fn mechanisms(&self) -> Vec<&'static str> {
        vec![MECHANISM_ANONYMOUS]
    }

    fn initial_response(&self, _mechanism: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Server-side verification, backed by the account store.
pub trait SaslServerBackend: Send + Sync {
    fn mechanisms(&self) -> Vec<&'static str>;

    /// Verifies an initial response; returns the authenticated account id.
    fn authenticate(
        &self,
        mechanism: &str,
        initial_response: &[u8],
    ) -> Result<String, SaslCondition>;
}

/// Splits a PLAIN initial response into `(authzid, authcid, password)`.
pub fn parse_plain_response(payload: &[u8]) -> Result<(String, String, String), SaslCondition> {
    let parts: Vec<&[u8]> = payload.splitn(3, |b| *b == 0).collect();
    if parts.len() != 3 {
        return Err(SaslCondition::IncorrectEncoding);
    }
    let decode = |bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|_| SaslCondition::IncorrectEncoding)
    };
    Ok((decode(parts[0])?, decode(parts[1])?, decode(parts[2])?))
}

pub fn encode_base64(payload: &[u8]) -> String {
    if payload.is_empty() {
        // An empty initial response is transmitted as "=" per RFC 3920.
        "=".to_string()
    } else {
        BASE64.encode(payload)
    }
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed == "=" || trimmed.is_empty() {
        return Ok(Vec::new());
    }
    BASE64
        .decode(trimmed)
        .with_context(|| format!("invalid base64 payload {trimmed:?}"))
}

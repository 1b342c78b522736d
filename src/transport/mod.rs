// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::module_inception)]
pub mod resolver;
pub mod sasl;
pub mod simulated;
pub mod tcp;
pub mod tls;
pub mod xmpp;

use std::sync::Arc;

use crate::{util::Signal, xml::XmlNode};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Callback fired when a stanza has actually been written to the wire.
pub type SentCallback = Arc<dyn Fn() + Send + Sync>;

/// A duplex stanza pipe.
///
/// Implemented by the XMPP transport and by the in-memory simulated
/// connection used in tests; everything above the transport (groups,
/// sessions, the directory) talks to this interface only.
pub trait Connection: Send + Sync {
    /// Network tag: `"tcp/ip"`, `"jabber"` or `"simulated"`. Groups route
    /// per network.
    fn network(&self) -> &str;

    /// Stable identifier of the local endpoint.
    fn local_id(&self) -> &str;

    /// Stable identifier of the remote endpoint.
    fn remote_id(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    /// Enqueues a serialized stanza. Never blocks; `sent` fires once the
    /// bytes left for the kernel queue.
    fn enqueue(&self, node: &XmlNode, sent: Option<SentCallback>);

    /// Inbound stanzas, emitted synchronously from the receive path.
    fn received(&self) -> &Signal<XmlNode>;

    /// Status transitions.
    fn status_changed(&self) -> &Signal<ConnectionStatus>;

    fn close(&self);

    /// DER encoding of the peer's X.509 certificate, when the transport
    /// authenticated one.
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    /// Account the peer authenticated as (server side).
    fn account(&self) -> Option<String> {
        None
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod node;
pub mod scanner;

pub use node::{XmlChild, XmlNode};
pub use scanner::{StreamEvent, StreamScanner};

use crate::error::WireError;

/// Renders a typed error as the wire-level
/// `<request-failed domain="…" code="…"><text>…</text></request-failed>`.
pub fn request_failed<E: WireError + ?Sized>(err: &E) -> XmlNode {
    XmlNode::new("request-failed")
        .attr("domain", err.domain())
        .attr("code", err.code())
        .child(XmlNode::new("text").text(err.to_string()))
}

/// Adds the `seq` echo when the failed request carried one.
pub fn request_failed_seq<E: WireError + ?Sized>(err: &E, seq: Option<&str>) -> XmlNode {
    let mut node = request_failed(err);
    if let Some(seq) = seq {
        node.set_attr("seq", seq);
    }
    node
}

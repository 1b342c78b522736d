// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Buf, BytesMut};

use crate::{
    error::XmppError,
    xml::node::XmlNode,
};

/// Framing events produced while scanning an XMPP byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The `<stream:stream …>` header opened (attributes parsed, the
    /// element itself stays open for the stream's lifetime).
    StreamStart(XmlNode),
    /// One complete depth-1 child of the stream root.
    Stanza(XmlNode),
    /// The stream root was closed by the peer.
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between markup; character data accumulates silently.
    Text,
    /// Inside `<…>`, kind not yet known (just saw `<`).
    TagOpen,
    /// Inside a start/end tag; tracks quoting and the previous byte so a
    /// trailing `/>` is recognized outside quotes.
    Tag { closing: bool, quote: Option<u8>, prev_slash: bool },
    /// Inside `<!--…-->`, `<?…?>` or `<![CDATA[…]]>`; `terminator` is how
    /// many trailing bytes of the respective end marker have matched.
    Skip { end: &'static [u8], matched: usize },
    /// Still inside `<!…` deciding between comment, CDATA and doctype.
    Bang { seen: usize },
}

/// Incremental stanza-boundary scanner.
///
/// Feeding N bytes yields zero or more events; a stanza split across feeds
/// stays buffered until its closing tag arrives. Only boundaries are
/// detected here; completed slices are handed to [`XmlNode::from_bytes`]
/// for full parsing, so malformed content inside a stanza is still caught.
#[derive(Debug)]
pub struct StreamScanner {
    buf: BytesMut,
    pos: usize,
    depth: usize,
    state: ScanState,
    /// Offset of the `<` that began the current depth-1 stanza.
    stanza_start: Option<usize>,
    /// Offset of the `<` of the tag currently being scanned.
    tag_start: usize,
    root_seen: bool,
}

impl Default for StreamScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pos: 0,
            depth: 0,
            state: ScanState::Text,
            stanza_start: None,
            tag_start: 0,
            root_seen: false,
        }
    }

    /// Consumes a byte slab, returning every event it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, XmppError> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            match self.state {
                ScanState::Text => {
                    if b == b'<' {
                        self.tag_start = self.pos;
                        self.state = ScanState::TagOpen;
                    }
                },
                ScanState::TagOpen => match b {
                    b'/' => {
                        self.state = ScanState::Tag {
                            closing: true,
                            quote: None,
                            prev_slash: false,
                        };
                    },
                    b'?' => {
                        self.state = ScanState::Skip {
                            end: b"?>",
                            matched: 0,
                        };
                    },
                    b'!' => {
                        self.state = ScanState::Bang { seen: 0 };
                    },
                    _ => {
                        self.state = ScanState::Tag {
                            closing: false,
                            quote: None,
                            prev_slash: false,
                        };
                    },
                },
                ScanState::Bang { seen } => {
                    // Enough lookahead to tell <!-- from <![CDATA[ from
                    // <!DOCTYPE; the generic skip terminator covers all.
                    let state = match (seen, b) {
                        (0, b'-') => ScanState::Bang { seen: 1 },
                        (1, b'-') => ScanState::Skip {
                            end: b"-->",
                            matched: 0,
                        },
                        (0, b'[') => ScanState::Skip {
                            end: b"]]>",
                            matched: 0,
                        },
                        (_, b'>') => ScanState::Text,
                        _ => ScanState::Skip {
                            end: b">",
                            matched: 0,
                        },
                    };
                    self.state = state;
                },
                ScanState::Skip { end, matched } => {
                    let matched = if b == end[matched] {
                        matched + 1
                    } else if b == end[0] {
                        1
                    } else {
                        0
                    };
                    if matched == end.len() {
                        self.state = ScanState::Text;
                    } else {
                        self.state = ScanState::Skip { end, matched };
                    }
                },
                ScanState::Tag {
                    closing,
                    quote,
                    prev_slash,
                } => {
                    match quote {
                        Some(q) => {
                            if b == q {
                                self.state = ScanState::Tag {
                                    closing,
                                    quote: None,
                                    prev_slash: false,
                                };
                            }
                        },
                        None => match b {
                            b'"' | b'\'' => {
                                self.state = ScanState::Tag {
                                    closing,
                                    quote: Some(b),
                                    prev_slash: false,
                                };
                            },
                            b'>' => {
                                self.state = ScanState::Text;
                                let self_closing = prev_slash;
                                self.finish_tag(closing, self_closing, &mut events)?;
                            },
                            _ => {
                                self.state = ScanState::Tag {
                                    closing,
                                    quote: None,
                                    prev_slash: b == b'/',
                                };
                            },
                        },
                    }
                },
            }
            self.pos += 1;
        }

        self.compact();
        Ok(events)
    }

    fn finish_tag(
        &mut self,
        closing: bool,
        self_closing: bool,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), XmppError> {
        let tag_end = self.pos + 1;

        if closing {
            if self.depth == 0 {
                return Err(XmppError::XmlNotWellFormed(
                    "close tag with no open element".into(),
                ));
            }
            self.depth -= 1;
            match self.depth {
                0 => events.push(StreamEvent::StreamEnd),
                1 => self.complete_stanza(tag_end, events)?,
                _ => {},
            }
            return Ok(());
        }

        if self_closing {
            match self.depth {
                0 => {
                    return Err(XmppError::XmlNotWellFormed(
                        "stream root must not be self-closing".into(),
                    ));
                },
                1 => {
                    if self.stanza_start.is_none() {
                        self.stanza_start = Some(self.tag_start);
                    }
                    self.complete_stanza(tag_end, events)?;
                },
                _ => {},
            }
            return Ok(());
        }

        // Plain open tag.
        self.depth += 1;
        match self.depth {
            1 => {
                if self.root_seen {
                    return Err(XmppError::XmlNotWellFormed(
                        "second stream root".into(),
                    ));
                }
                self.root_seen = true;
                events.push(StreamEvent::StreamStart(
                    self.parse_open_tag(self.tag_start, tag_end)?,
                ));
            },
            2 => {
                self.stanza_start = Some(self.tag_start);
            },
            _ => {},
        }
        Ok(())
    }

    fn complete_stanza(
        &mut self,
        end: usize,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), XmppError> {
        let start = self.stanza_start.take().ok_or_else(|| {
            XmppError::XmlNotWellFormed("stanza end without start".into())
        })?;
        let node = XmlNode::from_bytes(&self.buf[start..end])
            .map_err(|e| XmppError::XmlNotWellFormed(e.to_string()))?;
        events.push(StreamEvent::Stanza(node));
        Ok(())
    }

    /// Turns the stream header's open tag into a parsed element.
    fn parse_open_tag(&self, start: usize, end: usize) -> Result<XmlNode, XmppError> {
        let mut synthetic = self.buf[start..end - 1].to_vec();
        synthetic.extend_from_slice(b"/>");
        XmlNode::from_bytes(&synthetic)
            .map_err(|e| XmppError::XmlNotWellFormed(e.to_string()))
    }

    /// Drops consumed bytes once nothing references them.
    fn compact(&mut self) {
        if self.state == ScanState::Text && self.stanza_start.is_none() {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }
}

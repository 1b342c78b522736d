// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    error::TextError,
    text::chunk::{Chunk, Segment},
    util::Signal,
};

/// Payload of the `text-inserted` signal.
#[derive(Debug, Clone)]
pub struct TextInserted {
    pub pos: usize,
    pub chunk: Chunk,
    pub user: u32,
}

/// Payload of the `text-erased` signal.
#[derive(Debug, Clone)]
pub struct TextErased {
    pub pos: usize,
    pub chunk: Chunk,
    pub user: u32,
}

/// Observer slots shared by every buffer implementation.
///
/// Emission is synchronous: handlers run on the same stack as the mutating
/// call, before it returns.
#[derive(Debug, Default)]
pub struct BufferSignals {
    pub inserted: Signal<TextInserted>,
    pub erased: Signal<TextErased>,
    pub modified_changed: Signal<bool>,
}

/// A character-indexed text store with author attribution.
///
/// The buffer is authoritative for document content; sessions keep no
/// parallel copy. The encoding is fixed at construction; this crate's
/// implementations are UTF-8 throughout.
pub trait TextBuffer: Send {
    fn encoding(&self) -> &'static str {
        "UTF-8"
    }

    /// Length in characters.
    fn len_chars(&self) -> usize;

    /// Copies `len` characters starting at `pos` into a chunk.
    fn slice(&self, pos: usize, len: usize) -> Result<Chunk, TextError>;

    fn insert_chunk(&mut self, pos: usize, chunk: &Chunk, by: u32)
    -> Result<(), TextError>;

    /// Removes `len` characters at `pos`, returning the removed chunk.
    fn erase(&mut self, pos: usize, len: usize, by: u32) -> Result<Chunk, TextError>;

    /// Iteration by run, in buffer order.
    fn runs(&self) -> Vec<Segment>;

    fn is_modified(&self) -> bool;
    fn set_modified(&mut self, modified: bool);

    fn signals(&self) -> &BufferSignals;
}

/// The minimum concrete buffer: an ordered run-length list of
/// `(author, UTF-8 text)` segments.
#[derive(Debug, Default)]
pub struct DefaultTextBuffer {
    content: Chunk,
    modified: bool,
    signals: BufferSignals,
}

impl DefaultTextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunk(content: Chunk) -> Self {
        Self {
            content,
            modified: false,
            signals: BufferSignals::default(),
        }
    }

    pub fn content(&self) -> &Chunk {
        &self.content
    }

    fn mark_modified(&mut self) {
        if !self.modified {
            self.modified = true;
            self.signals.modified_changed.emit(&true);
        }
    }
}

impl TextBuffer for DefaultTextBuffer {
    fn len_chars(&self) -> usize {
        self.content.len_chars()
    }

    fn slice(&self, pos: usize, len: usize) -> Result<Chunk, TextError> {
        if pos + len > self.content.len_chars() {
            return Err(TextError::InvalidDelete {
                pos,
                len,
                buffer_len: self.content.len_chars(),
            });
        }
        Ok(self.content.substring(pos, len))
    }

    fn insert_chunk(
        &mut self,
        pos: usize,
        chunk: &Chunk,
        by: u32,
    ) -> Result<(), TextError> {
        if pos > self.content.len_chars() {
            return Err(TextError::InvalidInsert {
                pos,
                buffer_len: self.content.len_chars(),
            });
        }
        self.content.insert_chunk(pos, chunk);
        self.mark_modified();
        self.signals.inserted.emit(&TextInserted {
            pos,
            chunk: chunk.clone(),
            user: by,
        });
        Ok(())
    }

    fn erase(&mut self, pos: usize, len: usize, by: u32) -> Result<Chunk, TextError> {
        if pos + len > self.content.len_chars() {
            return Err(TextError::InvalidDelete {
                pos,
                len,
                buffer_len: self.content.len_chars(),
            });
        }
        let erased = self.content.erase(pos, len);
        self.mark_modified();
        self.signals.erased.emit(&TextErased {
            pos,
            chunk: erased.clone(),
            user: by,
        });
        Ok(erased)
    }

    fn runs(&self) -> Vec<Segment> {
        self.content.segments().to_vec()
    }

    fn is_modified(&self) -> bool {
        self.modified
    }

    fn set_modified(&mut self, modified: bool) {
        if self.modified != modified {
            self.modified = modified;
            self.signals.modified_changed.emit(&modified);
        }
    }

    fn signals(&self) -> &BufferSignals {
        &self.signals
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_insert_erase_roundtrip() -> Result<(), TextError> {
        let mut buf = DefaultTextBuffer::new();
        buf.insert_chunk(0, &Chunk::from_text(1, "Hello!"), 1)?;
        buf.insert_chunk(5, &Chunk::from_text(2, ", world"), 2)?;

        assert_eq!(buf.len_chars(), 13);
        assert_eq!(buf.content().to_plain_text(), "Hello, world!");
        assert_eq!(buf.runs().len(), 3);

        let erased = buf.erase(5, 7, 1)?;
        assert_eq!(erased.to_plain_text(), ", world");
        assert_eq!(buf.content().to_plain_text(), "Hello!");
        Ok(())
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let mut buf = DefaultTextBuffer::new();
        buf.insert_chunk(0, &Chunk::from_text(1, "abc"), 1)
            .expect("insert");

        assert!(buf.erase(1, 5, 1).is_err());
        assert!(buf.insert_chunk(7, &Chunk::from_text(1, "x"), 1).is_err());
        assert!(buf.slice(2, 2).is_err());
        // failed mutations must not fire signals or flip content
        assert_eq!(buf.content().to_plain_text(), "abc");
    }

    #[test]
    fn test_signals_run_synchronously() -> Result<(), TextError> {
        let mut buf = DefaultTextBuffer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        buf.signals().inserted.connect(move |ins| {
            assert_eq!(ins.pos, 0);
            assert_eq!(ins.chunk.to_plain_text(), "hi");
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        buf.insert_chunk(0, &Chunk::from_text(3, "hi"), 3)?;
        assert_eq!(hits.load(Ordering::SeqCst), 1, "handler runs on apply stack");
        assert!(buf.is_modified());

        buf.set_modified(false);
        assert!(!buf.is_modified());
        Ok(())
    }
}

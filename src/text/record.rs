// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};

use crate::{
    algorithm::request::Request,
    text::{chunk::Chunk, session::{chunk_to_segments, request_to_xml}},
    xml::XmlNode,
};

/// Appends every executed request of a session to an XML journal.
///
/// The journal starts with a snapshot of the buffer at recording time; each
/// following `<request>` carries the issuing user and state vector, which
/// is enough to replay the session offline.
pub struct SessionRecorder {
    writer: BufWriter<File>,
    finished: bool,
}

impl SessionRecorder {
    pub fn create(path: impl AsRef<Path>, initial: &Chunk) -> Result<Self> {
        let file = File::create(path.as_ref()).with_context(|| {
            format!("failed to create session record {:?}", path.as_ref())
        })?;
        let mut writer = BufWriter::new(file);

        writer.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
        writer.write_all(b"<infinote-adopted-session-record>\n")?;

        let mut snapshot = XmlNode::new("initial");
        for seg in chunk_to_segments(initial) {
            snapshot.push(seg);
        }
        writer.write_all(&snapshot.to_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(Self {
            writer,
            finished: false,
        })
    }

    pub fn record_request(&mut self, request: &Request) -> Result<()> {
        self.writer.write_all(&request_to_xml(request).to_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Terminates the document. Further records are rejected.
    pub fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            self.writer
                .write_all(b"</infinote-adopted-session-record>\n")?;
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithm::{request::RequestKind, state_vector::StateVector},
        operation::Operation,
        text::insert::InsertOperation,
    };

    #[test]
    fn test_record_roundtrip_shape() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("session.record.xml");

        let initial = Chunk::from_text(1, "seed");
        let mut recorder = SessionRecorder::create(&path, &initial)?;

        let mut vector = StateVector::new();
        vector.set(1, 0);
        recorder.record_request(&Request::new(
            1,
            vector,
            RequestKind::Do(Operation::Insert(InsertOperation::new(
                4,
                Chunk::from_text(1, "!"),
            ))),
        ))?;
        recorder.finish()?;

        let content = std::fs::read_to_string(&path)?;
        assert!(content.starts_with("<?xml"));
        assert!(content.contains("<infinote-adopted-session-record>"));
        assert!(content.contains("<initial><segment author=\"1\">seed</segment></initial>"));
        assert!(content.contains("<request user=\"1\""));
        assert!(content.trim_end().ends_with("</infinote-adopted-session-record>"));
        Ok(())
    }
}

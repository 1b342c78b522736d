// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::{
    error::TextError,
    operation::{Operation, OperationFlags},
    text::{buffer::TextBuffer, chunk::Chunk, insert::InsertOperation},
};

/// What a delete removes: either the recorded chunk (reversible) or a bare
/// character count as transmitted over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Chunk(Chunk),
    Length(usize),
}

impl DeleteTarget {
    fn len(&self) -> usize {
        match self {
            DeleteTarget::Chunk(c) => c.len_chars(),
            DeleteTarget::Length(n) => *n,
        }
    }

    /// The sub-target covering `len` characters from offset `from`.
    fn substring(&self, from: usize, len: usize) -> DeleteTarget {
        match self {
            DeleteTarget::Chunk(c) => DeleteTarget::Chunk(c.substring(from, len)),
            DeleteTarget::Length(_) => DeleteTarget::Length(len),
        }
    }

    /// The target with the range `[from, from + len)` removed.
    fn without_middle(&self, from: usize, len: usize) -> DeleteTarget {
        match self {
            DeleteTarget::Chunk(c) => {
                let mut out = c.substring(0, from);
                out.concat(&c.substring(from + len, c.len_chars() - from - len));
                DeleteTarget::Chunk(out)
            },
            DeleteTarget::Length(n) => DeleteTarget::Length(n - len),
        }
    }
}

/// Deletes a run of characters starting at a character position.
///
/// Local deletes carry the removed chunk and are reversible from birth;
/// remote deletes arrive as `(position, length)` and are completed into
/// their reversible form by [`DeleteOperation::apply_transformed`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub position: usize,
    pub target: DeleteTarget,
}

impl DeleteOperation {
    pub fn from_chunk(position: usize, chunk: Chunk) -> Self {
        Self {
            position,
            target: DeleteTarget::Chunk(chunk),
        }
    }

    pub fn from_len(position: usize, len: usize) -> Self {
        Self {
            position,
            target: DeleteTarget::Length(len),
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        match &self.target {
            DeleteTarget::Chunk(c) => Some(c),
            DeleteTarget::Length(_) => None,
        }
    }

    pub fn flags(&self) -> OperationFlags {
        match self.target {
            DeleteTarget::Chunk(_) => {
                OperationFlags::AFFECTS_BUFFER | OperationFlags::REVERSIBLE
            },
            DeleteTarget::Length(_) => OperationFlags::AFFECTS_BUFFER,
        }
    }

    pub fn apply(&self, by: u32, buffer: &mut dyn TextBuffer) -> Result<Chunk, TextError> {
        buffer.erase(self.position, self.len(), by)
    }

    /// Applies `transformed` and rebuilds a reversible twin of `self` by
    /// stitching together the text each transformed part removes from the
    /// buffer. Parts cut away by concurrent deletes are simply absent from
    /// the twin.
    pub fn apply_transformed(
        &self,
        transformed: &Operation,
        by: u32,
        buffer: &mut dyn TextBuffer,
    ) -> Result<Operation, TextError> {
        let mut recovered = Chunk::new();
        for part in transformed.unsplit() {
            match part {
                Operation::Delete(del) => {
                    let erased = del.apply(by, buffer)?;
                    recovered.concat(&erased);
                },
                Operation::NoOp => {},
                // A delete only ever transforms into deletes and no-ops.
                other => {
                    debug_assert!(false, "delete transformed into {other:?}");
                },
            }
        }
        Ok(Operation::Delete(DeleteOperation::from_chunk(
            self.position,
            recovered,
        )))
    }

    pub fn revert(&self) -> Option<Operation> {
        match &self.target {
            DeleteTarget::Chunk(c) => Some(Operation::Insert(InsertOperation::new(
                self.position,
                c.clone(),
            ))),
            DeleteTarget::Length(_) => None,
        }
    }

    pub fn transform(&self, against: &Operation) -> Result<Operation> {
        match against {
            Operation::Insert(other) => Ok(self.transform_insert(other)),
            Operation::Delete(other) => Ok(self.transform_delete(other)),
            _ => Ok(Operation::Delete(self.clone())),
        }
    }

    fn transform_insert(&self, other: &InsertOperation) -> Operation {
        let p = self.position;
        let n = self.len();
        let q = other.position;
        let d = other.len();

        if q >= p + n {
            Operation::Delete(self.clone())
        } else if q <= p {
            Operation::Delete(DeleteOperation {
                position: p + d,
                target: self.target.clone(),
            })
        } else {
            // The insert lands strictly inside: delete the head, then the
            // tail shifted past the inserted text.
            let head_len = q - p;
            Operation::split(
                Operation::Delete(DeleteOperation {
                    position: p,
                    target: self.target.substring(0, head_len),
                }),
                Operation::Delete(DeleteOperation {
                    position: p + d,
                    target: self.target.substring(head_len, n - head_len),
                }),
            )
        }
    }

    fn transform_delete(&self, other: &DeleteOperation) -> Operation {
        let p = self.position;
        let n = self.len();
        let q = other.position;
        let m = other.len();

        if q + m <= p {
            Operation::Delete(DeleteOperation {
                position: p - m,
                target: self.target.clone(),
            })
        } else if q >= p + n {
            Operation::Delete(self.clone())
        } else if q <= p && q + m >= p + n {
            // Fully swallowed by the other delete.
            Operation::NoOp
        } else if q <= p {
            // Head overlap: only the tail past the other delete remains.
            let cut = q + m - p;
            Operation::Delete(DeleteOperation {
                position: q,
                target: self.target.substring(cut, n - cut),
            })
        } else if q + m <= p + n {
            // The other delete is strictly inside; its range becomes a
            // no-op factor.
            Operation::Delete(DeleteOperation {
                position: p,
                target: self.target.without_middle(q - p, m),
            })
        } else {
            // Tail overlap.
            Operation::Delete(DeleteOperation {
                position: p,
                target: self.target.substring(0, q - p),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn del(pos: usize, text: &str) -> DeleteOperation {
        DeleteOperation::from_chunk(pos, Chunk::from_text(1, text))
    }

    fn as_delete(op: Operation) -> DeleteOperation {
        match op {
            Operation::Delete(d) => d,
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_transform_against_inside_insert_splits() -> Result<()> {
        // delete "cdefg" from "abcdefghij", concurrent insert "XY" at 4
        let a = del(2, "cdefg");
        let ins = Operation::Insert(InsertOperation::new(4, Chunk::from_text(2, "XY")));

        let t = a.transform(&ins)?;
        let parts = t.unsplit();
        assert_eq!(parts.len(), 2);

        let first = as_delete(parts[0].clone());
        assert_eq!(first.position, 2);
        assert_eq!(first.chunk().expect("chunk kept").to_plain_text(), "cd");

        let second = as_delete(parts[1].clone());
        assert_eq!(second.position, 4);
        assert_eq!(second.chunk().expect("chunk kept").to_plain_text(), "efg");
        Ok(())
    }

    #[test]
    fn test_transform_against_delete_cases() -> Result<()> {
        let a = del(4, "efgh");

        // Disjoint left: shift.
        let t = as_delete(a.transform(&Operation::Delete(del(0, "ab")))?);
        assert_eq!((t.position, t.len()), (2, 4));

        // Disjoint right: unchanged.
        let t = as_delete(a.transform(&Operation::Delete(del(9, "xy")))?);
        assert_eq!((t.position, t.len()), (4, 4));

        // Fully swallowed.
        let t = a.transform(&Operation::Delete(del(3, "defghi")))?;
        assert_eq!(t, Operation::NoOp);

        // Head overlap: "ef" already gone.
        let t = as_delete(a.transform(&Operation::Delete(del(2, "cdef")))?);
        assert_eq!(t.position, 2);
        assert_eq!(t.chunk().expect("chunk kept").to_plain_text(), "gh");

        // Other strictly inside: middle becomes a no-op factor.
        let t = as_delete(a.transform(&Operation::Delete(del(5, "fg")))?);
        assert_eq!(t.position, 4);
        assert_eq!(t.chunk().expect("chunk kept").to_plain_text(), "eh");

        // Tail overlap.
        let t = as_delete(a.transform(&Operation::Delete(del(6, "ghij")))?);
        assert_eq!(t.position, 4);
        assert_eq!(t.chunk().expect("chunk kept").to_plain_text(), "ef");
        Ok(())
    }

    #[test]
    fn test_remote_delete_recovers_chunk_on_apply() -> Result<(), TextError> {
        use crate::{session::users::UserTable, text::buffer::DefaultTextBuffer};

        let mut buffer = DefaultTextBuffer::new();
        buffer.insert_chunk(0, &Chunk::from_text(1, "abcdefgh"), 1)?;
        let users = UserTable::new();

        let original = Operation::Delete(DeleteOperation::from_len(2, 3));
        let transformed = original.clone();
        let logged = original.apply_transformed(&transformed, 2, &mut buffer, &users)?;

        assert_eq!(buffer.content().to_plain_text(), "abfgh");
        match logged {
            Operation::Delete(d) => {
                assert_eq!(d.position, 2);
                assert_eq!(d.chunk().expect("reversible twin").to_plain_text(), "cde");
            },
            other => panic!("expected delete, got {other:?}"),
        }
        Ok(())
    }
}

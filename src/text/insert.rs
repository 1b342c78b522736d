// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};

use crate::{
    error::TextError,
    operation::{ConcurrencyId, Operation},
    text::{buffer::TextBuffer, chunk::Chunk, delete::DeleteOperation},
};

/// Inserts a chunk at a character position.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOperation {
    pub position: usize,
    pub chunk: Chunk,
}

impl InsertOperation {
    pub fn new(position: usize, chunk: Chunk) -> Self {
        Self { position, chunk }
    }

    pub fn len(&self) -> usize {
        self.chunk.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn apply(&self, by: u32, buffer: &mut dyn TextBuffer) -> Result<(), TextError> {
        buffer.insert_chunk(self.position, &self.chunk, by)
    }

    pub fn revert(&self) -> Operation {
        Operation::Delete(DeleteOperation::from_chunk(self.position, self.chunk.clone()))
    }

    pub fn transform(
        &self,
        against: &Operation,
        cid: ConcurrencyId,
    ) -> Result<Operation> {
        match against {
            Operation::Insert(other) => self.transform_insert(other, cid),
            Operation::Delete(other) => Ok(self.transform_delete(other)),
            // Moves and no-ops do not affect buffer positions.
            _ => Ok(Operation::Insert(self.clone())),
        }
    }

    fn transform_insert(
        &self,
        other: &InsertOperation,
        cid: ConcurrencyId,
    ) -> Result<Operation> {
        let shifted = if other.position < self.position {
            true
        } else if other.position > self.position {
            false
        } else {
            match cid {
                // The other insert wins the spot; this one moves past it.
                ConcurrencyId::OtherWins => true,
                ConcurrencyId::SelfWins => false,
                ConcurrencyId::NoneNeeded => {
                    bail!(
                        "insert/insert at equal position {} requires a concurrency id",
                        self.position
                    )
                },
            }
        };

        let position = if shifted {
            self.position + other.len()
        } else {
            self.position
        };
        Ok(Operation::Insert(InsertOperation::new(
            position,
            self.chunk.clone(),
        )))
    }

    fn transform_delete(&self, other: &DeleteOperation) -> Operation {
        let q = other.position;
        let n = other.len();
        let p = self.position;

        let position = if q + n <= p {
            p - n
        } else if q >= p {
            p
        } else {
            // The insertion point fell inside the deleted run; collapse to
            // the delete's start.
            q
        };
        Operation::Insert(InsertOperation::new(position, self.chunk.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(pos: usize, text: &str) -> InsertOperation {
        InsertOperation::new(pos, Chunk::from_text(1, text))
    }

    fn as_insert(op: Operation) -> InsertOperation {
        match op {
            Operation::Insert(i) => i,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_transform_against_insert_before_and_after() -> Result<()> {
        let a = ins(4, "X");

        let before = Operation::Insert(ins(2, "yy"));
        let t = as_insert(a.transform(&before, ConcurrencyId::NoneNeeded)?);
        assert_eq!(t.position, 6);

        let after = Operation::Insert(ins(5, "yy"));
        let t = as_insert(a.transform(&after, ConcurrencyId::NoneNeeded)?);
        assert_eq!(t.position, 4);
        Ok(())
    }

    #[test]
    fn test_transform_equal_position_uses_cid() -> Result<()> {
        let a = ins(4, "Y");
        let other = Operation::Insert(ins(4, "X"));

        let t = as_insert(a.transform(&other, ConcurrencyId::OtherWins)?);
        assert_eq!(t.position, 5, "losing insert shifts past the winner");

        let t = as_insert(a.transform(&other, ConcurrencyId::SelfWins)?);
        assert_eq!(t.position, 4, "winning insert keeps its spot");

        assert!(a.transform(&other, ConcurrencyId::NoneNeeded).is_err());
        Ok(())
    }

    #[test]
    fn test_transform_against_delete() -> Result<()> {
        let a = ins(6, "X");

        // Delete entirely to the left.
        let left = Operation::Delete(DeleteOperation::from_len(1, 3));
        let t = as_insert(a.transform(&left, ConcurrencyId::NoneNeeded)?);
        assert_eq!(t.position, 3);

        // Delete to the right.
        let right = Operation::Delete(DeleteOperation::from_len(6, 2));
        let t = as_insert(a.transform(&right, ConcurrencyId::NoneNeeded)?);
        assert_eq!(t.position, 6);

        // Insertion point inside the deleted run collapses to its start.
        let spanning = Operation::Delete(DeleteOperation::from_len(4, 5));
        let t = as_insert(a.transform(&spanning, ConcurrencyId::NoneNeeded)?);
        assert_eq!(t.position, 4);
        Ok(())
    }
}

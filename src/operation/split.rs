// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::operation::{ConcurrencyId, Operation, OperationFlags};

/// "Do `first`, then `second`" — with `second` expressed in the frame that
/// results from applying `first`.
///
/// Split nodes are never un-split automatically during transformation;
/// callers use [`Operation::unsplit`] to get a flat list.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOperation {
    pub first: Operation,
    pub second: Operation,
}

impl SplitOperation {
    pub fn flags(&self) -> OperationFlags {
        let first = self.first.flags();
        let second = self.second.flags();

        let mut out = (first | second) & OperationFlags::AFFECTS_BUFFER;
        if first.contains(OperationFlags::REVERSIBLE)
            && second.contains(OperationFlags::REVERSIBLE)
        {
            out |= OperationFlags::REVERSIBLE;
        }
        out
    }

    pub fn need_concurrency_id_against(&self, other: &Operation) -> bool {
        self.first.need_concurrency_id(other) || self.second.need_concurrency_id(other)
    }

    /// Transforms the split against `against`:
    /// `split(T(first, against), T(second, T(against, first)))`.
    pub fn transform(
        &self,
        against: &Operation,
        self_lcs: Option<&Operation>,
        against_lcs: Option<&Operation>,
        cid: ConcurrencyId,
    ) -> Result<Operation> {
        let new_first = self.first.transform(against, self_lcs, against_lcs, cid)?;
        let against_after_first =
            against.transform(&self.first, against_lcs, self_lcs, cid.negate())?;
        let new_second =
            self.second
                .transform(&against_after_first, self_lcs, against_lcs, cid)?;
        Ok(Operation::split(new_first, new_second))
    }

    /// Transforms `other` against this split: against `first`, then against
    /// `second` (which already lives in the post-`first` frame).
    pub fn transform_other(
        &self,
        other: &Operation,
        other_lcs: Option<&Operation>,
        self_lcs: Option<&Operation>,
        cid: ConcurrencyId,
    ) -> Result<Operation> {
        let tmp = other.transform(&self.first, other_lcs, self_lcs, cid)?;
        tmp.transform(&self.second, other_lcs, self_lcs, cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::{chunk::Chunk, delete::DeleteOperation, insert::InsertOperation};

    fn ins(pos: usize, text: &str) -> Operation {
        Operation::Insert(InsertOperation::new(pos, Chunk::from_text(1, text)))
    }

    #[test]
    fn test_split_revert_order() {
        let split = Operation::split(ins(0, "a"), ins(5, "b"));
        let reverted = split.revert().expect("split of inserts is reversible");

        match reverted {
            Operation::Split(s) => {
                assert_eq!(
                    s.first,
                    Operation::Delete(DeleteOperation::from_chunk(
                        5,
                        Chunk::from_text(1, "b")
                    ))
                );
                assert_eq!(
                    s.second,
                    Operation::Delete(DeleteOperation::from_chunk(
                        0,
                        Chunk::from_text(1, "a")
                    ))
                );
            },
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn test_split_flags() {
        let reversible = Operation::split(ins(0, "a"), ins(1, "b"));
        assert!(reversible.is_reversible());
        assert!(reversible.affects_buffer());

        let partial = Operation::split(
            ins(0, "a"),
            Operation::Delete(DeleteOperation::from_len(1, 2)),
        );
        assert!(!partial.is_reversible());
        assert!(partial.affects_buffer());
    }
}

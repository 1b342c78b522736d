// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::module_inception)]
pub mod split;

use anyhow::Result;
use bitflags::bitflags;

use crate::{
    error::TextError,
    operation::split::SplitOperation,
    session::users::UserTable,
    text::{
        buffer::TextBuffer,
        delete::DeleteOperation,
        insert::InsertOperation,
        move_op::MoveOperation,
    },
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperationFlags: u8 {
        /// The operation changes buffer content (as opposed to caret-only
        /// effects).
        const AFFECTS_BUFFER = 1 << 0;
        /// The operation can produce an inverse via [`Operation::revert`].
        const REVERSIBLE = 1 << 1;
    }
}

/// Tiebreak fed into [`Operation::transform`] when the algebra alone cannot
/// order two concurrent operations.
///
/// `SelfWins` means the transformed operation keeps its position;
/// `OtherWins` means the other operation takes the spot and the transformed
/// one shifts past it. The algorithm derives the id from the issuing user
/// ids (lower id wins) and negates it for the mirrored transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyId {
    SelfWins,
    NoneNeeded,
    OtherWins,
}

impl ConcurrencyId {
    pub fn negate(self) -> Self {
        match self {
            ConcurrencyId::SelfWins => ConcurrencyId::OtherWins,
            ConcurrencyId::OtherWins => ConcurrencyId::SelfWins,
            ConcurrencyId::NoneNeeded => ConcurrencyId::NoneNeeded,
        }
    }
}

/// A buffer mutation described abstractly, closed under transformation.
///
/// The minimum set: no-op, split ("do a then b"), text insert, text delete
/// and text move. Splits arise from transforming a delete across a
/// concurrent insert that lands strictly inside the deleted range.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    NoOp,
    Split(Box<SplitOperation>),
    Insert(InsertOperation),
    Delete(DeleteOperation),
    Move(MoveOperation),
}

impl Operation {
    pub fn split(first: Operation, second: Operation) -> Self {
        Operation::Split(Box::new(SplitOperation { first, second }))
    }

    pub fn flags(&self) -> OperationFlags {
        match self {
            Operation::NoOp => OperationFlags::empty(),
            Operation::Split(s) => s.flags(),
            Operation::Insert(_) => {
                OperationFlags::AFFECTS_BUFFER | OperationFlags::REVERSIBLE
            },
            Operation::Delete(d) => d.flags(),
            Operation::Move(_) => OperationFlags::empty(),
        }
    }

    pub fn affects_buffer(&self) -> bool {
        self.flags().contains(OperationFlags::AFFECTS_BUFFER)
    }

    pub fn is_reversible(&self) -> bool {
        self.flags().contains(OperationFlags::REVERSIBLE)
    }

    /// Whether transforming `self` against `against` is ambiguous without a
    /// concurrency id. True only for equal-position insert pairs and for
    /// splits that expand into such.
    pub fn need_concurrency_id(&self, against: &Operation) -> bool {
        if let Operation::Split(s) = against {
            return s.need_concurrency_id_against(self);
        }
        match self {
            Operation::Split(s) => s.need_concurrency_id_against(against),
            Operation::Insert(op) => match against {
                Operation::Insert(other) => op.position == other.position,
                _ => false,
            },
            _ => false,
        }
    }

    /// Inclusion transformation: produces `self`'s effect in a frame where
    /// `against` has already been applied.
    ///
    /// `self_lcs`/`against_lcs` are the two operations at their least
    /// common state; they are consulted only when the concurrency id alone
    /// would not determine the result, which cannot happen with ids derived
    /// from user ids, so the current rules ignore them.
    pub fn transform(
        &self,
        against: &Operation,
        self_lcs: Option<&Operation>,
        against_lcs: Option<&Operation>,
        cid: ConcurrencyId,
    ) -> Result<Operation> {
        // Transforming against a split means transforming against both of
        // its parts in order.
        if let Operation::Split(s) = against {
            return s.transform_other(self, self_lcs, against_lcs, cid);
        }

        match self {
            Operation::NoOp => Ok(Operation::NoOp),
            Operation::Split(s) => s.transform(against, self_lcs, against_lcs, cid),
            Operation::Insert(op) => op.transform(against, cid),
            Operation::Delete(op) => op.transform(against),
            Operation::Move(op) => op.transform(against),
        }
    }

    /// Applies the operation to `buffer` on behalf of user `by`.
    pub fn apply(
        &self,
        by: u32,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<(), TextError> {
        match self {
            Operation::NoOp => Ok(()),
            Operation::Split(s) => {
                s.first.apply(by, buffer, users)?;
                s.second.apply(by, buffer, users)
            },
            Operation::Insert(op) => op.apply(by, buffer),
            Operation::Delete(op) => op.apply(by, buffer).map(|_| ()),
            Operation::Move(op) => op.apply(by, buffer, users),
        }
    }

    /// Applies `transformed` (which originated from `self` by
    /// transformation) and returns the operation to store in the request
    /// log: `self` itself when it is already reversible or does not affect
    /// the buffer, otherwise a reversible twin reconstructed from the
    /// buffer content the transformed form removes.
    pub fn apply_transformed(
        &self,
        transformed: &Operation,
        by: u32,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<Operation, TextError> {
        if self.is_reversible() || !self.affects_buffer() {
            transformed.apply(by, buffer, users)?;
            return Ok(self.clone());
        }

        match self {
            Operation::Delete(op) => op.apply_transformed(transformed, by, buffer),
            // Only plain remote deletes are transmitted irreversibly.
            _ => {
                transformed.apply(by, buffer, users)?;
                Ok(self.clone())
            },
        }
    }

    /// Produces the inverse. `None` when the operation is not reversible.
    pub fn revert(&self) -> Option<Operation> {
        match self {
            Operation::NoOp => Some(Operation::NoOp),
            Operation::Split(s) => Some(Operation::split(
                s.second.revert()?,
                s.first.revert()?,
            )),
            Operation::Insert(op) => Some(op.revert()),
            Operation::Delete(op) => op.revert(),
            Operation::Move(_) => None,
        }
    }

    /// Flattens nested splits into the sequential list of plain operations.
    pub fn unsplit(&self) -> Vec<&Operation> {
        let mut out = Vec::new();
        self.collect_unsplit(&mut out);
        out
    }

    fn collect_unsplit<'a>(&'a self, out: &mut Vec<&'a Operation>) {
        match self {
            Operation::Split(s) => {
                s.first.collect_unsplit(out);
                s.second.collect_unsplit(out);
            },
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::chunk::Chunk;

    #[test]
    fn test_noop_is_identity_under_transform() -> Result<()> {
        let ins = Operation::Insert(InsertOperation::new(3, Chunk::from_text(1, "x")));

        let t = ins.transform(&Operation::NoOp, None, None, ConcurrencyId::NoneNeeded)?;
        assert_eq!(t, ins);

        let t = Operation::NoOp.transform(&ins, None, None, ConcurrencyId::NoneNeeded)?;
        assert_eq!(t, Operation::NoOp);
        Ok(())
    }

    #[test]
    fn test_need_concurrency_id_only_for_equal_inserts() {
        let a = Operation::Insert(InsertOperation::new(4, Chunk::from_text(1, "X")));
        let b = Operation::Insert(InsertOperation::new(4, Chunk::from_text(2, "Y")));
        let c = Operation::Insert(InsertOperation::new(5, Chunk::from_text(2, "Y")));
        let d = Operation::Delete(DeleteOperation::from_len(4, 1));

        assert!(a.need_concurrency_id(&b));
        assert!(!a.need_concurrency_id(&c));
        assert!(!a.need_concurrency_id(&d));
        assert!(!d.need_concurrency_id(&a));
    }

    #[test]
    fn test_unsplit_flattens_in_order() {
        let a = Operation::Insert(InsertOperation::new(0, Chunk::from_text(1, "a")));
        let b = Operation::Insert(InsertOperation::new(1, Chunk::from_text(1, "b")));
        let c = Operation::Insert(InsertOperation::new(2, Chunk::from_text(1, "c")));
        let nested = Operation::split(Operation::split(a.clone(), b.clone()), c.clone());

        let flat = nested.unsplit();
        assert_eq!(flat, vec![&a, &b, &c]);
    }
}

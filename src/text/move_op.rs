// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::{
    error::TextError,
    operation::Operation,
    session::users::UserTable,
    text::buffer::TextBuffer,
};

/// Moves the issuing user's caret and selection.
///
/// Does not affect the buffer and is not reversible; move requests are
/// broadcast and transformed but never enter the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOperation {
    /// New caret position in characters.
    pub position: usize,
    /// Selected characters from the caret; negative selects towards the
    /// beginning.
    pub length: i64,
}

impl MoveOperation {
    pub fn new(position: usize, length: i64) -> Self {
        Self { position, length }
    }

    pub fn apply(
        &self,
        by: u32,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<(), TextError> {
        let buffer_len = buffer.len_chars() as i64;
        let bound = self.position as i64 + self.length;
        if self.position as i64 > buffer_len || bound < 0 || bound > buffer_len {
            return Err(TextError::InvalidMove {
                pos: self.position,
                len: self.length,
            });
        }

        if !users.set_selection(by, self.position, self.length) {
            // The user table rejects unknown ids; the session validates the
            // issuer before apply, so this is unreachable in practice.
            return Err(TextError::InvalidMove {
                pos: self.position,
                len: self.length,
            });
        }
        Ok(())
    }

    pub fn transform(&self, against: &Operation) -> Result<Operation> {
        let mut position = self.position;
        let mut length = self.length;

        match against {
            Operation::Insert(ins) => {
                transform_selection_insert(
                    ins.position,
                    ins.len(),
                    &mut position,
                    &mut length,
                    true,
                );
            },
            Operation::Delete(del) => {
                transform_selection_delete(del.position, del.len(), &mut position, &mut length);
            },
            _ => {},
        }

        Ok(Operation::Move(MoveOperation { position, length }))
    }
}

/// Shifts a caret/selection pair across an insertion of `insert_length`
/// characters at `insert_position`.
///
/// With `left_gravity`, a caret exactly at the insertion point stays where
/// it is; otherwise it is pushed right. A nonzero selection is never
/// enlarged by text inserted exactly at its bounds.
pub fn transform_selection_insert(
    insert_position: usize,
    insert_length: usize,
    move_position: &mut usize,
    move_length: &mut i64,
    left_gravity: bool,
) {
    let ins_pos = insert_position as i64;
    let ins_len = insert_length as i64;
    let mut cur_pos = *move_position as i64;
    let mut cur_bound = cur_pos + *move_length;

    if cur_pos == cur_bound {
        if ins_pos < cur_pos || (ins_pos == cur_pos && !left_gravity) {
            cur_pos += ins_len;
            cur_bound += ins_len;
        }
    } else if cur_bound > cur_pos {
        if ins_pos <= cur_pos {
            cur_pos += ins_len;
            cur_bound += ins_len;
        } else if ins_pos < cur_bound {
            cur_bound += ins_len;
        }
    } else {
        if ins_pos <= cur_bound {
            cur_pos += ins_len;
            cur_bound += ins_len;
        } else if ins_pos < cur_pos {
            cur_pos += ins_len;
        }
    }

    *move_position = cur_pos as usize;
    *move_length = cur_bound - cur_pos;
}

/// Shifts a caret/selection pair across a deletion of `delete_length`
/// characters starting at `delete_position`.
pub fn transform_selection_delete(
    delete_position: usize,
    delete_length: usize,
    move_position: &mut usize,
    move_length: &mut i64,
) {
    let dp = delete_position as i64;
    let dl = delete_length as i64;
    let cur_pos = *move_position as i64;
    let cur_len = *move_length;

    if cur_pos >= dp + dl {
        *move_position = (cur_pos - dl) as usize;
    } else if cur_pos > dp {
        *move_position = dp as usize;
    }

    if cur_len < 0 {
        if dp + dl <= cur_pos + cur_len {
            *move_length = cur_len;
        } else if dp >= cur_pos {
            *move_length = cur_len;
        } else if dp <= cur_pos + cur_len && dp + dl >= cur_pos {
            *move_length = 0;
        } else if dp <= cur_pos + cur_len && dp + dl > cur_pos + cur_len {
            *move_length = -(cur_pos - (dp + dl));
        } else if dp > cur_pos + cur_len && dp + dl > cur_pos {
            *move_length = dp - (cur_pos + cur_len);
        } else {
            // dp > cur_pos + cur_len && dp + dl <= cur_pos
            *move_length = cur_len + dl;
        }
    } else {
        if dp + dl <= cur_pos {
            *move_length = cur_len;
        } else if dp >= cur_pos + cur_len {
            *move_length = cur_len;
        } else if dp <= cur_pos && dp + dl >= cur_pos + cur_len {
            *move_length = 0;
        } else if dp <= cur_pos && dp + dl > cur_pos {
            *move_length = cur_pos + cur_len - (dp + dl);
        } else if dp > cur_pos && dp + dl > cur_pos + cur_len {
            *move_length = cur_pos - dp;
        } else {
            // dp > cur_pos && dp + dl <= cur_pos + cur_len
            *move_length = cur_len - dl;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_insert(pos: usize, len: i64, at: usize, n: usize) -> (usize, i64) {
        let mut p = pos;
        let mut l = len;
        transform_selection_insert(at, n, &mut p, &mut l, true);
        (p, l)
    }

    fn apply_delete(pos: usize, len: i64, at: usize, n: usize) -> (usize, i64) {
        let mut p = pos;
        let mut l = len;
        transform_selection_delete(at, n, &mut p, &mut l);
        (p, l)
    }

    #[test]
    fn test_caret_left_gravity_at_insert_point() {
        // Plain caret exactly at the insertion point keeps its spot.
        assert_eq!(apply_insert(5, 0, 5, 3), (5, 0));
        // Insert strictly before pushes it right.
        assert_eq!(apply_insert(5, 0, 4, 3), (8, 0));
        // Insert after leaves it alone.
        assert_eq!(apply_insert(5, 0, 6, 3), (5, 0));
    }

    #[test]
    fn test_selection_not_enlarged_at_bounds() {
        // Forward selection [5, 8): insert exactly at the end stays outside.
        assert_eq!(apply_insert(5, 3, 8, 2), (5, 3));
        // Insert strictly inside grows the selection.
        assert_eq!(apply_insert(5, 3, 6, 2), (5, 5));
        // Insert at the start shifts the whole selection.
        assert_eq!(apply_insert(5, 3, 5, 2), (7, 3));
    }

    #[test]
    fn test_backward_selection_insert() {
        // Caret 8 selecting back to 5: insert at 5 shifts both.
        assert_eq!(apply_insert(8, -3, 5, 2), (10, -3));
        // Insert strictly inside widens towards the beginning.
        assert_eq!(apply_insert(8, -3, 6, 2), (10, -5));
        // Insert at the caret itself stays outside.
        assert_eq!(apply_insert(8, -3, 8, 2), (8, -3));
    }

    #[test]
    fn test_delete_around_caret() {
        // Delete entirely before: shift left.
        assert_eq!(apply_delete(6, 0, 1, 2), (4, 0));
        // Caret inside the deleted range collapses to its start.
        assert_eq!(apply_delete(6, 0, 4, 5), (4, 0));
        // Caret exactly at the end of the deleted range shifts left.
        assert_eq!(apply_delete(6, 0, 2, 4), (2, 0));
    }

    #[test]
    fn test_delete_overlapping_selection() {
        // Forward selection [4, 9); delete [6, 8) shrinks it by two.
        assert_eq!(apply_delete(4, 5, 6, 2), (4, 3));
        // Delete covering the whole selection empties it.
        assert_eq!(apply_delete(4, 5, 3, 8), (3, 0));
        // Delete overlapping the head: start collapses to delete start.
        assert_eq!(apply_delete(4, 5, 2, 4), (2, 3));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Result, bail, ensure};

use crate::{
    algorithm::request::{Request, RequestKind},
    operation::Operation,
};

/// One executed request.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The request as issued; for initially irreversible operations the
    /// operation is replaced by its reversible twin at apply time.
    pub request: Request,
    /// The transformed form that was applied to the buffer.
    pub executed: Operation,
    /// For undo/redo entries: coordinates of the entry this one acts on.
    pub associated: Option<(u32, u32)>,
}

#[derive(Debug, Default)]
struct UserLog {
    /// Sequence number of the first retained entry (grows with pruning).
    start: u32,
    entries: VecDeque<LogEntry>,
    /// Sequence numbers of do/redo entries that the next undo would target,
    /// most recent last.
    undo_stack: Vec<u32>,
    /// Sequence numbers of undo entries that the next redo would target.
    redo_stack: Vec<u32>,
}

impl UserLog {
    fn count(&self) -> u32 {
        self.start + self.entries.len() as u32
    }

    fn get(&self, seq: u32) -> Option<&LogEntry> {
        if seq < self.start {
            return None;
        }
        self.entries.get((seq - self.start) as usize)
    }
}

/// The ordered record of every buffer-affecting request executed in a
/// session, indexed by `(user, sequence number)`.
#[derive(Debug, Default)]
pub struct RequestLog {
    users: BTreeMap<u32, UserLog>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries ever logged for `user` (pruned ones included).
    pub fn count(&self, user: u32) -> u32 {
        self.users.get(&user).map(|l| l.count()).unwrap_or(0)
    }

    /// Sequence number of the earliest retained entry for `user`.
    pub fn start(&self, user: u32) -> u32 {
        self.users.get(&user).map(|l| l.start).unwrap_or(0)
    }

    pub fn get(&self, user: u32, seq: u32) -> Option<&LogEntry> {
        self.users.get(&user).and_then(|l| l.get(seq))
    }

    /// Users with at least one logged entry, ascending.
    pub fn user_ids(&self) -> Vec<u32> {
        self.users.keys().copied().collect()
    }

    /// The entry the next undo by `user` would target.
    pub fn next_undo(&self, user: u32) -> Option<(u32, u32)> {
        self.users
            .get(&user)
            .and_then(|l| l.undo_stack.last().map(|seq| (user, *seq)))
    }

    /// The undo entry the next redo by `user` would target.
    pub fn next_redo(&self, user: u32) -> Option<(u32, u32)> {
        self.users
            .get(&user)
            .and_then(|l| l.redo_stack.last().map(|seq| (user, *seq)))
    }

    /// Appends an executed request, returning its sequence number and the
    /// associated entry for undo/redo requests.
    ///
    /// The request's own vector component must equal the current count for
    /// its user; anything else is an out-of-sequence protocol violation.
    pub fn add(
        &mut self,
        request: Request,
        executed: Operation,
    ) -> Result<(u32, Option<(u32, u32)>)> {
        let user = request.user;
        let log = self.users.entry(user).or_default();
        let seq = log.count();
        ensure!(
            request.vector.get(user) == seq,
            "request out of sequence for user {user}: vector says {}, log has {seq}",
            request.vector.get(user)
        );

        let associated = match &request.kind {
            RequestKind::Do(_) => {
                log.undo_stack.push(seq);
                log.redo_stack.clear();
                None
            },
            RequestKind::Undo => {
                let Some(target) = log.undo_stack.pop() else {
                    bail!("undo by user {user} with nothing left to undo");
                };
                log.redo_stack.push(seq);
                Some((user, target))
            },
            RequestKind::Redo => {
                let Some(target) = log.redo_stack.pop() else {
                    bail!("redo by user {user} with nothing left to redo");
                };
                // Undoing a redo reverts the redo itself.
                log.undo_stack.push(seq);
                Some((user, target))
            },
        };

        log.entries.push_back(LogEntry {
            request,
            executed,
            associated,
        });
        Ok((seq, associated))
    }

    /// Prepares `user`'s log for entries restored from a synchronization,
    /// starting at sequence number `start` (entries below it were pruned by
    /// the publisher).
    pub fn restore_user(&mut self, user: u32, start: u32) {
        let log = self.users.entry(user).or_default();
        debug_assert!(log.entries.is_empty(), "restore into a used log");
        log.start = start;
    }

    /// Releases entries of `user` below `up_to`, keeping anything still
    /// referenced by undo/redo stacks or by associated links of retained
    /// entries.
    pub fn prune(&mut self, user: u32, up_to: u32) -> u32 {
        let Some(log) = self.users.get_mut(&user) else {
            return 0;
        };

        let mut floor = up_to.min(log.count());
        for seq in log.undo_stack.iter().chain(log.redo_stack.iter()) {
            floor = floor.min(*seq);
        }
        // Associated links always point backwards within one user's log.
        let mut changed = true;
        while changed {
            changed = false;
            for entry in &log.entries {
                let seq = entry.request.vector.get(user);
                if seq >= floor
                    && let Some((_, target)) = entry.associated
                    && target < floor
                {
                    floor = target;
                    changed = true;
                }
            }
        }

        let mut released = 0;
        while log.start < floor {
            log.entries.pop_front();
            log.start += 1;
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithm::state_vector::StateVector,
        text::{chunk::Chunk, insert::InsertOperation},
    };

    fn do_req(user: u32, seq: u32, pos: usize) -> Request {
        let mut vector = StateVector::new();
        vector.set(user, seq);
        Request::new(
            user,
            vector,
            RequestKind::Do(Operation::Insert(InsertOperation::new(
                pos,
                Chunk::from_text(user, "x"),
            ))),
        )
    }

    fn meta_req(user: u32, seq: u32, kind: RequestKind) -> Request {
        let mut vector = StateVector::new();
        vector.set(user, seq);
        Request::new(user, vector, kind)
    }

    #[test]
    fn test_sequence_enforced() {
        let mut log = RequestLog::new();
        log.add(do_req(1, 0, 0), Operation::NoOp).expect("seq 0");
        assert!(log.add(do_req(1, 2, 0), Operation::NoOp).is_err());
        assert_eq!(log.count(1), 1);
    }

    #[test]
    fn test_undo_redo_chain() -> Result<()> {
        let mut log = RequestLog::new();
        log.add(do_req(1, 0, 0), Operation::NoOp)?;
        log.add(do_req(1, 1, 1), Operation::NoOp)?;
        assert_eq!(log.next_undo(1), Some((1, 1)));

        let (seq, assoc) = log.add(meta_req(1, 2, RequestKind::Undo), Operation::NoOp)?;
        assert_eq!((seq, assoc), (2, Some((1, 1))));
        assert_eq!(log.next_undo(1), Some((1, 0)));
        assert_eq!(log.next_redo(1), Some((1, 2)));

        let (seq, assoc) = log.add(meta_req(1, 3, RequestKind::Redo), Operation::NoOp)?;
        assert_eq!((seq, assoc), (3, Some((1, 2))));
        // Undoing again targets the redo entry itself.
        assert_eq!(log.next_undo(1), Some((1, 3)));
        assert_eq!(log.next_redo(1), None);

        // A fresh do clears the redo chain.
        log.add(meta_req(1, 4, RequestKind::Undo), Operation::NoOp)?;
        assert_eq!(log.next_redo(1), Some((1, 4)));
        log.add(do_req(1, 5, 0), Operation::NoOp)?;
        assert_eq!(log.next_redo(1), None);
        Ok(())
    }

    #[test]
    fn test_prune_keeps_undo_targets() -> Result<()> {
        let mut log = RequestLog::new();
        log.add(do_req(1, 0, 0), Operation::NoOp)?;
        log.add(do_req(1, 1, 1), Operation::NoOp)?;
        log.add(meta_req(1, 2, RequestKind::Undo), Operation::NoOp)?;

        // Entry 1 is the undo target of entry 2; entry 0 sits on the undo
        // stack. Nothing below 2 may actually go.
        let released = log.prune(1, 3);
        assert_eq!(released, 0);
        assert_eq!(log.start(1), 0);
        Ok(())
    }
}

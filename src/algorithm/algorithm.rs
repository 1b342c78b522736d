// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, ensure};
use tracing::{debug, trace};

use crate::{
    algorithm::{
        request::{Request, RequestKind},
        request_log::RequestLog,
        state_vector::StateVector,
    },
    operation::{ConcurrencyId, Operation},
    session::users::UserTable,
    text::buffer::TextBuffer,
};

/// What a translation works on: either a not-yet-logged incoming request or
/// an entry already in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TranslationTarget {
    Pending,
    Logged { user: u32, seq: u32 },
}

/// The adOPTed concurrency control engine.
///
/// Ties together the request log, the local state vector and the operation
/// algebra. The session owns the buffer and user table and lends them to
/// every call; the algorithm holds no buffer state of its own.
#[derive(Debug, Default)]
pub struct Algorithm {
    current: StateVector,
    log: RequestLog,
    /// Last vector received from each remote user, for log pruning.
    user_vectors: HashMap<u32, StateVector>,
}

impl Algorithm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_vector(&self) -> &StateVector {
        &self.current
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    /// Whether `user` has anything left to undo / redo.
    pub fn can_undo(&self, user: u32) -> bool {
        self.log.next_undo(user).is_some()
    }

    pub fn can_redo(&self, user: u32) -> bool {
        self.log.next_redo(user).is_some()
    }

    /// Rebuilds algorithm state from a synchronization: per-user log
    /// offsets, the retained entries in execution order, and the resulting
    /// vector (one component per user: offset plus restored entries).
    pub fn restore(
        &mut self,
        offsets: &[(u32, u32)],
        entries: Vec<Request>,
    ) -> Result<()> {
        for (user, start) in offsets {
            self.log.restore_user(*user, *start);
            self.current.set(*user, *start);
        }
        for request in entries {
            let user = request.user;
            self.log.add(request, Operation::NoOp)?;
            self.current.add(user, 1);
        }
        Ok(())
    }

    /// Executes a locally issued request: applies it to the buffer, records
    /// it, advances the local vector and returns the request to broadcast
    /// (tagged with the pre-execution vector).
    pub fn execute_request(
        &mut self,
        user: u32,
        kind: RequestKind,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<Request> {
        ensure!(users.contains(user), "unknown local user {user}");
        let request = Request::new(user, self.current.clone(), kind);
        self.process(request.clone(), buffer, users)?;
        Ok(request)
    }

    /// Processes a request received from a peer.
    pub fn receive_request(
        &mut self,
        request: Request,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<()> {
        ensure!(
            users.contains(request.user),
            "request from unknown user {}",
            request.user
        );

        // Remember how far this user has seen, for pruning.
        let entry = self
            .user_vectors
            .entry(request.user)
            .or_insert_with(StateVector::new);
        for (u, n) in request.vector.iter() {
            if entry.get(u) < n {
                entry.set(u, n);
            }
        }

        self.process(request, buffer, users)
    }

    fn process(
        &mut self,
        request: Request,
        buffer: &mut dyn TextBuffer,
        users: &UserTable,
    ) -> Result<()> {
        let user = request.user;

        // Whether the request occupies a log slot; undo and redo always do
        // (only buffer-affecting requests are ever logged, so their targets
        // affect the buffer too).
        let affects = match &request.kind {
            RequestKind::Do(op) => op.affects_buffer(),
            RequestKind::Undo => {
                let (_, target) = self
                    .log
                    .next_undo(user)
                    .ok_or_else(|| anyhow!("user {user} has nothing to undo"))?;
                trace!(user, target, "undo resolves to log entry");
                true
            },
            RequestKind::Redo => {
                self.log
                    .next_redo(user)
                    .ok_or_else(|| anyhow!("user {user} has nothing to redo"))?;
                true
            },
        };

        if affects {
            let expected = self.log.count(user);
            let got = request.vector.get(user);
            ensure!(
                got == expected,
                "request out of sequence for user {user}: got {got}, expected {expected}"
            );
        }

        // Translate into the current frame.
        let mut cache = HashMap::new();
        let translated = self.translate(
            TranslationTarget::Pending,
            user,
            &request.vector,
            &request.kind,
            request.operation(),
            &self.current,
            &mut cache,
        )?;
        debug!(user, vector = %request.vector, "translated request");

        // Apply, completing irreversible operations into their reversible
        // twins; the twin is what enters the log.
        let logged_op = match &request.kind {
            RequestKind::Do(op) => {
                let twin = op
                    .apply_transformed(&translated, user, buffer, users)
                    .map_err(|e| anyhow!(e).context("failed to apply request"))?;
                Some(twin)
            },
            RequestKind::Undo | RequestKind::Redo => {
                translated
                    .apply(user, buffer, users)
                    .map_err(|e| anyhow!(e).context("failed to apply undo/redo"))?;
                None
            },
        };

        if affects {
            let recorded = match logged_op {
                Some(twin) => {
                    Request::new(user, request.vector.clone(), RequestKind::Do(twin))
                },
                None => request,
            };
            self.log.add(recorded, translated)?;
            self.current.add(user, 1);
        }
        Ok(())
    }

    /// Recursive adOPTed translation of a request into the frame `to`.
    ///
    /// Chooses a user `v` whose latest entry below `to` is concurrent with
    /// the request, reduces the target along `v`'s axis, translates both
    /// there and transforms one against the other. Memoized per top-level
    /// call; cost is bounded by the log depth between the two vectors.
    #[allow(clippy::too_many_arguments)]
    fn translate(
        &self,
        target: TranslationTarget,
        user: u32,
        vector: &StateVector,
        kind: &RequestKind,
        op: Option<&Operation>,
        to: &StateVector,
        cache: &mut HashMap<(TranslationTarget, String), Operation>,
    ) -> Result<Operation> {
        let key = (target, to.encode());
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }

        let result = match kind {
            RequestKind::Undo | RequestKind::Redo => {
                let (au, aseq) = self
                    .associated_of(target, user, kind)?
                    .context("undo/redo without an associated entry")?;
                let entry = self
                    .log
                    .get(au, aseq)
                    .with_context(|| format!("associated entry ({au}, {aseq}) pruned"))?;

                // Translate the associated request to the target frame with
                // its own effect excluded, then revert.
                let mut assoc_to = to.clone();
                assoc_to.set(au, aseq);
                let translated = self.translate(
                    TranslationTarget::Logged { user: au, seq: aseq },
                    entry.request.user,
                    &entry.request.vector,
                    &entry.request.kind,
                    entry.request.operation(),
                    &assoc_to,
                    cache,
                )?;
                translated
                    .revert()
                    .context("associated operation is not reversible")?
            },
            RequestKind::Do(_) => {
                let op = op.context("do request without operation")?;
                if vector == to {
                    op.clone()
                } else {
                    let (v, entry_seq) = self
                        .pick_reduction_axis(user, vector, to)
                        .context("no valid translation path; request log inconsistent")?;
                    let reduced = to.minus_one(v);

                    let entry = self
                        .log
                        .get(v, entry_seq)
                        .with_context(|| format!("log entry ({v}, {entry_seq}) pruned"))?;

                    let op_self = self.translate(
                        target, user, vector, kind, Some(op), &reduced, cache,
                    )?;
                    let op_entry = self.translate(
                        TranslationTarget::Logged { user: v, seq: entry_seq },
                        entry.request.user,
                        &entry.request.vector,
                        &entry.request.kind,
                        entry.request.operation(),
                        &reduced,
                        cache,
                    )?;

                    let cid = if op_self.need_concurrency_id(&op_entry) {
                        // Lower user id wins the tiebreak.
                        if user < v {
                            ConcurrencyId::SelfWins
                        } else {
                            ConcurrencyId::OtherWins
                        }
                    } else {
                        ConcurrencyId::NoneNeeded
                    };

                    op_self.transform(&op_entry, None, None, cid)?
                }
            },
        };

        cache.insert(key, result.clone());
        Ok(result)
    }

    /// The associated entry of an undo/redo, whether pending (resolved via
    /// the live stacks) or already logged.
    fn associated_of(
        &self,
        target: TranslationTarget,
        user: u32,
        kind: &RequestKind,
    ) -> Result<Option<(u32, u32)>> {
        match target {
            TranslationTarget::Pending => Ok(match kind {
                RequestKind::Undo => self.log.next_undo(user),
                RequestKind::Redo => self.log.next_redo(user),
                RequestKind::Do(_) => None,
            }),
            TranslationTarget::Logged { user, seq } => {
                let entry = self
                    .log
                    .get(user, seq)
                    .with_context(|| format!("log entry ({user}, {seq}) pruned"))?;
                Ok(entry.associated)
            },
        }
    }

    /// Finds a user `v ≠ user` with `to[v] > vector[v]` whose entry at
    /// `to[v] − 1` can itself be translated into `to − v`.
    fn pick_reduction_axis(
        &self,
        user: u32,
        vector: &StateVector,
        to: &StateVector,
    ) -> Option<(u32, u32)> {
        for v in self.log.user_ids() {
            if v == user || to.get(v) <= vector.get(v) {
                continue;
            }
            let seq = to.get(v) - 1;
            let Some(entry) = self.log.get(v, seq) else {
                continue;
            };
            let reduced = to.minus_one(v);
            if entry.request.vector.causes(&reduced) {
                return Some((v, seq));
            }
        }
        None
    }

    /// Releases log entries every live peer has advanced past. Entries
    /// serving as undo targets are kept until their latest undoer goes too.
    pub fn cleanup(&mut self) -> u32 {
        let mut released = 0;
        for user in self.log.user_ids() {
            let mut floor = self.current.get(user);
            for vector in self.user_vectors.values() {
                floor = floor.min(vector.get(user));
            }
            released += self.log.prune(user, floor);
        }
        if released > 0 {
            debug!(released, "pruned request log");
        }
        released
    }

    /// Drops the recorded vector of a departed peer so it no longer pins
    /// the log floor.
    pub fn forget_peer(&mut self, user: u32) {
        self.user_vectors.remove(&user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::users::User,
        text::{
            buffer::DefaultTextBuffer,
            chunk::Chunk,
            delete::DeleteOperation,
            insert::InsertOperation,
        },
    };

    /// One editing site: algorithm + buffer + users.
    struct Site {
        algorithm: Algorithm,
        buffer: DefaultTextBuffer,
        users: UserTable,
    }

    impl Site {
        fn new(initial: &str) -> Self {
            let users = UserTable::new();
            users.add(User::new(1, "one")).expect("user 1");
            users.add(User::new(2, "two")).expect("user 2");
            let mut buffer = DefaultTextBuffer::new();
            if !initial.is_empty() {
                buffer
                    .insert_chunk(0, &Chunk::from_text(1, initial), 1)
                    .expect("seed buffer");
            }
            Self {
                algorithm: Algorithm::new(),
                buffer,
                users,
            }
        }

        fn execute(&mut self, user: u32, kind: RequestKind) -> Request {
            self.algorithm
                .execute_request(user, kind, &mut self.buffer, &self.users)
                .expect("local execute")
        }

        fn receive(&mut self, request: Request) {
            self.algorithm
                .receive_request(request, &mut self.buffer, &self.users)
                .expect("remote receive")
        }

        fn text(&self) -> String {
            self.buffer.content().to_plain_text()
        }
    }

    fn ins(pos: usize, author: u32, text: &str) -> RequestKind {
        RequestKind::Do(Operation::Insert(InsertOperation::new(
            pos,
            Chunk::from_text(author, text),
        )))
    }

    fn del(pos: usize, len: usize) -> RequestKind {
        RequestKind::Do(Operation::Delete(DeleteOperation::from_len(pos, len)))
    }

    #[test]
    fn test_concurrent_inserts_same_position_converge() {
        // Scenario: both users insert at position 4; the lower id wins the
        // left spot and both sites converge on "abcdXYefghij…".
        let mut site1 = Site::new("abcdefghijklmnopqrstuvwxyz");
        let mut site2 = Site::new("abcdefghijklmnopqrstuvwxyz");

        let r1 = site1.execute(1, ins(4, 1, "X"));
        let r2 = site2.execute(2, ins(4, 2, "Y"));

        site1.receive(r2);
        site2.receive(r1);

        assert_eq!(site1.text(), "abcdXYefghijklmnopqrstuvwxyz");
        assert_eq!(site2.text(), site1.text());
    }

    #[test]
    fn test_delete_across_concurrent_insert() {
        // User 1 deletes "cdefg" while user 2 inserts "XY" at 4.
        let mut site1 = Site::new("abcdefghij");
        let mut site2 = Site::new("abcdefghij");

        let r1 = site1.execute(1, del(2, 5));
        let r2 = site2.execute(2, ins(4, 2, "XY"));

        site1.receive(r2);
        site2.receive(r1);

        assert_eq!(site1.text(), "abXYhij");
        assert_eq!(site2.text(), site1.text());
    }

    #[test]
    fn test_undo_of_overlapped_delete() {
        // User 1 deletes ", world" while user 2 inserts "brave "; undoing
        // the delete afterwards must restore the full sentence on both
        // sites.
        let mut site1 = Site::new("Hello, world!");
        let mut site2 = Site::new("Hello, world!");

        let r1 = site1.execute(1, del(5, 7));
        assert_eq!(site1.text(), "Hello!");
        let r2 = site2.execute(2, ins(7, 2, "brave "));

        site1.receive(r2);
        site2.receive(r1);
        assert_eq!(site1.text(), "Hellobrave !");
        assert_eq!(site2.text(), site1.text());

        let undo = site1.execute(1, RequestKind::Undo);
        assert_eq!(site1.text(), "Hello, brave world!");

        site2.receive(undo);
        assert_eq!(site2.text(), "Hello, brave world!");
    }

    #[test]
    fn test_symmetric_pairs_converge() {
        // A small grid of concurrent insert/delete pairs at interesting
        // offsets: both application orders agree.
        let text = "abcdefghij";
        let ops1 = [ins(0, 1, "P"), ins(4, 1, "QQ"), del(1, 3), del(4, 4)];
        let ops2 = [ins(0, 2, "r"), ins(4, 2, "ss"), del(0, 2), del(3, 5)];

        for k1 in &ops1 {
            for k2 in &ops2 {
                let mut site1 = Site::new(text);
                let mut site2 = Site::new(text);

                let r1 = site1.execute(1, k1.clone());
                let r2 = site2.execute(2, k2.clone());
                site1.receive(r2);
                site2.receive(r1);

                assert_eq!(site1.text(), site2.text(), "pair {k1:?} / {k2:?}");
            }
        }
    }

    #[test]
    fn test_vector_counts_match_log() {
        // State-vector monotonicity: every component equals the log count
        // of that author.
        let mut site1 = Site::new("abc");
        let mut site2 = Site::new("abc");

        let r1 = site1.execute(1, ins(0, 1, "x"));
        let r2 = site2.execute(2, ins(3, 2, "y"));
        site1.receive(r2);
        site2.receive(r1);
        let r3 = site1.execute(1, del(0, 2));
        site2.receive(r3);

        for site in [&site1, &site2] {
            for user in [1, 2] {
                assert_eq!(
                    site.algorithm.current_vector().get(user),
                    site.algorithm.log().count(user)
                );
            }
        }
    }

    #[test]
    fn test_out_of_sequence_is_rejected() {
        let mut site1 = Site::new("abc");
        let mut site2 = Site::new("abc");

        let _r1 = site2.execute(2, ins(0, 2, "x"));
        let r2 = site2.execute(2, ins(0, 2, "y"));

        // Delivering the second request without the first must fail.
        let err = site1
            .algorithm
            .receive_request(r2, &mut site1.buffer, &site1.users)
            .expect_err("gap must be detected");
        assert!(err.to_string().contains("out of sequence"));
    }

    #[test]
    fn test_cleanup_releases_acknowledged_entries() {
        let mut site1 = Site::new("abc");
        let mut site2 = Site::new("abc");

        let r1 = site1.execute(1, ins(0, 1, "x"));
        site2.receive(r1);
        // Site 2 answers with a request whose vector acknowledges r1.
        let r2 = site2.execute(2, ins(0, 2, "y"));
        site1.receive(r2);

        // Entry (1, 0) is acknowledged by user 2 but still sits on user 1's
        // undo stack, so it must survive.
        assert_eq!(site1.algorithm.cleanup(), 0);
        assert!(site1.algorithm.log().get(1, 0).is_some());
    }
}

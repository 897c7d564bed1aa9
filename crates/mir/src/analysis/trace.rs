//! Race tracing: attributing failed requires to the sends that caused them.
//!
//! The diagnosis replay discovers *that* a value was observed while its
//! region was consumed; this module walks the CFG backwards to find the
//! `Consume` ops responsible, ranked by a merge-distance heuristic so the
//! most direct sends surface first in diagnostics.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashMap;

use crate::ir::BlockId;

use super::partition::{PartitionOp, TrackedValueId};
use super::sendck::BlockState;

/// Why a value is consumed at some point of a block, judged without looking
/// across blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalConsumedReason {
    /// A `Consume` op in this block.
    ConsumeInst(PartitionOp),
    /// A merge or assignment in this block pulled the value into an
    /// already-consumed region. The consume behind that region is found when
    /// its own site is attributed, so it needs no work here.
    NonConsumeInst,
    /// Consumed on entry, by some predecessor.
    NonLocal,
}

/// Everything known about why a region was consumed: a multimap from
/// merge-distance to the `Consume` ops at that distance. Distance counts the
/// single-step joins needed before the consume affects the traced value, and
/// composes by addition across recursion into predecessors.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConsumedReason {
    consume_ops: BTreeMap<u32, Vec<PartitionOp>>,
}

impl ConsumedReason {
    fn contains_op(&self, op: &PartitionOp) -> bool {
        self.consume_ops.values().any(|ops| ops.contains(op))
    }

    /// Record a consume at the given distance. A consume already recorded
    /// (reachable through several merge paths) keeps its first distance.
    fn add_consume_op(&mut self, op: PartitionOp, distance: u32) {
        debug_assert!(op.is_consume());
        if self.contains_op(&op) {
            return;
        }
        self.consume_ops.entry(distance).or_default().push(op);
    }

    fn add_other_at_distance(&mut self, other: &ConsumedReason, distance: u32) {
        for (&other_distance, ops) in &other.consume_ops {
            for &op in ops {
                self.add_consume_op(op, distance + other_distance);
            }
        }
    }
}

/// The inverse of [`ConsumedReason`]: consume sites mapped to the requires
/// that observe them, ordered by distance so the most direct accesses are
/// reported first.
#[derive(Debug, Default)]
pub(crate) struct ConsumeRequireAccumulator {
    requirements: BTreeMap<PartitionOp, BTreeSet<(u32, PartitionOp)>>,
}

impl ConsumeRequireAccumulator {
    fn accumulate(&mut self, require_op: PartitionOp, reason: &ConsumedReason) {
        for (&distance, ops) in &reason.consume_ops {
            for &consume_op in ops {
                self.requirements
                    .entry(consume_op)
                    .or_default()
                    .insert((distance, require_op));
            }
        }
    }

    /// For each consume site, report it along with up to `limit` of its
    /// requires (closest first); the rest are only counted.
    pub(crate) fn for_each_consume_require(
        &self,
        limit: usize,
        on_consume: &mut dyn FnMut(&PartitionOp, usize, usize),
        on_require: &mut dyn FnMut(&PartitionOp),
    ) {
        for (consume_op, requires) in &self.requirements {
            let shown = requires.len().min(limit);
            on_consume(consume_op, shown, requires.len() - shown);
            for (_, require_op) in requires.iter().take(limit) {
                on_require(require_op);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn requirements(
        &self,
    ) -> impl Iterator<Item = (&PartitionOp, &BTreeSet<(u32, PartitionOp)>)> {
        self.requirements.iter()
    }
}

/// Accumulates the require-of-consumed failures found by the diagnosis
/// replay and traces each back to its candidate `Consume` ops.
pub(crate) struct RaceTracer<'a> {
    states: &'a [BlockState],
    preds: &'a [Vec<BlockId>],
    /// Memoized reasons a value is consumed at block entry. A sentinel empty
    /// reason is inserted before recursing, which terminates the search on
    /// CFG cycles.
    consumed_at_entry: FxHashMap<(BlockId, TrackedValueId), ConsumedReason>,
    /// Memoized local reasons a value is consumed at block exit.
    consumed_at_exit: FxHashMap<(BlockId, TrackedValueId), LocalConsumedReason>,
    accumulator: ConsumeRequireAccumulator,
}

impl<'a> RaceTracer<'a> {
    pub(crate) fn new(states: &'a [BlockState], preds: &'a [Vec<BlockId>]) -> Self {
        Self {
            states,
            preds,
            consumed_at_entry: FxHashMap::default(),
            consumed_at_exit: FxHashMap::default(),
            accumulator: ConsumeRequireAccumulator::default(),
        }
    }

    pub(crate) fn trace_use_of_consumed_value(
        &mut self,
        use_op: &PartitionOp,
        consumed: TrackedValueId,
    ) {
        let reason = self.find_consumed_at_op_reason(consumed, use_op);
        self.accumulator.accumulate(*use_op, &reason);
    }

    pub(crate) fn into_accumulator(self) -> ConsumeRequireAccumulator {
        self.accumulator
    }

    fn state(&self, block: BlockId) -> &'a BlockState {
        &self.states[block.index()]
    }

    fn find_consumed_at_op_reason(
        &mut self,
        consumed: TrackedValueId,
        op: &PartitionOp,
    ) -> ConsumedReason {
        let mut reason = ConsumedReason::default();
        self.find_and_add_consumed_reasons(op.source().block, consumed, &mut reason, 0, Some(op));
        reason
    }

    fn find_and_add_consumed_reasons(
        &mut self,
        block: BlockId,
        consumed: TrackedValueId,
        reason: &mut ConsumedReason,
        distance: u32,
        target_op: Option<&PartitionOp>,
    ) {
        match self.find_local_consumed_reason(block, consumed, target_op) {
            LocalConsumedReason::ConsumeInst(op) => reason.add_consume_op(op, distance),
            LocalConsumedReason::NonConsumeInst => {}
            LocalConsumedReason::NonLocal => {
                let entry_reason = self.find_consumed_at_entry_reason(block, consumed);
                reason.add_other_at_distance(&entry_reason, distance);
            }
        }
    }

    /// Why is `consumed` already consumed when `block` is entered? Some
    /// predecessor consumed it directly, or consumed a value that the join at
    /// this block's entry merges with it. The BFS below measures how many
    /// single-step joins separate each such value from the traced one.
    fn find_consumed_at_entry_reason(
        &mut self,
        block: BlockId,
        consumed: TrackedValueId,
    ) -> ConsumedReason {
        debug_assert!(self.state(block).entry.is_consumed(consumed));

        if let Some(reason) = self.consumed_at_entry.get(&(block, consumed)) {
            return reason.clone();
        }
        // Sentinel before any recursion, so cyclic CFGs terminate.
        self.consumed_at_entry
            .insert((block, consumed), ConsumedReason::default());

        let entry = &self.state(block).entry;

        // Values tracked at entry that some predecessor's exit consumed.
        let mut consumed_in_some_pred: BTreeMap<TrackedValueId, Vec<BlockId>> = BTreeMap::new();
        for &pred in &self.preds[block.index()] {
            for value in self.state(pred).exit.consumed_values() {
                if entry.is_tracked(value) {
                    consumed_in_some_pred.entry(value).or_default().push(pred);
                }
            }
        }

        // Pairs that the entry join merges because they share a region in
        // some predecessor's exit. Deliberately not transitively closed: the
        // BFS counts the steps transitive merges take.
        let mut single_step_joins: BTreeMap<TrackedValueId, BTreeSet<TrackedValueId>> =
            BTreeMap::new();
        for &pred in &self.preds[block.index()] {
            for region in self.state(pred).exit.non_consumed_regions() {
                for &fst in &region {
                    for &snd in &region {
                        if fst != snd && entry.is_tracked(fst) && entry.is_tracked(snd) {
                            single_step_joins.entry(fst).or_default().insert(snd);
                        }
                    }
                }
            }
        }

        let mut distances: BTreeMap<TrackedValueId, u32> = BTreeMap::new();
        let mut queue: VecDeque<(TrackedValueId, u32)> = VecDeque::from([(consumed, 0)]);
        while let Some((current, distance)) = queue.pop_front() {
            if distances.contains_key(&current) {
                continue;
            }
            distances.insert(current, distance);
            if let Some(nexts) = single_step_joins.get(&current) {
                for &next in nexts {
                    if !distances.contains_key(&next) {
                        queue.push_back((next, distance + 1));
                    }
                }
            }
        }

        let mut reason = ConsumedReason::default();
        for (&value, &distance) in &distances {
            let Some(pred_blocks) = consumed_in_some_pred.get(&value) else {
                continue;
            };
            for &pred in pred_blocks {
                self.find_and_add_consumed_reasons(pred, value, &mut reason, distance, None);
            }
        }

        self.consumed_at_entry
            .insert((block, consumed), reason.clone());
        reason
    }

    /// Find the last op of `block` (up to `target_op`, exclusive) that leaves
    /// `consumed` consumed. A value consumed at entry is revived first so
    /// the search finds a *local* reason when one exists.
    fn find_local_consumed_reason(
        &mut self,
        block: BlockId,
        consumed: TrackedValueId,
        target_op: Option<&PartitionOp>,
    ) -> LocalConsumedReason {
        // Block-exit queries are memoized; queries bounded by an op are not.
        if target_op.is_none()
            && let Some(&reason) = self.consumed_at_exit.get(&(block, consumed))
        {
            return reason;
        }

        let state = self.state(block);
        debug_assert!(target_op.is_some() || state.exit.is_consumed(consumed));

        let mut reason: Option<LocalConsumedReason> = None;
        let mut working = state.entry.clone();
        if working.is_consumed(consumed) {
            working.assign_fresh(consumed);
        }

        state.for_each_op(|op| {
            if let Some(target) = target_op
                && target == op
            {
                return false;
            }
            working.apply(op);
            if working.is_consumed(consumed) && reason.is_none() {
                reason = Some(if op.is_consume() {
                    LocalConsumedReason::ConsumeInst(*op)
                } else {
                    LocalConsumedReason::NonConsumeInst
                });
            }
            if !working.is_consumed(consumed) && reason.is_some() {
                // Reassigned into a live region; earlier candidates are moot.
                reason = None;
            }
            true
        });

        if reason.is_none() && state.entry.is_consumed(consumed) {
            reason = Some(LocalConsumedReason::NonLocal);
        }

        let reason = reason.expect("queried value is not consumed in this block");
        if target_op.is_none() {
            self.consumed_at_exit.insert((block, consumed), reason);
        }
        reason
    }
}

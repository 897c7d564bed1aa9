//! The region partition semilattice.
//!
//! A [`Partition`] is an equivalence relation over tracked value ids plus a
//! "consumed" marker per equivalence class (region). The send-checking
//! dataflow interprets every instruction as a short sequence of
//! [`PartitionOp`]s over this domain and joins partitions at control-flow
//! merges.
//!
//! Representation invariant: every tracked id maps to the smallest id of its
//! region, and the consumed set holds region labels only. Keeping the
//! representation canonical makes the derived `PartialEq` a semantic equality
//! and keeps all iteration deterministic.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::InstId;

/// Dense identifier for a canonicalized non-sendable value tracked by the
/// send-checking analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackedValueId(pub u32);

impl TrackedValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One abstract effect of an instruction on the region partition.
///
/// Ops are `Copy` values with structural equality and a total order that
/// includes the source site, so two ops from different instructions never
/// collapse when used as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionOp {
    /// Place `id` alone in a newly allocated, non-consumed region.
    AssignFresh {
        id: TrackedValueId,
        source: InstId,
    },
    /// Move `dest` into `src`'s region, discarding its prior membership.
    Assign {
        dest: TrackedValueId,
        src: TrackedValueId,
        source: InstId,
    },
    /// Unify the regions of `fst` and `snd`.
    Merge {
        fst: TrackedValueId,
        snd: TrackedValueId,
        source: InstId,
    },
    /// Mark `id`'s entire region as sent across an isolation boundary.
    Consume {
        id: TrackedValueId,
        source: InstId,
    },
    /// Observe `id`; fails if its region has been consumed.
    Require {
        id: TrackedValueId,
        source: InstId,
    },
}

impl PartitionOp {
    pub fn source(&self) -> InstId {
        match *self {
            Self::AssignFresh { source, .. }
            | Self::Assign { source, .. }
            | Self::Merge { source, .. }
            | Self::Consume { source, .. }
            | Self::Require { source, .. } => source,
        }
    }

    pub fn is_consume(&self) -> bool {
        matches!(self, Self::Consume { .. })
    }
}

/// An equivalence relation over tracked ids with consumed region markers.
///
/// All mutating operations are total: ids not yet tracked are tracked on
/// demand, and `require` of an untracked id is a clean no-op. Error
/// signaling happens exclusively through the callbacks of
/// [`Partition::apply_with_diagnostics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Tracked id -> canonical region label (the smallest member).
    labels: BTreeMap<TrackedValueId, TrackedValueId>,
    /// Canonical labels of consumed regions.
    consumed: BTreeSet<TrackedValueId>,
}

impl Partition {
    /// The empty partition, bottom of the join lattice.
    pub fn bottom() -> Self {
        Self::default()
    }

    /// A partition with all of `ids` in one non-consumed region.
    pub fn single_region(ids: impl IntoIterator<Item = TrackedValueId>) -> Self {
        let members: BTreeSet<TrackedValueId> = ids.into_iter().collect();
        let mut partition = Self::default();
        if let Some(&label) = members.first() {
            for &member in &members {
                partition.labels.insert(member, label);
            }
        }
        partition
    }

    pub fn is_tracked(&self, id: TrackedValueId) -> bool {
        self.labels.contains_key(&id)
    }

    pub fn is_consumed(&self, id: TrackedValueId) -> bool {
        self.labels
            .get(&id)
            .is_some_and(|label| self.consumed.contains(label))
    }

    fn label_of(&self, id: TrackedValueId) -> Option<TrackedValueId> {
        self.labels.get(&id).copied()
    }

    fn ensure_tracked(&mut self, id: TrackedValueId) -> TrackedValueId {
        match self.label_of(id) {
            Some(label) => label,
            None => {
                self.labels.insert(id, id);
                id
            }
        }
    }

    /// Detach `id` from its region, recomputing that region's canonical label
    /// (and moving its consumed bit) when `id` was the label.
    fn detach(&mut self, id: TrackedValueId) {
        let Some(old_label) = self.labels.remove(&id) else {
            return;
        };
        if old_label != id {
            return;
        }
        let members: Vec<TrackedValueId> = self
            .labels
            .iter()
            .filter(|&(_, &label)| label == id)
            .map(|(&member, _)| member)
            .collect();
        let was_consumed = self.consumed.remove(&id);
        if let Some(&new_label) = members.iter().min() {
            for member in members {
                self.labels.insert(member, new_label);
            }
            if was_consumed {
                self.consumed.insert(new_label);
            }
        }
    }

    /// Relabel the region currently labeled `from` to `to`, moving the
    /// consumed bit along.
    fn relabel(&mut self, from: TrackedValueId, to: TrackedValueId) {
        let was_consumed = self.consumed.remove(&from) || self.consumed.contains(&to);
        for label in self.labels.values_mut() {
            if *label == from {
                *label = to;
            }
        }
        if was_consumed {
            self.consumed.insert(to);
        }
    }

    /// Place `id` into a fresh singleton non-consumed region.
    pub fn assign_fresh(&mut self, id: TrackedValueId) {
        self.detach(id);
        self.labels.insert(id, id);
    }

    /// Move `dest` into `src`'s region; `dest` inherits `src`'s consumed
    /// status. No-op when already co-regional.
    pub fn assign(&mut self, dest: TrackedValueId, src: TrackedValueId) {
        let src_label = self.ensure_tracked(src);
        if self.label_of(dest) == Some(src_label) {
            return;
        }
        self.detach(dest);
        if dest < src_label {
            self.labels.insert(dest, dest);
            self.relabel(src_label, dest);
        } else {
            self.labels.insert(dest, src_label);
        }
    }

    /// Unify the regions of `fst` and `snd`; the result is consumed if either
    /// input region was. No-op when already co-regional.
    pub fn merge(&mut self, fst: TrackedValueId, snd: TrackedValueId) {
        let a = self.ensure_tracked(fst);
        let b = self.ensure_tracked(snd);
        if a == b {
            return;
        }
        let (winner, loser) = if a < b { (a, b) } else { (b, a) };
        self.relabel(loser, winner);
    }

    /// Mark `id`'s entire region as consumed.
    pub fn consume(&mut self, id: TrackedValueId) {
        let label = self.ensure_tracked(id);
        self.consumed.insert(label);
    }

    /// Apply `op`, suppressing all failure observation. Used during fixpoint
    /// iteration where diagnostics would be premature.
    pub fn apply(&mut self, op: &PartitionOp) {
        match *op {
            PartitionOp::AssignFresh { id, .. } => self.assign_fresh(id),
            PartitionOp::Assign { dest, src, .. } => self.assign(dest, src),
            PartitionOp::Merge { fst, snd, .. } => self.merge(fst, snd),
            PartitionOp::Consume { id, .. } => self.consume(id),
            PartitionOp::Require { .. } => {}
        }
    }

    /// Apply `op` with failure observation:
    ///
    /// - a `Require` of a consumed id invokes `on_require_fail`;
    /// - a `Consume` whose region contains one of `non_consumables` invokes
    ///   `on_consume_non_consumable` before the region is marked.
    pub fn apply_with_diagnostics(
        &mut self,
        op: &PartitionOp,
        non_consumables: &[TrackedValueId],
        on_require_fail: &mut dyn FnMut(&PartitionOp, TrackedValueId),
        on_consume_non_consumable: &mut dyn FnMut(&PartitionOp, TrackedValueId),
    ) {
        match *op {
            PartitionOp::Require { id, .. } => {
                if self.is_consumed(id) {
                    on_require_fail(op, id);
                }
            }
            PartitionOp::Consume { id, .. } => {
                if let Some(label) = self.label_of(id)
                    && non_consumables
                        .iter()
                        .any(|nc| self.label_of(*nc) == Some(label))
                {
                    on_consume_non_consumable(op, id);
                }
                self.consume(id);
            }
            _ => self.apply(op),
        }
    }

    /// Least upper bound: two ids are co-regional in the join iff they are
    /// (transitively) co-regional in either input, and a join region is
    /// consumed iff it overlaps a consumed region of either input.
    pub fn join(fst: &Partition, snd: &Partition) -> Partition {
        let mut out = fst.clone();
        for &id in snd.labels.keys() {
            out.ensure_tracked(id);
        }
        for region in snd.regions() {
            let mut members = region.iter();
            if let Some(&first) = members.next() {
                for &member in members {
                    out.merge(first, member);
                }
            }
        }
        for &label in &snd.consumed {
            out.consume(label);
        }
        out
    }

    /// All tracked ids lying in consumed regions, in ascending order.
    pub fn consumed_values(&self) -> impl Iterator<Item = TrackedValueId> + '_ {
        self.labels
            .iter()
            .filter(|(_, label)| self.consumed.contains(*label))
            .map(|(&id, _)| id)
    }

    /// The non-consumed regions, each sorted ascending, ordered by label.
    pub fn non_consumed_regions(&self) -> Vec<Vec<TrackedValueId>> {
        self.group_regions(|label| !self.consumed.contains(&label))
    }

    fn regions(&self) -> Vec<Vec<TrackedValueId>> {
        self.group_regions(|_| true)
    }

    fn group_regions(&self, keep: impl Fn(TrackedValueId) -> bool) -> Vec<Vec<TrackedValueId>> {
        let mut grouped: BTreeMap<TrackedValueId, Vec<TrackedValueId>> = BTreeMap::new();
        for (&id, &label) in &self.labels {
            if keep(label) {
                grouped.entry(label).or_default().push(id);
            }
        }
        grouped.into_values().collect()
    }
}

//! Region-based send checking over Tern MIR.
//!
//! Every instruction is translated to a short sequence of [`PartitionOp`]s
//! over the region partition of the function's non-sendable values. A
//! worklist fixpoint then computes entry/exit partitions per block, and a
//! final diagnosis replay reports requires of consumed regions through the
//! race tracer so the *send* site is the root cause of each report.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{
    BlockId, CallIsolation, Function, Inst, InstId, InstKind, Module, Terminator, ValueId,
    ValueRepr,
};

use super::SendDiagnostic;
use super::partition::{Partition, PartitionOp, TrackedValueId};
use super::trace::RaceTracer;

/// How many access sites to report per send site.
const NUM_REQUIREMENTS_TO_DIAGNOSE: usize = 5;

/// Translates instructions into their effects on the region partition.
///
/// One instance per function: tracked ids are minted through `value_ids`, so
/// sharing an instance across functions would conflate values. Values are
/// canonicalized (projections, borrows and aliased addresses collapse to one
/// representative) before any id lookup.
pub(crate) struct OpTranslator<'a> {
    module: &'a Module,
    func: &'a Function,
    /// Canonical value -> tracked id. Only non-sendable values are entered.
    value_ids: FxHashMap<ValueId, TrackedValueId>,
    next_id: u32,
    /// Canonical roots that alias analysis calls uniquely identified but that
    /// flow into some call in this function, which may retain an alias.
    /// Stores through these must merge rather than overwrite.
    captured_unique: FxHashSet<ValueId>,
    /// Running count of translated instructions, surfaced in trace logs.
    translation_index: u32,
}

impl<'a> OpTranslator<'a> {
    pub(crate) fn new(module: &'a Module, func: &'a Function) -> Self {
        let mut translator = Self {
            module,
            func,
            value_ids: FxHashMap::default(),
            next_id: 0,
            captured_unique: FxHashSet::default(),
            translation_index: 0,
        };
        translator.init_captured_unique();
        translator
    }

    /// Pre-pass: record every uniquely-identified address that is passed to a
    /// call anywhere in the function. Must run before any translation, since
    /// store translation depends on the full set.
    fn init_captured_unique(&mut self) {
        for block in &self.func.blocks {
            for inst in &block.insts {
                if !is_apply_inst(inst) {
                    continue;
                }
                for operand in inst.operands() {
                    if self.is_non_sendable(operand) && self.is_uniquely_identified(operand) {
                        self.captured_unique.insert(self.simplify(operand));
                    }
                }
            }
        }
        tracing::debug!(
            function = %self.func.name,
            captured = ?self.captured_unique,
            "captured uniquely-identified addresses"
        );
    }

    fn is_address(&self, value: ValueId) -> bool {
        self.func.value(value).repr == ValueRepr::Address
    }

    /// Reduce a value to its canonical representative: the access-storage
    /// root for addresses, the underlying object otherwise. Projections,
    /// borrows and aliased addresses of one location share a representative.
    fn simplify(&self, value: ValueId) -> ValueId {
        if !self.is_address(value) {
            return self.func.underlying_object(value);
        }
        match self.func.access_storage(value) {
            Some(storage) => storage.root,
            None => value,
        }
    }

    fn is_uniquely_identified(&self, value: ValueId) -> bool {
        let value = self.simplify(value);
        if !self.is_address(value) {
            return false;
        }
        self.func
            .access_storage(value)
            .is_some_and(|storage| storage.uniquely_identified)
            && !self.captured_unique.contains(&value)
    }

    /// The sendability oracle at value granularity. Function and method
    /// references are plain capabilities and safe to treat as sendable even
    /// though their types are not.
    fn is_non_sendable(&self, value: ValueId) -> bool {
        let value = self.simplify(value);
        if let Some(inst) = self.func.def_inst(value)
            && matches!(
                inst.kind,
                InstKind::FunctionRef { .. } | InstKind::ClassMethod { .. }
            )
        {
            return false;
        }
        self.module.is_non_sendable_ty(self.func.value(value).ty)
    }

    fn has_id(&self, value: ValueId) -> bool {
        self.value_ids.contains_key(&self.simplify(value))
    }

    fn lookup_id(&mut self, value: ValueId) -> TrackedValueId {
        let value = self.simplify(value);
        debug_assert!(
            self.is_non_sendable(value),
            "only non-sendable values are tracked"
        );
        if let Some(&id) = self.value_ids.get(&value) {
            return id;
        }
        let id = TrackedValueId(self.next_id);
        self.next_id += 1;
        self.value_ids.insert(value, id);
        id
    }

    /// Tracked ids of the non-sendable formal parameters, receiver included.
    fn arg_ids(&mut self) -> Vec<TrackedValueId> {
        let non_sendable: Vec<ValueId> = self
            .func
            .args
            .iter()
            .copied()
            .chain(self.func.self_arg)
            .filter(|&arg| self.module.is_non_sendable_ty(self.func.value(arg).ty))
            .collect();
        non_sendable
            .into_iter()
            .map(|arg| self.lookup_id(arg))
            .collect()
    }

    /// The partition at function entry: all non-sendable arguments share one
    /// region, since the caller may have aliased them arbitrarily.
    pub(crate) fn entry_partition(&mut self) -> Partition {
        Partition::single_region(self.arg_ids())
    }

    /// Ids that must never be consumed in this function. All arguments share
    /// one region, so a single representative suffices.
    pub(crate) fn non_consumables(&mut self) -> Vec<TrackedValueId> {
        match self.arg_ids().first() {
            Some(&first) => vec![first],
            None => Vec::new(),
        }
    }

    fn emit_assign_fresh(&mut self, value: ValueId, source: InstId) -> Vec<PartitionOp> {
        vec![PartitionOp::AssignFresh {
            id: self.lookup_id(value),
            source,
        }]
    }

    fn emit_assign(&mut self, tgt: ValueId, src: ValueId, source: InstId) -> Vec<PartitionOp> {
        debug_assert!(
            self.has_id(src),
            "assignment source should already have been encountered"
        );
        let (dest, src) = (self.lookup_id(tgt), self.lookup_id(src));
        if dest == src {
            return Vec::new();
        }
        vec![PartitionOp::Assign { dest, src, source }]
    }

    fn emit_merge(&mut self, fst: ValueId, snd: ValueId, source: InstId) -> Vec<PartitionOp> {
        debug_assert!(
            self.has_id(fst) && self.has_id(snd),
            "merged values should already have been encountered"
        );
        let (fst, snd) = (self.lookup_id(fst), self.lookup_id(snd));
        if fst == snd {
            return Vec::new();
        }
        vec![PartitionOp::Merge { fst, snd, source }]
    }

    fn emit_consume(&mut self, value: ValueId, source: InstId) -> Vec<PartitionOp> {
        debug_assert!(
            self.has_id(value),
            "consumed value should already have been encountered"
        );
        vec![PartitionOp::Consume {
            id: self.lookup_id(value),
            source,
        }]
    }

    fn emit_require(&mut self, value: ValueId, source: InstId) -> Vec<PartitionOp> {
        debug_assert!(
            self.has_id(value),
            "required value should already have been encountered"
        );
        vec![PartitionOp::Require {
            id: self.lookup_id(value),
            source,
        }]
    }

    /// Assignment guarded by sendability: a non-sendable target takes its
    /// source's region, except when the source is sendable (e.g. a
    /// non-sendable value extracted from a sendable carrier by an unchecked
    /// cast), which places the target in a fresh region instead.
    fn translate_assign(&mut self, tgt: ValueId, src: ValueId, source: InstId) -> Vec<PartitionOp> {
        if !self.is_non_sendable(tgt) {
            return Vec::new();
        }
        if self.is_non_sendable(src) {
            return self.emit_assign(tgt, src, source);
        }
        self.emit_assign_fresh(tgt, source)
    }

    fn translate_assign_fresh(&mut self, value: ValueId, source: InstId) -> Vec<PartitionOp> {
        if self.is_non_sendable(value) {
            return self.emit_assign_fresh(value, source);
        }
        Vec::new()
    }

    fn translate_merge(&mut self, fst: ValueId, snd: ValueId, source: InstId) -> Vec<PartitionOp> {
        if self.is_non_sendable(fst) && self.is_non_sendable(snd) {
            return self.emit_merge(fst, snd, source);
        }
        Vec::new()
    }

    /// Stores overwrite uniquely-identified destinations but must merge into
    /// anything possibly aliased; overwriting an aliased location would lose
    /// the remaining alias's region.
    fn translate_store(&mut self, dst: ValueId, src: ValueId, source: InstId) -> Vec<PartitionOp> {
        if self.is_uniquely_identified(dst) {
            return self.translate_assign(dst, src, source);
        }
        self.translate_merge(dst, src, source)
    }

    fn translate_require(&mut self, value: ValueId, source: InstId) -> Vec<PartitionOp> {
        if self.is_non_sendable(value) {
            return self.emit_require(value, source);
        }
        Vec::new()
    }

    /// Calls are the crux. An isolation-crossing call consumes every
    /// non-sendable operand (callee included); the regions become unusable in
    /// the caller. A local call requires/merges its operands and puts the
    /// result in their region.
    fn translate_apply(&mut self, inst: &Inst, source: InstId) -> Vec<PartitionOp> {
        let non_sendable_operands: Vec<ValueId> = inst
            .operands()
            .into_iter()
            .filter(|&operand| self.is_non_sendable(operand))
            .collect();
        let non_sendable_result = inst
            .results
            .first()
            .copied()
            .filter(|&result| self.is_non_sendable(result));

        let mut translated = Vec::new();

        if apply_crosses_isolation(inst) {
            for &operand in &non_sendable_operands {
                translated.extend(self.emit_consume(operand, source));
            }
            if let Some(result) = non_sendable_result {
                // The result is unusable across the boundary anyway; a fresh
                // region avoids cascading reports from this one site.
                translated.extend(self.emit_assign_fresh(result, source));
            }
            return translated;
        }

        match non_sendable_operands.as_slice() {
            [] => {}
            [single] => translated.extend(self.emit_require(*single, source)),
            operands => {
                for pair in operands.windows(2) {
                    translated.extend(self.emit_merge(pair[0], pair[1], source));
                }
            }
        }
        if let Some(result) = non_sendable_result {
            match non_sendable_operands.first() {
                Some(&first) => translated.extend(self.emit_assign(result, first, source)),
                None => translated.extend(self.emit_assign_fresh(result, source)),
            }
        }
        translated
    }

    fn translate_inst(&mut self, inst: &Inst, source: InstId) -> Vec<PartitionOp> {
        self.translation_index += 1;
        match &inst.kind {
            // Fresh producers: the result has no prior identity.
            InstKind::Alloc { .. } | InstKind::Literal | InstKind::FunctionRef { .. } => {
                self.translate_assign_fresh(inst.results[0], source)
            }

            // Single-operand views and reinterpretations. These are not
            // projections for write-through purposes: the result either is a
            // different value (load, copy) or supersedes the operand (casts).
            InstKind::Borrow { operand }
            | InstKind::BeginAccess { operand }
            | InstKind::Load { operand }
            | InstKind::CopyValue { operand }
            | InstKind::FieldAddr { operand, .. }
            | InstKind::IndexAddr { operand, .. }
            | InstKind::AddressCast { operand }
            | InstKind::UncheckedCast { operand }
            | InstKind::InitExistential { operand } => {
                self.translate_assign(inst.results[0], *operand, source)
            }

            InstKind::Store { src, dst }
            | InstKind::CopyAddr { src, dst }
            | InstKind::StoreBorrow { src, dst } => self.translate_store(*dst, *src, source),

            InstKind::Apply { .. } | InstKind::Builtin { .. } => {
                self.translate_apply(inst, source)
            }

            InstKind::DestructureTuple { operand } => {
                let operand = *operand;
                let results = inst.results.clone();
                results
                    .into_iter()
                    .flat_map(|result| self.translate_assign(result, operand, source))
                    .collect()
            }

            // No effect on the partition.
            InstKind::ClassMethod { .. }
            | InstKind::DebugValue { .. }
            | InstKind::DestroyValue { .. }
            | InstKind::DeallocStack { .. }
            | InstKind::EndBorrow { .. }
            | InstKind::EndAccess { .. }
            | InstKind::HopToExecutor { .. }
            | InstKind::Metatype => Vec::new(),

            _ => {
                tracing::warn!(
                    kind = inst.kind.name(),
                    "unhandled instruction kind in send checking"
                );
                Vec::new()
            }
        }
    }

    fn translate_terminator(&mut self, term: &Terminator, source: InstId) -> Vec<PartitionOp> {
        match term {
            // Returning a consumed value would hand it back to the caller.
            Terminator::Return {
                value: Some(value), ..
            } => self.translate_require(*value, source),
            Terminator::Return { value: None, .. }
            | Terminator::Goto { .. }
            | Terminator::Branch { .. }
            | Terminator::Unreachable { .. } => Vec::new(),
        }
    }

    /// Reduce a basic block to the partition ops its instructions induce.
    pub(crate) fn translate_block(&mut self, block_id: BlockId) -> Vec<PartitionOp> {
        let block = self.func.block(block_id);
        let mut ops = Vec::new();
        for (index, inst) in block.insts.iter().enumerate() {
            let source = InstId::inst(block_id, index as u32);
            for op in self.translate_inst(inst, source) {
                tracing::trace!(
                    function = %self.func.name,
                    %source,
                    op = ?op,
                    translation = self.translation_index,
                    "translated"
                );
                ops.push(op);
            }
        }
        let term_source = InstId::terminator(block_id);
        ops.extend(self.translate_terminator(&block.terminator, term_source));
        ops
    }
}

fn is_apply_inst(inst: &Inst) -> bool {
    matches!(
        inst.kind,
        InstKind::Apply { .. } | InstKind::Builtin { .. }
    )
}

/// The isolation-crossing oracle. Only real applies carry an isolation
/// annotation from the frontend; builtins never cross.
fn apply_crosses_isolation(inst: &Inst) -> bool {
    matches!(
        inst.kind,
        InstKind::Apply {
            isolation: CallIsolation::Crossing,
            ..
        }
    )
}

/// Per-block dataflow record for the fixpoint solve.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockState {
    pub(crate) entry: Partition,
    pub(crate) exit: Partition,
    /// Lazily cached translation of this block. Blocks the solver never
    /// reaches keep `None` and diagnose as empty.
    ops: Option<Vec<PartitionOp>>,
    pub(crate) reached: bool,
    pub(crate) needs_update: bool,
}

impl BlockState {
    /// Replay this block's ops over the entry partition (silently) and
    /// install the result as the exit partition. Returns whether the exit
    /// changed, under semantic partition equality.
    fn recompute_exit_from_entry(
        &mut self,
        translator: &mut OpTranslator<'_>,
        block: BlockId,
    ) -> bool {
        let ops = self
            .ops
            .get_or_insert_with(|| translator.translate_block(block));
        let mut working = self.entry.clone();
        for op in ops.iter() {
            working.apply(op);
        }
        let changed = working != self.exit;
        self.exit = working;
        changed
    }

    /// Replay with failure callbacks enabled. Purely observational: the
    /// working partition is discarded.
    fn diagnose(
        &self,
        non_consumables: &[TrackedValueId],
        on_require_fail: &mut dyn FnMut(&PartitionOp, TrackedValueId),
        on_consume_non_consumable: &mut dyn FnMut(&PartitionOp, TrackedValueId),
    ) {
        let mut working = self.entry.clone();
        for op in self.ops() {
            working.apply_with_diagnostics(
                op,
                non_consumables,
                on_require_fail,
                on_consume_non_consumable,
            );
        }
    }

    pub(crate) fn ops(&self) -> &[PartitionOp] {
        self.ops.as_deref().unwrap_or(&[])
    }

    /// Run `action` on each op in order; stop early when it returns `false`.
    pub(crate) fn for_each_op(&self, mut action: impl FnMut(&PartitionOp) -> bool) {
        for op in self.ops() {
            if !action(op) {
                break;
            }
        }
    }
}

/// The per-function send-checking analysis: translation, fixpoint solve and
/// diagnosis.
pub(crate) struct Sendck<'a> {
    translator: OpTranslator<'a>,
    func: &'a Function,
    states: Vec<BlockState>,
    preds: Vec<Vec<BlockId>>,
    non_consumables: Vec<TrackedValueId>,
    solved: bool,
}

impl<'a> Sendck<'a> {
    pub(crate) fn new(module: &'a Module, func: &'a Function) -> Self {
        let mut translator = OpTranslator::new(module, func);
        let mut states = vec![BlockState::default(); func.blocks.len()];
        // Seed the solve: the entry block starts from the argument region and
        // is the only block initially scheduled.
        states[func.entry.index()].entry = translator.entry_partition();
        states[func.entry.index()].needs_update = true;
        let non_consumables = translator.non_consumables();
        Self {
            translator,
            func,
            states,
            preds: func.predecessors(),
            non_consumables,
            solved: false,
        }
    }

    /// Worklist fixpoint over block entry/exit partitions. Terminates because
    /// the lattice has finite height over the function's finite id universe
    /// and both the transfer functions and `join` are monotone.
    pub(crate) fn solve(&mut self) {
        assert!(!self.solved, "solve should only be called once");
        self.solved = true;

        let mut any_need_update = true;
        while any_need_update {
            any_need_update = false;

            for index in 0..self.states.len() {
                if !self.states[index].needs_update {
                    continue;
                }
                self.states[index].needs_update = false;
                self.states[index].reached = true;

                // Join the exit partitions of all reached predecessors.
                let mut new_entry: Option<Partition> = None;
                for &pred in &self.preds[index] {
                    let pred_state = &self.states[pred.index()];
                    if !pred_state.reached {
                        continue;
                    }
                    new_entry = Some(match new_entry {
                        None => pred_state.exit.clone(),
                        Some(current) => Partition::join(&current, &pred_state.exit),
                    });
                }

                // With no reached predecessor (the entry block) the seeded
                // entry partition stands.
                if let Some(new_entry) = new_entry {
                    if new_entry == self.states[index].entry {
                        continue;
                    }
                    self.states[index].entry = new_entry;
                }

                let block = BlockId(index as u32);
                if self.states[index].recompute_exit_from_entry(&mut self.translator, block) {
                    for succ in self.func.block(block).terminator.successors() {
                        any_need_update = true;
                        self.states[succ.index()].needs_update = true;
                    }
                }
            }
        }
        tracing::debug!(function = %self.func.name, "send-check fixpoint reached");
    }

    /// Post-solve replay with failure callbacks. Requires of consumed regions
    /// are routed through the race tracer so each report is rooted at the
    /// send, not the access; consumes of the argument region are reported
    /// directly.
    pub(crate) fn diagnose(&self) -> Vec<SendDiagnostic> {
        assert!(self.solved, "diagnose should not be called before solve");

        let mut tracer = RaceTracer::new(&self.states, &self.preds);
        let diagnostics = std::cell::RefCell::new(Vec::new());

        for state in &self.states {
            state.diagnose(
                &self.non_consumables,
                &mut |op, consumed| tracer.trace_use_of_consumed_value(op, consumed),
                &mut |op, _| {
                    diagnostics
                        .borrow_mut()
                        .push(SendDiagnostic::ArgRegionConsumed { site: op.source() });
                },
            );
        }

        tracer.into_accumulator().for_each_consume_require(
            NUM_REQUIREMENTS_TO_DIAGNOSE,
            &mut |consume_op, shown, hidden| {
                diagnostics
                    .borrow_mut()
                    .push(SendDiagnostic::ConsumptionYieldsRace {
                        site: consume_op.source(),
                        shown,
                        hidden,
                    });
            },
            &mut |require_op| {
                diagnostics
                    .borrow_mut()
                    .push(SendDiagnostic::PossibleRacyAccessSite {
                        site: require_op.source(),
                    });
            },
        );

        diagnostics.into_inner()
    }

    #[cfg(test)]
    pub(crate) fn block_states(&self) -> &[BlockState] {
        &self.states
    }
}

//! The Tern mid-level IR.
//!
//! Function bodies are basic blocks of non-branching instructions terminated
//! by an explicit control-flow edge. Values are immutable once created and
//! referenced by dense ids; spans are stored out-of-line so sources don't
//! affect structural comparisons.

use std::fmt;

mod builder;

pub use builder::FunctionBuilder;

use common::diagnostics::Span;
use smol_str::SmolStr;

/// Interned type id (dense index into [`TyStore`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TyId(pub u32);

impl TyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TyKind {
    Unit,
    Bool,
    Int,
    Struct,
    Class,
    Actor,
    Tuple,
    Fn,
    Existential,
    /// Raw native pointers bypass the type system entirely; they are never
    /// safe to send regardless of declared conformances.
    RawPointer,
}

#[derive(Debug, Clone)]
pub struct TyData {
    pub name: SmolStr,
    pub kind: TyKind,
    /// Whether this type (conditionally) conforms to the `Sendable` protocol
    /// in the defining module.
    pub sendable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TyStore {
    tys: Vec<TyData>,
}

impl TyStore {
    pub fn alloc_ty(&mut self, data: TyData) -> TyId {
        let id = TyId(self.tys.len() as u32);
        self.tys.push(data);
        id
    }

    pub fn ty(&self, id: TyId) -> &TyData {
        &self.tys[id.index()]
    }
}

/// A compilation module: the type store plus module-level facts the analyses
/// consult.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: SmolStr,
    pub tys: TyStore,
    /// Whether the `Sendable` protocol is visible to this module at all.
    /// Without it, sendability cannot be queried and send checking is skipped.
    pub sendable_protocol_available: bool,
}

impl Module {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            tys: TyStore::default(),
            sendable_protocol_available: true,
        }
    }

    /// The sendability oracle: `true` if values of `ty` must not cross an
    /// isolation boundary. Raw pointers are non-sendable no matter what the
    /// type declares.
    pub fn is_non_sendable_ty(&self, ty: TyId) -> bool {
        let data = self.tys.ty(ty);
        match data.kind {
            TyKind::RawPointer => true,
            _ => !data.sendable,
        }
    }
}

/// Identifier for a basic block (dense index into [`Function::blocks`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable index into [`Function::source_infos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceInfoId(pub u32);

impl SourceInfoId {
    pub const SYNTHETIC: Self = Self(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub span: Option<Span>,
}

/// Position of an instruction within its block.
///
/// The terminator sorts after every ordinary instruction so that [`InstId`]
/// has a total order matching execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstIndex {
    Inst(u32),
    Terminator,
}

/// Reference to an instruction or terminator within a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId {
    pub block: BlockId,
    pub index: InstIndex,
}

impl InstId {
    pub fn inst(block: BlockId, index: u32) -> Self {
        Self {
            block,
            index: InstIndex::Inst(index),
        }
    }

    pub fn terminator(block: BlockId) -> Self {
        Self {
            block,
            index: InstIndex::Terminator,
        }
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            InstIndex::Inst(i) => write!(f, "bb{}[{i}]", self.block.0),
            InstIndex::Terminator => write!(f, "bb{}[term]", self.block.0),
        }
    }
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDef {
    /// Formal parameter (or receiver) at the given index.
    Arg(u32),
    /// The `index`-th result of an instruction.
    Result { inst: InstId, index: u32 },
}

/// Runtime representation category for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRepr {
    /// A first-class value.
    Object,
    /// An address pointing at storage for a value of [`ValueData::ty`].
    Address,
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: TyId,
    pub def: ValueDef,
    pub repr: ValueRepr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    Stack,
    Box,
    Ref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyKind {
    Call,
    TryCall,
    Partial,
}

/// Whether a call leaves the caller's concurrency domain. Stamped on the call
/// during lowering from the typed AST, where actor isolation is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallIsolation {
    Local,
    Crossing,
}

/// General IR instruction (does not change control flow).
#[derive(Debug, Clone)]
pub enum InstKind {
    /// Allocate fresh storage or a fresh object.
    Alloc { kind: AllocKind },
    /// Compile-time constant.
    Literal,
    /// First-class reference to a function item.
    FunctionRef { name: SmolStr },
    /// Dynamically dispatched method handle.
    ClassMethod { object: ValueId, name: SmolStr },
    /// Scoped borrow of a value.
    Borrow { operand: ValueId },
    /// Begin a formal access to an address.
    BeginAccess { operand: ValueId },
    /// Load the value stored at an address.
    Load { operand: ValueId },
    /// Copy a value, producing an independently owned result.
    CopyValue { operand: ValueId },
    /// Address of a field within an aggregate address.
    FieldAddr { operand: ValueId, field: u32 },
    /// Address of an element within an array-like address.
    IndexAddr { operand: ValueId, index: ValueId },
    /// Representation-preserving address conversion.
    AddressCast { operand: ValueId },
    /// Type-punning cast with no representation change.
    UncheckedCast { operand: ValueId },
    /// Initialize existential storage with a concrete value's address.
    InitExistential { operand: ValueId },
    /// Store a value to an address.
    Store { src: ValueId, dst: ValueId },
    /// Copy between two addresses.
    CopyAddr { src: ValueId, dst: ValueId },
    /// Store a borrow to an address for the duration of a scope.
    StoreBorrow { src: ValueId, dst: ValueId },
    /// Function application.
    Apply {
        kind: ApplyKind,
        callee: ValueId,
        args: Vec<ValueId>,
        isolation: CallIsolation,
    },
    /// Compiler intrinsic.
    Builtin { name: SmolStr, args: Vec<ValueId> },
    /// Split a tuple into its elements.
    DestructureTuple { operand: ValueId },
    /// Debug-info use of a value.
    DebugValue { operand: ValueId },
    /// End of an owned value's lifetime.
    DestroyValue { operand: ValueId },
    /// Free a stack allocation.
    DeallocStack { operand: ValueId },
    /// End a scoped borrow.
    EndBorrow { operand: ValueId },
    /// End a formal access.
    EndAccess { operand: ValueId },
    /// Switch execution to an actor's executor.
    HopToExecutor { actor: ValueId },
    /// Type metadata object.
    Metatype,
    /// Yield a value out of a coroutine.
    Yield { operand: ValueId },
}

impl InstKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alloc { .. } => "alloc",
            Self::Literal => "literal",
            Self::FunctionRef { .. } => "function_ref",
            Self::ClassMethod { .. } => "class_method",
            Self::Borrow { .. } => "borrow",
            Self::BeginAccess { .. } => "begin_access",
            Self::Load { .. } => "load",
            Self::CopyValue { .. } => "copy_value",
            Self::FieldAddr { .. } => "field_addr",
            Self::IndexAddr { .. } => "index_addr",
            Self::AddressCast { .. } => "address_cast",
            Self::UncheckedCast { .. } => "unchecked_cast",
            Self::InitExistential { .. } => "init_existential",
            Self::Store { .. } => "store",
            Self::CopyAddr { .. } => "copy_addr",
            Self::StoreBorrow { .. } => "store_borrow",
            Self::Apply { .. } => "apply",
            Self::Builtin { .. } => "builtin",
            Self::DestructureTuple { .. } => "destructure_tuple",
            Self::DebugValue { .. } => "debug_value",
            Self::DestroyValue { .. } => "destroy_value",
            Self::DeallocStack { .. } => "dealloc_stack",
            Self::EndBorrow { .. } => "end_borrow",
            Self::EndAccess { .. } => "end_access",
            Self::HopToExecutor { .. } => "hop_to_executor",
            Self::Metatype => "metatype",
            Self::Yield { .. } => "yield",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub results: Vec<ValueId>,
    pub source: SourceInfoId,
}

impl Inst {
    /// All value operands of this instruction, in operand order. For calls
    /// this includes the callee.
    pub fn operands(&self) -> Vec<ValueId> {
        match &self.kind {
            InstKind::Alloc { .. }
            | InstKind::Literal
            | InstKind::FunctionRef { .. }
            | InstKind::Metatype => Vec::new(),
            InstKind::ClassMethod { object, .. } => vec![*object],
            InstKind::Borrow { operand }
            | InstKind::BeginAccess { operand }
            | InstKind::Load { operand }
            | InstKind::CopyValue { operand }
            | InstKind::FieldAddr { operand, .. }
            | InstKind::AddressCast { operand }
            | InstKind::UncheckedCast { operand }
            | InstKind::InitExistential { operand }
            | InstKind::DestructureTuple { operand }
            | InstKind::DebugValue { operand }
            | InstKind::DestroyValue { operand }
            | InstKind::DeallocStack { operand }
            | InstKind::EndBorrow { operand }
            | InstKind::EndAccess { operand }
            | InstKind::Yield { operand } => vec![*operand],
            InstKind::IndexAddr { operand, index } => vec![*operand, *index],
            InstKind::HopToExecutor { actor } => vec![*actor],
            InstKind::Store { src, dst }
            | InstKind::CopyAddr { src, dst }
            | InstKind::StoreBorrow { src, dst } => vec![*src, *dst],
            InstKind::Apply { callee, args, .. } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            InstKind::Builtin { args, .. } => args.clone(),
        }
    }
}

/// Control-flow terminating instruction.
#[derive(Debug, Clone)]
pub enum Terminator {
    Return {
        source: SourceInfoId,
        value: Option<ValueId>,
    },
    Goto {
        source: SourceInfoId,
        target: BlockId,
    },
    Branch {
        source: SourceInfoId,
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Unreachable {
        source: SourceInfoId,
    },
}

impl Terminator {
    pub fn source(&self) -> SourceInfoId {
        match self {
            Self::Return { source, .. }
            | Self::Goto { source, .. }
            | Self::Branch { source, .. }
            | Self::Unreachable { source } => *source,
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Goto { target, .. } => vec![*target],
            Self::Branch {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            Self::Return { .. } | Self::Unreachable { .. } => Vec::new(),
        }
    }
}

/// A linear sequence of instructions terminated by a control-flow edge.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub insts: Vec<Inst>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            terminator: Terminator::Unreachable {
                source: SourceInfoId::SYNTHETIC,
            },
        }
    }
}

impl Default for BasicBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The storage root of an address, as seen by alias analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStorage {
    pub root: ValueId,
    /// `true` when alias analysis guarantees the root is not aliased with
    /// anything outside its defining scope.
    pub uniquely_identified: bool,
}

/// A function body expressed as basic blocks.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: SmolStr,
    pub entry: BlockId,
    pub blocks: Vec<BasicBlock>,
    pub values: Vec<ValueData>,
    /// Formal parameters in source order.
    pub args: Vec<ValueId>,
    /// Receiver, for methods.
    pub self_arg: Option<ValueId>,
    /// Eager spans, stored out-of-line. `SourceInfoId(0)` is always the
    /// synthetic/no-span entry.
    pub source_infos: Vec<SourceInfo>,
}

impl Function {
    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// The instruction referenced by `id`, or `None` for terminators.
    pub fn inst(&self, id: InstId) -> Option<&Inst> {
        match id.index {
            InstIndex::Inst(i) => self.block(id.block).insts.get(i as usize),
            InstIndex::Terminator => None,
        }
    }

    /// The instruction defining `value`, or `None` for arguments.
    pub fn def_inst(&self, value: ValueId) -> Option<&Inst> {
        match self.value(value).def {
            ValueDef::Arg(_) => None,
            ValueDef::Result { inst, .. } => self.inst(inst),
        }
    }

    pub fn source_of(&self, id: InstId) -> SourceInfoId {
        match id.index {
            InstIndex::Inst(_) => self
                .inst(id)
                .unwrap_or_else(|| panic!("invalid InstId {id}"))
                .source,
            InstIndex::Terminator => self.block(id.block).terminator.source(),
        }
    }

    pub fn span_of(&self, id: InstId) -> Option<Span> {
        self.source_infos
            .get(self.source_of(id).index())
            .and_then(|info| info.span.clone())
    }

    /// Per-block predecessor lists, in block order with duplicates removed.
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (idx, block) in self.blocks.iter().enumerate() {
            let pred = BlockId(idx as u32);
            for succ in block.terminator.successors() {
                let list: &mut Vec<BlockId> = &mut preds[succ.index()];
                if !list.contains(&pred) {
                    list.push(pred);
                }
            }
        }
        preds
    }

    /// Reduce a first-class value to the value it is a view of, peeling
    /// ownership-transparent instructions.
    pub fn underlying_object(&self, value: ValueId) -> ValueId {
        let mut current = value;
        while let Some(inst) = self.def_inst(current) {
            match inst.kind {
                InstKind::Borrow { operand } | InstKind::CopyValue { operand } => current = operand,
                _ => break,
            }
        }
        current
    }

    /// Compute the storage root of an address value, peeling projections and
    /// the trivial address-producing conversions alias analysis looks
    /// through (existential initialization, copies).
    pub fn access_storage(&self, addr: ValueId) -> Option<AccessStorage> {
        if self.value(addr).repr != ValueRepr::Address {
            return None;
        }
        let mut current = addr;
        while let Some(inst) = self.def_inst(current) {
            match inst.kind {
                InstKind::FieldAddr { operand, .. }
                | InstKind::IndexAddr { operand, .. }
                | InstKind::BeginAccess { operand }
                | InstKind::AddressCast { operand }
                | InstKind::InitExistential { operand }
                | InstKind::CopyValue { operand } => current = operand,
                _ => break,
            }
        }
        let uniquely_identified = match self.def_inst(current) {
            Some(inst) => matches!(
                inst.kind,
                InstKind::Alloc {
                    kind: AllocKind::Stack | AllocKind::Box
                }
            ),
            None => false,
        };
        Some(AccessStorage {
            root: current,
            uniquely_identified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_module() -> (Module, TyId) {
        let mut module = Module::new("test");
        let ty = module.tys.alloc_ty(TyData {
            name: "Pelican".into(),
            kind: TyKind::Class,
            sendable: false,
        });
        (module, ty)
    }

    #[test]
    fn raw_pointers_are_always_non_sendable() {
        let mut module = Module::new("test");
        let ptr = module.tys.alloc_ty(TyData {
            name: "RawPointer".into(),
            kind: TyKind::RawPointer,
            sendable: true,
        });
        assert!(module.is_non_sendable_ty(ptr));
    }

    #[test]
    fn access_storage_peels_projections_to_the_allocation() {
        let (_, ty) = test_module();
        let mut b = FunctionBuilder::new("storage");
        let bb = b.add_block();
        b.switch_to_block(bb);
        let root = b.alloc_stack(ty, SourceInfoId::SYNTHETIC);
        let field = b.field_addr(root, 2, ty, SourceInfoId::SYNTHETIC);
        let access = b.begin_access(field, ty, SourceInfoId::SYNTHETIC);
        b.ret(None, SourceInfoId::SYNTHETIC);
        let func = b.finish();

        let storage = func.access_storage(access).unwrap();
        assert_eq!(storage.root, root);
        assert!(storage.uniquely_identified);
    }

    #[test]
    fn access_storage_of_argument_is_not_uniquely_identified() {
        let (_, ty) = test_module();
        let mut b = FunctionBuilder::new("arg_storage");
        let arg = b.add_arg(ty, ValueRepr::Address);
        let bb = b.add_block();
        b.switch_to_block(bb);
        let field = b.field_addr(arg, 0, ty, SourceInfoId::SYNTHETIC);
        b.ret(None, SourceInfoId::SYNTHETIC);
        let func = b.finish();

        let storage = func.access_storage(field).unwrap();
        assert_eq!(storage.root, arg);
        assert!(!storage.uniquely_identified);
    }

    #[test]
    fn underlying_object_peels_borrows_and_copies() {
        let (_, ty) = test_module();
        let mut b = FunctionBuilder::new("views");
        let bb = b.add_block();
        b.switch_to_block(bb);
        let obj = b.alloc_ref(ty, SourceInfoId::SYNTHETIC);
        let borrowed = b.borrow(obj, ty, SourceInfoId::SYNTHETIC);
        let copied = b.copy_value(borrowed, ty, SourceInfoId::SYNTHETIC);
        b.ret(None, SourceInfoId::SYNTHETIC);
        let func = b.finish();

        assert_eq!(func.underlying_object(copied), obj);
        assert_eq!(func.underlying_object(obj), obj);
    }

    #[test]
    fn predecessors_follow_terminator_edges() {
        let (mut module, _ty) = test_module();
        let bool_ty = module.tys.alloc_ty(TyData {
            name: "Bool".into(),
            kind: TyKind::Bool,
            sendable: true,
        });
        let mut b = FunctionBuilder::new("diamond");
        let b0 = b.add_block();
        let b1 = b.add_block();
        let b2 = b.add_block();
        let b3 = b.add_block();
        b.switch_to_block(b0);
        let cond = b.literal(bool_ty, SourceInfoId::SYNTHETIC);
        b.branch(cond, b1, b2, SourceInfoId::SYNTHETIC);
        b.switch_to_block(b1);
        b.goto(b3, SourceInfoId::SYNTHETIC);
        b.switch_to_block(b2);
        b.goto(b3, SourceInfoId::SYNTHETIC);
        b.switch_to_block(b3);
        b.ret(None, SourceInfoId::SYNTHETIC);
        let func = b.finish();

        let preds = func.predecessors();
        assert!(preds[b0.index()].is_empty());
        assert_eq!(preds[b1.index()], vec![b0]);
        assert_eq!(preds[b2.index()], vec![b0]);
        assert_eq!(preds[b3.index()], vec![b1, b2]);
    }
}

//! Arena-style construction API for [`Function`] bodies.
//!
//! Used by the lowering frontend and by tests. Blocks are created up front
//! and filled in any order; the first block created becomes the entry.

use common::diagnostics::Span;
use smol_str::SmolStr;

use super::{
    AllocKind, ApplyKind, BasicBlock, BlockId, CallIsolation, Function, Inst, InstId, InstKind,
    SourceInfo, SourceInfoId, Terminator, TyId, ValueData, ValueDef, ValueId, ValueRepr,
};

pub struct FunctionBuilder {
    func: Function,
    current: Option<BlockId>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            func: Function {
                name: name.into(),
                entry: BlockId(0),
                blocks: Vec::new(),
                values: Vec::new(),
                args: Vec::new(),
                self_arg: None,
                source_infos: vec![SourceInfo { span: None }],
            },
            current: None,
        }
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        if self.func.blocks.is_empty() {
            self.func.entry = id;
        }
        self.func.blocks.push(BasicBlock::new());
        id
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn add_arg(&mut self, ty: TyId, repr: ValueRepr) -> ValueId {
        let index = (self.func.args.len() + usize::from(self.func.self_arg.is_some())) as u32;
        let value = self.alloc_value(ty, ValueDef::Arg(index), repr);
        self.func.args.push(value);
        value
    }

    pub fn set_self_arg(&mut self, ty: TyId, repr: ValueRepr) -> ValueId {
        assert!(self.func.self_arg.is_none(), "receiver already set");
        let index = self.func.args.len() as u32;
        let value = self.alloc_value(ty, ValueDef::Arg(index), repr);
        self.func.self_arg = Some(value);
        value
    }

    pub fn source(&mut self, span: Option<Span>) -> SourceInfoId {
        let id = SourceInfoId(self.func.source_infos.len() as u32);
        self.func.source_infos.push(SourceInfo { span });
        id
    }

    fn alloc_value(&mut self, ty: TyId, def: ValueDef, repr: ValueRepr) -> ValueId {
        let id = ValueId(self.func.values.len() as u32);
        self.func.values.push(ValueData { ty, def, repr });
        id
    }

    fn current_block(&mut self) -> BlockId {
        self.current.expect("no block selected")
    }

    /// Append an instruction with arbitrary results to the current block.
    pub fn push_inst(
        &mut self,
        kind: InstKind,
        results: &[(TyId, ValueRepr)],
        source: SourceInfoId,
    ) -> Vec<ValueId> {
        let block = self.current_block();
        let inst_id = InstId::inst(block, self.func.blocks[block.index()].insts.len() as u32);
        let result_values: Vec<ValueId> = results
            .iter()
            .enumerate()
            .map(|(index, &(ty, repr))| {
                self.alloc_value(
                    ty,
                    ValueDef::Result {
                        inst: inst_id,
                        index: index as u32,
                    },
                    repr,
                )
            })
            .collect();
        self.func.blocks[block.index()].insts.push(Inst {
            kind,
            results: result_values.clone(),
            source,
        });
        result_values
    }

    fn push_unary_result(
        &mut self,
        kind: InstKind,
        ty: TyId,
        repr: ValueRepr,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_inst(kind, &[(ty, repr)], source)[0]
    }

    pub fn alloc_stack(&mut self, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::Alloc {
                kind: AllocKind::Stack,
            },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn alloc_box(&mut self, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::Alloc {
                kind: AllocKind::Box,
            },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn alloc_ref(&mut self, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::Alloc {
                kind: AllocKind::Ref,
            },
            ty,
            ValueRepr::Object,
            source,
        )
    }

    pub fn literal(&mut self, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(InstKind::Literal, ty, ValueRepr::Object, source)
    }

    pub fn function_ref(
        &mut self,
        name: impl Into<SmolStr>,
        ty: TyId,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_unary_result(
            InstKind::FunctionRef { name: name.into() },
            ty,
            ValueRepr::Object,
            source,
        )
    }

    pub fn class_method(
        &mut self,
        object: ValueId,
        name: impl Into<SmolStr>,
        ty: TyId,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_unary_result(
            InstKind::ClassMethod {
                object,
                name: name.into(),
            },
            ty,
            ValueRepr::Object,
            source,
        )
    }

    pub fn borrow(&mut self, operand: ValueId, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(InstKind::Borrow { operand }, ty, ValueRepr::Object, source)
    }

    pub fn begin_access(&mut self, operand: ValueId, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::BeginAccess { operand },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn load(&mut self, operand: ValueId, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(InstKind::Load { operand }, ty, ValueRepr::Object, source)
    }

    pub fn copy_value(&mut self, operand: ValueId, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::CopyValue { operand },
            ty,
            ValueRepr::Object,
            source,
        )
    }

    pub fn field_addr(
        &mut self,
        operand: ValueId,
        field: u32,
        ty: TyId,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_unary_result(
            InstKind::FieldAddr { operand, field },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn index_addr(
        &mut self,
        operand: ValueId,
        index: ValueId,
        ty: TyId,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_unary_result(
            InstKind::IndexAddr { operand, index },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn unchecked_cast(&mut self, operand: ValueId, ty: TyId, source: SourceInfoId) -> ValueId {
        self.push_unary_result(
            InstKind::UncheckedCast { operand },
            ty,
            ValueRepr::Object,
            source,
        )
    }

    pub fn init_existential(
        &mut self,
        operand: ValueId,
        ty: TyId,
        source: SourceInfoId,
    ) -> ValueId {
        self.push_unary_result(
            InstKind::InitExistential { operand },
            ty,
            ValueRepr::Address,
            source,
        )
    }

    pub fn store(&mut self, src: ValueId, dst: ValueId, source: SourceInfoId) {
        self.push_inst(InstKind::Store { src, dst }, &[], source);
    }

    pub fn copy_addr(&mut self, src: ValueId, dst: ValueId, source: SourceInfoId) {
        self.push_inst(InstKind::CopyAddr { src, dst }, &[], source);
    }

    pub fn apply(
        &mut self,
        kind: ApplyKind,
        callee: ValueId,
        args: &[ValueId],
        result: Option<(TyId, ValueRepr)>,
        isolation: CallIsolation,
        source: SourceInfoId,
    ) -> Option<ValueId> {
        let results: Vec<_> = result.into_iter().collect();
        self.push_inst(
            InstKind::Apply {
                kind,
                callee,
                args: args.to_vec(),
                isolation,
            },
            &results,
            source,
        )
        .first()
        .copied()
    }

    pub fn builtin(
        &mut self,
        name: impl Into<SmolStr>,
        args: &[ValueId],
        result: Option<(TyId, ValueRepr)>,
        source: SourceInfoId,
    ) -> Option<ValueId> {
        let results: Vec<_> = result.into_iter().collect();
        self.push_inst(
            InstKind::Builtin {
                name: name.into(),
                args: args.to_vec(),
            },
            &results,
            source,
        )
        .first()
        .copied()
    }

    pub fn destructure_tuple(
        &mut self,
        operand: ValueId,
        results: &[(TyId, ValueRepr)],
        source: SourceInfoId,
    ) -> Vec<ValueId> {
        self.push_inst(InstKind::DestructureTuple { operand }, results, source)
    }

    pub fn debug_value(&mut self, operand: ValueId, source: SourceInfoId) {
        self.push_inst(InstKind::DebugValue { operand }, &[], source);
    }

    pub fn yield_value(&mut self, operand: ValueId, source: SourceInfoId) {
        self.push_inst(InstKind::Yield { operand }, &[], source);
    }

    fn set_terminator(&mut self, term: Terminator) {
        let block = self.current_block();
        self.func.blocks[block.index()].terminator = term;
    }

    pub fn ret(&mut self, value: Option<ValueId>, source: SourceInfoId) {
        self.set_terminator(Terminator::Return { source, value });
    }

    pub fn goto(&mut self, target: BlockId, source: SourceInfoId) {
        self.set_terminator(Terminator::Goto { source, target });
    }

    pub fn branch(
        &mut self,
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
        source: SourceInfoId,
    ) {
        self.set_terminator(Terminator::Branch {
            source,
            cond,
            then_bb,
            else_bb,
        });
    }

    pub fn finish(self) -> Function {
        self.func
    }
}

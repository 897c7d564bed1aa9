pub mod analysis;
pub mod ir;

pub use analysis::{AnalysisConfig, SendDiagnostic, check_function};
pub use ir::{
    AccessStorage, AllocKind, ApplyKind, BasicBlock, BlockId, CallIsolation, Function,
    FunctionBuilder, Inst, InstId, InstIndex, InstKind, Module, SourceInfo, SourceInfoId,
    Terminator, TyData, TyId, TyKind, TyStore, ValueData, ValueDef, ValueId, ValueRepr,
};

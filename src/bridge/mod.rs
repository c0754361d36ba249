/// デコンパイラブリッジ本体
///
/// ホストのシンボル・型データベースとデコンパイラエンジンを仲介する。
/// 記述子 → バックエンドファクトリ → スコープブリッジ → 型マネージャ →
/// アクションパイプライン → ファサードの層構成。

pub mod architecture;
pub mod backend;
pub mod decompiler;
pub mod descriptor;
pub mod engine;
pub mod pipeline;
pub mod scope;
pub mod typemanager;

pub use architecture::{Architecture, CompilerSpec, Endianness, Language, Mode};
pub use backend::{FunctionHandle, InMemoryDatabase, SymbolInfoFactory, TypeInfoFactory};
pub use decompiler::{DecompileResult, Decompiler};
pub use descriptor::{
    ArrayDescriptor, FunctionDescriptor, MemoryLocation, SpaceKind, StructFieldDescriptor,
    SymbolDescriptor, SymbolKind, TypeDescriptor,
};
pub use engine::{
    AnalysisState, Breakpoint, DefaultScope, Engine, FunctionId, LocalVariable, NativeField,
    NativeFunction, NativeSymbol, NativeSymbolKind, NativeType, Prototype, Rendered, SymbolId,
    TypeMeta,
};
pub use pipeline::{Pipeline, Stage};
pub use scope::{ScopeBridge, ScopeContract, ScopeSession};
pub use typemanager::TypeManager;

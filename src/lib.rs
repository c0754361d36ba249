/// デコンパイラブリッジ ライブラリ
///
/// ホストのシンボル・型データベースとデコンパイラエンジンの仲介を提供

pub mod bridge;
pub mod error;

// スクリプト駆動のモックエンジン（テストとデモCLI用）
pub mod mock_engine;

pub use bridge::{Architecture, CompilerSpec, DecompileResult, Decompiler, InMemoryDatabase};
pub use error::{BridgeError, Result};

//! ブリッジ全体のエラー分類
//!
//! NotFoundは期待される結果でフォールバックを駆動する。
//! UnknownTypeとUnsupportedOperationはトップレベルのdecompile呼び出しまで
//! 伝播し、診断結果に変換される（ホストセッションを落とさない）。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// シンボルが見つからない（非致命・フォールバックを駆動）
    #[error("no symbol found at {0:#x}")]
    NotFound(u64),

    /// 参照された型名がどこにも解決できない（現在のデコンパイルに致命的）
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// 未登録の呼び出し規約（非致命・フォールバックチェーンを起動）
    #[error("unknown calling convention: {0}")]
    UnknownCallingConvention(String),

    /// 関数でないシンボルに関数セマンティクスを要求した
    #[error("symbol {0} is not a function")]
    SymbolIsNotAFunction(String),

    /// スコープ契約上、意図的に未実装の操作が呼ばれた
    /// （サイレントno-opはデコンパイラのキャッシュ不変条件を壊す）
    #[error("unsupported scope operation: {0}")]
    UnsupportedOperation(&'static str),

    /// 環境・インストール起因の障害（デコンパイル開始前に致命的）
    #[error("decompiler backend unavailable: {0}")]
    BackendUnavailable(String),

    /// ユニバーサル解析が負の結果コードで中断した
    #[error("analysis aborted with code {0}")]
    Analysis(i32),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

//! デコンパイラファサード
//!
//! ホストに見える唯一の入口。アドレスを受けてパイプラインを駆動し、
//! レンダリング結果かエラー診断のどちらかを必ず返す。
//! エラーでホストセッションを落とさないことが契約。

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{error, info};

use super::architecture::Architecture;
use super::descriptor::MemoryLocation;
use super::engine::Engine;
use super::pipeline::Pipeline;
use super::scope::{ScopeBridge, ScopeContract, ScopeSession};
use super::typemanager::TypeManager;
use crate::error::{BridgeError, Result};

/// 1回のデコンパイルの結果
///
/// 失敗時もerrorに診断を入れて返す。symbolsは表示識別子 → 格納位置の
/// マップで、ホストの対話的リネーム・リタイプの往復に使う。
#[derive(Debug, Clone, Serialize)]
pub struct DecompileResult {
    /// 対象関数名（関数が見つからなければNone）
    pub function_name: Option<String>,
    /// 対象関数のエントリアドレス
    pub function_address: Option<u64>,
    /// レンダリングされた擬似Cコード
    pub text: Option<String>,
    /// 表示識別子 → 格納位置
    pub symbols: IndexMap<String, MemoryLocation>,
    /// 失敗時の診断メッセージ
    pub error: Option<String>,
}

impl DecompileResult {
    /// 診断結果。判明している範囲で関数名・アドレスを保持する
    fn diagnostic(name: Option<String>, address: Option<u64>, message: String) -> Self {
        Self {
            function_name: name,
            function_address: address,
            text: None,
            symbols: IndexMap::new(),
            error: Some(message),
        }
    }
}

/// デコンパイラ本体
///
/// アーキテクチャ・エンジン・型マネージャ・スコープブリッジを所有する。
/// 型レジストリとスコープキャッシュは毎回のデコンパイル開始時に破棄され、
/// デコンパイル間で状態が漏れない。
pub struct Decompiler<E: Engine> {
    arch: Architecture,
    engine: E,
    types: TypeManager,
    scope: ScopeBridge,
}

impl<E: Engine> Decompiler<E> {
    /// エンジンのセットアップまで済ませて構築
    pub fn new(arch: Architecture, mut engine: E) -> Result<Self> {
        engine.prepare(&arch)?;
        Ok(Self {
            arch,
            engine,
            types: TypeManager::new(),
            scope: ScopeBridge::new(),
        })
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    /// インジェクション登録用（プロセスインスタンス全体で有効）
    pub fn arch_mut(&mut self) -> &mut Architecture {
        &mut self.arch
    }

    /// アドレスの関数をデコンパイル
    ///
    /// エラーはすべてここで診断結果に変換される
    pub fn decompile(&mut self, ea: u64) -> DecompileResult {
        info!("decompile request at {:#x}", ea);
        match self.try_decompile(ea) {
            Ok(result) => result,
            Err(err) => {
                // 関数解決前の失敗。照会アドレスだけは返す
                error!("decompilation failed at {:#x}: {}", ea, err);
                DecompileResult::diagnostic(None, Some(ea), err.to_string())
            }
        }
    }

    fn try_decompile(&mut self, ea: u64) -> Result<DecompileResult> {
        // キャッシュは持ち越さない
        self.types.clear();
        self.scope.clear();

        let mut session = ScopeSession::new(&self.arch, &mut self.types, &mut self.scope);
        let func = session
            .find_function(ea)?
            .ok_or(BridgeError::NotFound(ea))?;

        let (name, address) = {
            let native = session.scope.proxy().function(func);
            (native.name.clone(), native.address)
        };

        // 解決済み関数の失敗は名前・アドレス付きの診断にする
        let faulted = Pipeline::run(&mut self.engine, &mut session, func)
            .and_then(|_| self.engine.render(&session, func));
        let rendered = match faulted {
            Ok(rendered) => rendered,
            Err(err) => {
                error!("decompilation of {} at {:#x} failed: {}", name, address, err);
                return Ok(DecompileResult::diagnostic(
                    Some(name),
                    Some(address),
                    err.to_string(),
                ));
            }
        };

        Ok(DecompileResult {
            function_name: Some(name),
            function_address: Some(address),
            text: Some(rendered.text),
            symbols: rendered.tokens,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::architecture::{CompilerSpec, Endianness, Language, Mode};
    use crate::bridge::backend::InMemoryDatabase;
    use crate::bridge::descriptor::SymbolDescriptor;
    use crate::bridge::engine::{Breakpoint, FunctionId, Rendered};

    struct StubEngine;

    impl Engine for StubEngine {
        fn prepare(&mut self, _arch: &Architecture) -> Result<()> {
            Ok(())
        }

        fn analyze_until(
            &mut self,
            _session: &mut ScopeSession<'_>,
            _func: FunctionId,
            _breakpoint: Breakpoint,
        ) -> Result<i32> {
            Ok(0)
        }

        fn apply_arch_pass(
            &mut self,
            _session: &mut ScopeSession<'_>,
            _func: FunctionId,
            _seed_register: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn resume(&mut self, _session: &mut ScopeSession<'_>, _func: FunctionId) -> Result<i32> {
            Ok(0)
        }

        fn render(&self, session: &ScopeSession<'_>, func: FunctionId) -> Result<Rendered> {
            let name = &session.scope.proxy().function(func).name;
            Ok(Rendered {
                text: format!("void {}(void)\n{{\n}}\n", name),
                tokens: IndexMap::new(),
            })
        }
    }

    fn build(db: &InMemoryDatabase) -> Decompiler<StubEngine> {
        let arch = Architecture::build(
            CompilerSpec::new(Language::X86Windows, Endianness::Little, Mode::M64),
            Box::new(db.clone()),
            Box::new(db.clone()),
        )
        .unwrap();
        Decompiler::new(arch, StubEngine).unwrap()
    }

    #[test]
    fn test_decompile_renders_function() {
        let db = InMemoryDatabase::new();
        db.add_symbol(SymbolDescriptor::function(0x1000, "main", 0x40));
        let mut decompiler = build(&db);

        let result = decompiler.decompile(0x1000);
        assert!(result.error.is_none());
        assert_eq!(result.function_name.as_deref(), Some("main"));
        assert_eq!(result.function_address, Some(0x1000));
        assert!(result.text.unwrap().contains("main"));
    }

    #[test]
    fn test_no_function_is_diagnostic_not_panic() {
        let db = InMemoryDatabase::new();
        let mut decompiler = build(&db);

        let result = decompiler.decompile(0xdead);
        assert_eq!(result.error.as_deref(), Some("no symbol found at 0xdead"));
        assert!(result.function_name.is_none());
        // 照会アドレスは診断にも残る
        assert_eq!(result.function_address, Some(0xdead));
        assert!(result.text.is_none());
    }

    #[test]
    fn test_interior_address_resolves_entry() {
        let db = InMemoryDatabase::new();
        db.add_symbol(SymbolDescriptor::function(0x1000, "main", 0x40));
        let mut decompiler = build(&db);

        let result = decompiler.decompile(0x1023);
        assert_eq!(result.function_address, Some(0x1000));
    }
}

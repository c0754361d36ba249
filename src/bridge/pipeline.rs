//! アクションパイプライン
//!
//! 1回のデコンパイルを固定順の6ステージで駆動する。
//! リタイプはデッドコード除去の前でなければならない:
//! オーバーライドは (space, pc) にキー付けされており、除去されたpcには
//! 二度と適用できない。型ロックされたローカルは除去を生き延びる。

use std::collections::HashSet;

use tracing::debug;

use super::backend::FunctionHandle;
use super::engine::{AnalysisState, Breakpoint, Engine, FunctionId};
use super::descriptor::SpaceKind;
use super::scope::ScopeSession;
use crate::error::{BridgeError, Result};

/// パイプラインステージ（実行順）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// エンジンのセットアップ
    Init,
    /// デッドコード除去直前までのユニバーサル解析
    AnalyzeToBreakpoint,
    /// アーキテクチャ固有パス（エントリレジスタシード等）
    ArchPass,
    /// ホストの型オーバーライドを適用して型ロック
    Retype,
    /// 解析を完了まで再開（デッドコード除去を含む)
    ResumeAnalysis,
    /// ホストの名前オーバーライドを適用
    Rename,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Init,
        Stage::AnalyzeToBreakpoint,
        Stage::ArchPass,
        Stage::Retype,
        Stage::ResumeAnalysis,
        Stage::Rename,
    ];
}

/// パイプライン実行器
pub struct Pipeline;

impl Pipeline {
    /// 全ステージを順に実行
    pub fn run<E: Engine>(
        engine: &mut E,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
    ) -> Result<()> {
        for stage in Stage::ALL {
            Self::run_stage(engine, session, func, stage)?;
        }
        Ok(())
    }

    /// 単一ステージを実行
    pub fn run_stage<E: Engine>(
        engine: &mut E,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        stage: Stage,
    ) -> Result<()> {
        debug!("run stage {:?}", stage);
        match stage {
            Stage::Init => engine.prepare(session.arch),
            Stage::AnalyzeToBreakpoint => {
                let code = engine.analyze_until(session, func, Breakpoint::BeforeDeadCode)?;
                if code < 0 {
                    return Err(BridgeError::Analysis(code));
                }
                session.scope.proxy_mut().function_mut(func).state = AnalysisState::AtBreakpoint;
                Ok(())
            }
            Stage::ArchPass => {
                if let Some(register) = session.arch.spec().entry_seed_register() {
                    engine.apply_arch_pass(session, func, register)?;
                }
                Ok(())
            }
            Stage::Retype => Self::retype(session, func),
            Stage::ResumeAnalysis => {
                let code = engine.resume(session, func)?;
                if code < 0 {
                    return Err(BridgeError::Analysis(code));
                }
                session.scope.proxy_mut().function_mut(func).state = AnalysisState::Finished;
                Ok(())
            }
            Stage::Rename => Self::rename(session, func),
        }
    }

    /// 型オーバーライドの適用
    ///
    /// ローカルごとに定義pcを順に照会し、最初に見つかった
    /// オーバーライドを採用する（SSA分割で複数pcが同じ論理変数を
    /// 指す場合は先勝ち）。解決できない型名は致命エラーとして伝播する。
    fn retype(session: &mut ScopeSession<'_>, func: FunctionId) -> Result<()> {
        let address = session.scope.proxy().function(func).address;
        let Some(handle) = session.arch.symbol_database().find_function(address) else {
            return Ok(());
        };

        let count = session.scope.proxy().function(func).locals.len();
        for i in 0..count {
            let (space, pcs, locked) = {
                let local = &session.scope.proxy().function(func).locals[i];
                (
                    local.storage.space,
                    local.storage.pcs.clone(),
                    local.type_locked,
                )
            };
            if locked {
                continue;
            }

            let Some(descriptor) = pcs.iter().find_map(|pc| handle.find_type(*pc, space)) else {
                continue;
            };

            // 名前だけの参照は宣言済み型の解決を要求する（失敗は致命）
            let ty = if descriptor.is_named_reference() {
                session.types.find_by_name(session.arch, &descriptor.name)?
            } else {
                session.types.find_by_type_info(session.arch, &descriptor)?
            };
            let local = &mut session.scope.proxy_mut().function_mut(func).locals[i];
            debug!("retype local {} to {}", local.name, ty.display_name());
            local.data_type = Some(ty);
            local.type_locked = true;
        }
        Ok(())
    }

    /// 名前オーバーライドの適用
    ///
    /// スタック格納のローカルはまずフレームオフセットで照会し、
    /// それ以外は定義pcごとに (space, pc) で照会する。
    /// 衝突した名前は先勝ちで、後続には _0, _1 と接尾辞を振る。
    fn rename(session: &mut ScopeSession<'_>, func: FunctionId) -> Result<()> {
        let address = session.scope.proxy().function(func).address;
        let Some(handle) = session.arch.symbol_database().find_function(address) else {
            return Ok(());
        };

        let mut used: HashSet<String> = HashSet::new();
        let count = session.scope.proxy().function(func).locals.len();
        for i in 0..count {
            let (space, offset, addr_size, pcs) = {
                let local = &session.scope.proxy().function(func).locals[i];
                (
                    local.storage.space,
                    local.storage.offset,
                    local.storage.addr_size,
                    local.storage.pcs.clone(),
                )
            };

            let desired = Self::find_override_name(handle.as_ref(), space, offset, addr_size, &pcs);
            let Some(desired) = desired else {
                continue;
            };

            let unique = Self::uniquify(&mut used, &desired);
            let local = &mut session.scope.proxy_mut().function_mut(func).locals[i];
            debug!("rename local {} to {}", local.name, unique);
            local.name = unique;
        }
        Ok(())
    }

    fn find_override_name(
        handle: &dyn FunctionHandle,
        space: SpaceKind,
        offset: u64,
        addr_size: u32,
        pcs: &[u64],
    ) -> Option<String> {
        if space == SpaceKind::Stack {
            if let Some(name) = handle.find_stack_var(offset, addr_size) {
                return Some(name);
            }
        }
        pcs.iter().find_map(|pc| handle.find_name(*pc, space))
    }

    /// 衝突解決: 先勝ちで素の名前、以降は _0, _1 と接尾辞
    fn uniquify(used: &mut HashSet<String>, want: &str) -> String {
        if used.insert(want.to_string()) {
            return want.to_string();
        }
        let mut suffix = 0;
        loop {
            let candidate = format!("{}_{}", want, suffix);
            if used.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::architecture::{Architecture, CompilerSpec, Endianness, Language, Mode};
    use crate::bridge::backend::InMemoryDatabase;
    use crate::bridge::descriptor::{MemoryLocation, SymbolDescriptor, TypeDescriptor};
    use crate::bridge::engine::{LocalVariable, Rendered, TypeMeta};
    use crate::bridge::scope::{ScopeBridge, ScopeContract, ScopeSession};
    use crate::bridge::typemanager::TypeManager;

    /// 固定の結果コードを返すだけのエンジン
    struct StubEngine {
        analyze_code: i32,
        resume_code: i32,
    }

    impl StubEngine {
        fn ok() -> Self {
            Self {
                analyze_code: 0,
                resume_code: 0,
            }
        }
    }

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
            Ok(self.analyze_code)
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
            Ok(self.resume_code)
        }

        fn render(&self, _session: &ScopeSession<'_>, _func: FunctionId) -> Result<Rendered> {
            Ok(Rendered {
                text: String::new(),
                tokens: indexmap::IndexMap::new(),
            })
        }
    }

    fn setup() -> (Architecture, InMemoryDatabase, TypeManager, ScopeBridge) {
        let db = InMemoryDatabase::new();
        let arch = Architecture::build(
            CompilerSpec::new(Language::X86Windows, Endianness::Little, Mode::M64),
            Box::new(db.clone()),
            Box::new(db.clone()),
        )
        .unwrap();
        (arch, db, TypeManager::new(), ScopeBridge::new())
    }

    fn add_local(
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        name: &str,
        space: SpaceKind,
        offset: u64,
        pcs: Vec<u64>,
    ) {
        let storage = MemoryLocation::with_pcs(space, offset, 8, pcs);
        session
            .scope
            .proxy_mut()
            .function_mut(func)
            .locals
            .push(LocalVariable::new(name, storage));
    }

    #[test]
    fn test_negative_analysis_code_aborts() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();

        let mut engine = StubEngine {
            analyze_code: -2,
            resume_code: 0,
        };
        let result = Pipeline::run(&mut engine, &mut session, func);
        assert!(matches!(result, Err(BridgeError::Analysis(-2))));
    }

    #[test]
    fn test_retype_locks_local() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));
        db.add_type_override(
            0x1000,
            SpaceKind::Register,
            0x1008,
            TypeDescriptor::int("int32_t", 4),
        );

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();
        add_local(
            &mut session,
            func,
            "iVar1",
            SpaceKind::Register,
            0,
            vec![0x1004, 0x1008],
        );

        Pipeline::run_stage(&mut StubEngine::ok(), &mut session, func, Stage::Retype).unwrap();

        let local = &session.scope.proxy().function(func).locals[0];
        assert!(local.type_locked);
        assert_eq!(local.data_type.as_ref().unwrap().name, "int32_t");
    }

    #[test]
    fn test_retype_unknown_type_name_is_fatal() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));
        // どこにも宣言されていない型名を指すオーバーライド
        db.add_type_override(
            0x1000,
            SpaceKind::Register,
            0x1004,
            TypeDescriptor {
                name: "UNSEEN_T".to_string(),
                ..Default::default()
            },
        );

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();
        add_local(
            &mut session,
            func,
            "uVar1",
            SpaceKind::Register,
            0,
            vec![0x1004],
        );

        let result =
            Pipeline::run_stage(&mut StubEngine::ok(), &mut session, func, Stage::Retype);
        assert!(matches!(result, Err(BridgeError::UnknownType(name)) if name == "UNSEEN_T"));
    }

    #[test]
    fn test_rename_stack_var_priority() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));
        db.add_stack_var(0x1000, 0x8, 8, "counter");
        // 同じローカルに (space, pc) 名もあるがスタック名が優先される
        db.add_name_override(0x1000, SpaceKind::Stack, 0x1004, "loser");

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();
        add_local(
            &mut session,
            func,
            "local_8",
            SpaceKind::Stack,
            0x8,
            vec![0x1004],
        );

        Pipeline::run_stage(&mut StubEngine::ok(), &mut session, func, Stage::Rename).unwrap();
        assert_eq!(session.scope.proxy().function(func).locals[0].name, "counter");
    }

    #[test]
    fn test_rename_collision_suffixes() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));
        db.add_name_override(0x1000, SpaceKind::Register, 0x1004, "x");
        db.add_name_override(0x1000, SpaceKind::Register, 0x1008, "x");

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();
        add_local(
            &mut session,
            func,
            "iVar1",
            SpaceKind::Register,
            0,
            vec![0x1004],
        );
        add_local(
            &mut session,
            func,
            "iVar2",
            SpaceKind::Register,
            8,
            vec![0x1008],
        );

        Pipeline::run_stage(&mut StubEngine::ok(), &mut session, func, Stage::Rename).unwrap();
        let locals = &session.scope.proxy().function(func).locals;
        assert_eq!(locals[0].name, "x");
        assert_eq!(locals[1].name, "x_0");
    }

    #[test]
    fn test_full_run_reaches_finished() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();

        Pipeline::run(&mut StubEngine::ok(), &mut session, func).unwrap();
        assert_eq!(
            session.scope.proxy().function(func).state,
            AnalysisState::Finished
        );
    }

    #[test]
    fn test_uniquify_first_seen_wins() {
        let mut used = HashSet::new();
        assert_eq!(Pipeline::uniquify(&mut used, "x"), "x");
        assert_eq!(Pipeline::uniquify(&mut used, "x"), "x_0");
        assert_eq!(Pipeline::uniquify(&mut used, "x"), "x_1");
        assert_eq!(Pipeline::uniquify(&mut used, "y"), "y");
    }

    #[test]
    fn test_retype_skips_locked_local() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));
        db.add_type_override(
            0x1000,
            SpaceKind::Register,
            0x1004,
            TypeDescriptor::int("int32_t", 4),
        );

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1000).unwrap().unwrap();
        add_local(
            &mut session,
            func,
            "locked",
            SpaceKind::Register,
            0,
            vec![0x1004],
        );
        {
            let local = &mut session.scope.proxy_mut().function_mut(func).locals[0];
            local.data_type = Some(crate::bridge::engine::NativeType::new(
                "uint64_t",
                8,
                TypeMeta::Uint,
            ));
            local.type_locked = true;
        }

        Pipeline::run_stage(&mut StubEngine::ok(), &mut session, func, Stage::Retype).unwrap();
        let local = &session.scope.proxy().function(func).locals[0];
        assert_eq!(local.data_type.as_ref().unwrap().name, "uint64_t");
    }
}

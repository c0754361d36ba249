//! スコープブリッジ
//!
//! エンジンの未解決アドレスクエリをホストのシンボルデータベースへ
//! 仲介する。解決結果はエンジンの内部デフォルトスコープに実体化され、
//! 同じデコンパイル内の後続クエリはキャッシュにヒットする。
//! キャッシュはデコンパイル間で持ち越されない。

use tracing::info;

use super::architecture::Architecture;
use super::engine::{
    DefaultScope, FunctionId, NativeSymbol, NativeSymbolKind, NativeType, Prototype, SymbolId,
    TypeMeta,
};
use super::descriptor::SymbolKind;
use super::typemanager::TypeManager;
use crate::error::{BridgeError, Result};

/// エンジンがスコープに要求する操作の契約
///
/// 検索系のみ実装する。書き込み系・永続化系はエンジン側から
/// 呼ばれる経路が存在するが、ブリッジでは真実のソースがホスト側に
/// あるため意図的に未実装とし、明示的なエラーで即座に顕在化させる。
pub trait ScopeContract {
    /// アドレスの関数を解決（キャッシュ → バックエンド）
    fn find_function(&mut self, ea: u64) -> Result<Option<FunctionId>>;

    /// (addr, usepoint) 文脈でアドレスを包含するシンボルを解決
    fn find_container(&mut self, addr: u64, size: u32, usepoint: Option<u64>)
        -> Result<Option<SymbolId>>;

    /// アドレスの外部参照シンボルを解決
    fn find_external_ref(&mut self, addr: u64) -> Result<Option<SymbolId>>;

    /// アドレスのコードラベルを解決
    fn find_code_label(&mut self, addr: u64) -> Result<Option<SymbolId>>;

    /// 外部参照シンボルの指す先の関数を解決
    fn resolve_external_ref_function(&mut self, sym: SymbolId) -> Result<Option<FunctionId>>;

    /// 無名位置の表示名を合成
    fn build_variable_name(&self, addr: u64) -> String;

    /// 名前がスコープ内で既に使われているか
    fn is_name_used(&self, name: &str) -> bool;

    /// 未実装: シンボルの直接挿入
    fn insert_symbol(&mut self, sym: NativeSymbol) -> Result<SymbolId>;

    /// 未実装: アドレス範囲のシンボル削除
    fn remove_range(&mut self, first: u64, last: u64) -> Result<()>;

    /// 未実装: カテゴリ単位のクリア
    fn clear_category(&mut self, category: i32) -> Result<()>;

    /// 未実装: 一意名の生成
    fn make_name_unique(&mut self, name: &str) -> Result<String>;

    /// 未実装: スコープ状態の保存
    fn save_state(&mut self) -> Result<()>;

    /// 未実装: スコープ状態の復元
    fn restore_state(&mut self) -> Result<()>;
}

/// ブリッジが管理するスコープ状態
///
/// エンジンの内部デフォルトスコープへのプロキシ。簿記はすべて
/// プロキシに委譲し、ブリッジ自身は解決ロジックだけを持つ。
#[derive(Default)]
pub struct ScopeBridge {
    proxy: DefaultScope,
}

impl ScopeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// キャッシュ全体を破棄（各デコンパイル開始時）
    pub fn clear(&mut self) {
        self.proxy.clear();
    }

    pub fn proxy(&self) -> &DefaultScope {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut DefaultScope {
        &mut self.proxy
    }
}

/// 1回のデコンパイルを駆動するセッション
///
/// アーキテクチャ・型マネージャ・スコープを束ね、エンジンからの
/// 解決要求を1つの可変借用で受ける。
pub struct ScopeSession<'a> {
    pub arch: &'a Architecture,
    pub types: &'a mut TypeManager,
    pub scope: &'a mut ScopeBridge,
}

impl<'a> ScopeSession<'a> {
    pub fn new(
        arch: &'a Architecture,
        types: &'a mut TypeManager,
        scope: &'a mut ScopeBridge,
    ) -> Self {
        Self { arch, types, scope }
    }

    /// バックエンドの関数をデフォルトスコープに実体化
    ///
    /// プロトタイプは既定(void f(void))で実体化した直後に
    /// 型マネージャのupdateで再構築される。インジェクション対象の
    /// 関数名にはセマンティックスタブを付ける。
    fn materialize_function(&mut self, ea: u64) -> Result<Option<(SymbolId, FunctionId)>> {
        let Some(handle) = self.arch.symbol_database().find_function(ea) else {
            return Ok(None);
        };
        let desc = handle.symbol().clone();

        // バックエンド照会は範囲一致のため、別の内部アドレス経由で
        // 同じ関数に到達しうる。エントリで再確認して二重実体化を防ぐ
        if let Some(sym_id) = self.scope.proxy.symbol_at(desc.address) {
            if let Some(func_id) = self.scope.proxy.symbol(sym_id).function {
                return Ok(Some((sym_id, func_id)));
            }
        }

        let prototype = Prototype::unknown(self.types.void_type(), self.arch.default_cc());
        let (sym_id, func_id) = self
            .scope
            .proxy
            .add_function(desc.address, &desc.name, prototype);

        self.types
            .update(self.arch, self.scope.proxy.function_mut(func_id))?;

        if let Some(stub) = self.arch.find_injection(&desc.name) {
            info!("apply injection {} for function {}", stub, desc.name);
            self.scope.proxy.function_mut(func_id).semantic_stub = Some(stub.to_string());
        }

        if desc.is_read_only {
            self.scope.proxy.set_read_only(sym_id);
        }

        self.scope.proxy.add_map_point(sym_id, desc.address, None);
        Ok(Some((sym_id, func_id)))
    }
}

impl ScopeContract for ScopeSession<'_> {
    fn find_function(&mut self, ea: u64) -> Result<Option<FunctionId>> {
        if let Some(id) = self.scope.proxy.find_function(ea) {
            return Ok(Some(id));
        }
        Ok(self.materialize_function(ea)?.map(|(_, func)| func))
    }

    fn find_container(
        &mut self,
        addr: u64,
        size: u32,
        usepoint: Option<u64>,
    ) -> Result<Option<SymbolId>> {
        if let Some(id) = self.scope.proxy.find_container(addr, size, usepoint) {
            return Ok(Some(id));
        }

        let Some(desc) = self.arch.symbol_database().find(addr) else {
            return Ok(None);
        };

        let sym_id = match desc.kind {
            SymbolKind::Function => match self.materialize_function(addr)? {
                Some((sym, _)) => sym,
                None => return Ok(None),
            },
            SymbolKind::Import => self
                .scope
                .proxy
                .add_external_ref(desc.address, desc.address, &desc.name),
            SymbolKind::Label => self.scope.proxy.add_code_label(desc.address, &desc.name),
            SymbolKind::Other => {
                // ホストに型がなければクエリ幅の不明型で埋める
                let (ty, const_type) = match self.arch.type_factory().build_by_address(addr) {
                    Some(descriptor) => (
                        self.types.find_by_type_info(self.arch, &descriptor)?,
                        descriptor.is_const,
                    ),
                    None => (NativeType::new("", size as u64, TypeMeta::Unknown), false),
                };
                let sym = self.scope.proxy.add_data_symbol(desc.address, &desc.name, ty);
                // const修飾された型のデータは読み取り専用として扱う
                if const_type {
                    self.scope.proxy.set_read_only(sym);
                }
                sym
            }
        };

        if desc.is_read_only {
            self.scope.proxy.set_read_only(sym_id);
        }

        Ok(Some(self.scope.proxy.add_map_point(sym_id, addr, usepoint)))
    }

    fn find_external_ref(&mut self, addr: u64) -> Result<Option<SymbolId>> {
        if let Some(id) = self.scope.proxy.find_external_ref(addr) {
            return Ok(Some(id));
        }

        let Some(desc) = self.arch.symbol_database().find(addr) else {
            return Ok(None);
        };
        // 種類が合わないシンボルは見つからなかったとして扱う
        if desc.kind != SymbolKind::Import {
            return Ok(None);
        }

        let sym_id = self
            .scope
            .proxy
            .add_external_ref(desc.address, desc.address, &desc.name);
        Ok(Some(self.scope.proxy.add_map_point(sym_id, addr, None)))
    }

    fn find_code_label(&mut self, addr: u64) -> Result<Option<SymbolId>> {
        if let Some(id) = self.scope.proxy.find_code_label(addr) {
            return Ok(Some(id));
        }

        let Some(desc) = self.arch.symbol_database().find(addr) else {
            return Ok(None);
        };
        if desc.kind != SymbolKind::Label {
            return Ok(None);
        }

        let sym_id = self.scope.proxy.add_code_label(desc.address, &desc.name);
        Ok(Some(self.scope.proxy.add_map_point(sym_id, addr, None)))
    }

    fn resolve_external_ref_function(&mut self, sym: SymbolId) -> Result<Option<FunctionId>> {
        let symbol = self.scope.proxy.symbol(sym);
        if symbol.kind != NativeSymbolKind::ExternalRef {
            return Err(BridgeError::SymbolIsNotAFunction(symbol.name.clone()));
        }
        let Some(target) = symbol.ref_target else {
            return Ok(None);
        };
        self.find_function(target)
    }

    fn build_variable_name(&self, addr: u64) -> String {
        format!("unk_{:x}", addr)
    }

    fn is_name_used(&self, name: &str) -> bool {
        self.scope.proxy.is_name_used(name)
    }

    fn insert_symbol(&mut self, _sym: NativeSymbol) -> Result<SymbolId> {
        Err(BridgeError::UnsupportedOperation("insert_symbol"))
    }

    fn remove_range(&mut self, _first: u64, _last: u64) -> Result<()> {
        Err(BridgeError::UnsupportedOperation("remove_range"))
    }

    fn clear_category(&mut self, _category: i32) -> Result<()> {
        Err(BridgeError::UnsupportedOperation("clear_category"))
    }

    fn make_name_unique(&mut self, _name: &str) -> Result<String> {
        Err(BridgeError::UnsupportedOperation("make_name_unique"))
    }

    fn save_state(&mut self) -> Result<()> {
        Err(BridgeError::UnsupportedOperation("save_state"))
    }

    fn restore_state(&mut self) -> Result<()> {
        Err(BridgeError::UnsupportedOperation("restore_state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::architecture::{CompilerSpec, Endianness, Language, Mode};
    use crate::bridge::backend::InMemoryDatabase;
    use crate::bridge::descriptor::{FunctionDescriptor, SymbolDescriptor, TypeDescriptor};

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

    #[test]
    fn test_function_materialized_with_prototype() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "sum", 0x40));
        db.add_type_at(
            0x1000,
            TypeDescriptor::function(FunctionDescriptor {
                name: "sum".to_string(),
                return_type: TypeDescriptor::int("int", 4),
                param_types: vec![
                    TypeDescriptor::int("int", 4),
                    TypeDescriptor::int("int", 4),
                ],
                param_names: vec!["a".to_string(), "b".to_string()],
                calling_convention: None,
                is_variadic: false,
            }),
        );

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x1010).unwrap().unwrap();
        let native = session.scope.proxy.function(func);
        assert_eq!(native.name, "sum");
        assert_eq!(native.address, 0x1000);
        assert_eq!(native.prototype.param_names, vec!["a", "b"]);
        assert_eq!(native.prototype.return_type.name, "int");

        // 2回目はキャッシュヒットで同じIDが返る
        let again = session.find_function(0x1000).unwrap().unwrap();
        assert_eq!(func, again);
    }

    #[test]
    fn test_interior_addresses_share_one_function() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x1000, "f", 0x40));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        // 異なる内部アドレス経由でも同じ関数は一度だけ実体化される
        let first = session.find_function(0x1010).unwrap().unwrap();
        let second = session.find_function(0x1020).unwrap().unwrap();
        assert_eq!(first, second);

        let entry = session.find_function(0x1000).unwrap().unwrap();
        assert_eq!(first, entry);
    }

    #[test]
    fn test_const_type_data_is_read_only() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::data(0x4000, "g_limits"));
        db.add_type_at(0x4000, TypeDescriptor::int("int32_t", 4).constant());

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let sym = session.find_container(0x4000, 4, None).unwrap().unwrap();
        assert!(session.scope.proxy.symbol(sym).read_only);
        assert!(!session.scope.proxy_mut().classify_write(sym));
    }

    #[test]
    fn test_injection_attached() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::function(0x2000, "alloca_probe", 0x20));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let func = session.find_function(0x2000).unwrap().unwrap();
        assert_eq!(
            session.scope.proxy.function(func).semantic_stub.as_deref(),
            Some("alloca_probe")
        );
    }

    #[test]
    fn test_kind_mismatch_is_not_found() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::label(0x3000, "loc_3000"));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        // ラベルを外部参照として照会 → 種類不一致でNone
        assert!(session.find_external_ref(0x3000).unwrap().is_none());
        assert!(session.find_code_label(0x3000).unwrap().is_some());
    }

    #[test]
    fn test_container_fallback_unknown_type() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::data(0x4000, "g_blob"));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let sym = session.find_container(0x4000, 16, None).unwrap().unwrap();
        let ty = session.scope.proxy.symbol(sym).data_type.clone().unwrap();
        assert!(matches!(ty.meta, TypeMeta::Unknown));
        assert_eq!(ty.size, 16);
    }

    #[test]
    fn test_read_only_tagged() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::data(0x5000, "g_const").read_only());

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let sym = session.find_container(0x5000, 8, None).unwrap().unwrap();
        assert!(session.scope.proxy.symbol(sym).read_only);
        assert!(!session.scope.proxy.classify_write(sym));
    }

    #[test]
    fn test_external_ref_resolves_target_function() {
        let (arch, db, mut types, mut scope) = setup();
        db.add_symbol(SymbolDescriptor::import(0x6000, "memcpy"));

        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);
        let sym = session.find_external_ref(0x6000).unwrap().unwrap();
        // 指す先に関数実体がなければNone
        assert!(session.resolve_external_ref_function(sym).unwrap().is_none());

        // 関数でないシンボルに対してはエラー
        let label = session.scope.proxy_mut().add_code_label(0x8000, "loc_8000");
        assert!(matches!(
            session.resolve_external_ref_function(label),
            Err(BridgeError::SymbolIsNotAFunction(_))
        ));
    }

    #[test]
    fn test_unsupported_operations() {
        let (arch, _db, mut types, mut scope) = setup();
        let mut session = ScopeSession::new(&arch, &mut types, &mut scope);

        assert!(matches!(
            session.remove_range(0, 0x1000),
            Err(BridgeError::UnsupportedOperation("remove_range"))
        ));
        assert!(matches!(
            session.make_name_unique("x"),
            Err(BridgeError::UnsupportedOperation("make_name_unique"))
        ));
        assert!(matches!(
            session.save_state(),
            Err(BridgeError::UnsupportedOperation("save_state"))
        ));
    }

    #[test]
    fn test_variable_name_fallback() {
        let (arch, _db, mut types, mut scope) = setup();
        let session = ScopeSession::new(&arch, &mut types, &mut scope);
        assert_eq!(session.build_variable_name(0x401a2b), "unk_401a2b");
    }
}

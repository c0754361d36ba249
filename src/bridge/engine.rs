//! デコンパイラエンジン側のネイティブモデルと拡張ポイント
//!
//! エンジン本体（CFG/SSA構築・最適化）は外部コラボレータであり
//! ここでは観測可能な表面だけを定義する:
//! ネイティブ型グラフ、ネイティブシンボル、内部デフォルトスコープ、
//! ブレークポイント付き解析を駆動するEngineトレイト。

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use super::architecture::Architecture;
use super::descriptor::MemoryLocation;
use super::scope::ScopeSession;
use crate::error::Result;

/// ネイティブ型のメタ分類
#[derive(Debug, Clone)]
pub enum TypeMeta {
    Void,
    Bool,
    Int,
    Uint,
    Float,
    Char,
    Unicode,
    /// 分類できない型（アドレスサイズにフォールバック）
    Unknown,
    Pointer(Rc<NativeType>),
    Array { element: Rc<NativeType>, count: u64 },
    Struct { fields: Vec<NativeField> },
    /// 関数コード型
    Code(Box<Prototype>),
}

/// ネイティブ構造体フィールド（宣言順・バイトオフセット）
#[derive(Debug, Clone)]
pub struct NativeField {
    pub offset: u64,
    pub name: String,
    pub ty: Rc<NativeType>,
}

/// デコンパイラのネイティブ型グラフのノード
///
/// 名前で重複排除される。同名の型は同一インスタンスを共有する。
#[derive(Debug, Clone)]
pub struct NativeType {
    pub name: String,
    pub size: u64,
    pub meta: TypeMeta,
}

impl NativeType {
    pub fn new(name: impl Into<String>, size: u64, meta: TypeMeta) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            size,
            meta,
        })
    }

    /// C風の表示名
    pub fn display_name(&self) -> String {
        match &self.meta {
            TypeMeta::Pointer(inner) => format!("{} *", inner.display_name()),
            _ => self.name.clone(),
        }
    }
}

/// 関数プロトタイプ
#[derive(Debug, Clone)]
pub struct Prototype {
    pub return_type: Rc<NativeType>,
    pub params: Vec<Rc<NativeType>>,
    pub param_names: Vec<String>,
    pub calling_convention: String,
    pub is_variadic: bool,
}

impl Prototype {
    /// 既定のプロトタイプ: void f(void)
    pub fn unknown(void_type: Rc<NativeType>, calling_convention: impl Into<String>) -> Self {
        Self {
            return_type: void_type,
            params: Vec::new(),
            param_names: Vec::new(),
            calling_convention: calling_convention.into(),
            is_variadic: false,
        }
    }
}

/// ネイティブシンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeSymbolKind {
    Function,
    /// 外部参照（ターゲットアドレス付き）
    ExternalRef,
    Label,
    Data,
}

/// シンボルID（デフォルトスコープのアリーナインデックス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub usize);

/// 関数ID（デフォルトスコープの関数アリーナインデックス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

/// デコンパイラネイティブのシンボル
#[derive(Debug, Clone)]
pub struct NativeSymbol {
    pub name: String,
    pub address: u64,
    pub kind: NativeSymbolKind,
    /// 外部参照のターゲットアドレス
    pub ref_target: Option<u64>,
    pub data_type: Option<Rc<NativeType>>,
    pub read_only: bool,
    pub type_locked: bool,
    /// 関数シンボルの場合の関数データ
    pub function: Option<FunctionId>,
}

/// 解析の進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Raw,
    /// デッドコード除去直前で停止中
    AtBreakpoint,
    Finished,
}

/// ローカル変数（関数ローカルスコープのエントリ）
#[derive(Debug, Clone)]
pub struct LocalVariable {
    pub name: String,
    pub storage: MemoryLocation,
    pub data_type: Option<Rc<NativeType>>,
    /// 型ロック: 後続の推論はこの型を上書きできない
    pub type_locked: bool,
}

impl LocalVariable {
    pub fn new(name: impl Into<String>, storage: MemoryLocation) -> Self {
        Self {
            name: name.into(),
            storage,
            data_type: None,
            type_locked: false,
        }
    }
}

/// ネイティブ関数データ（エンジンのFuncdata相当）
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: String,
    pub address: u64,
    pub prototype: Prototype,
    /// 生バイトに現れない挙動をモデル化するセマンティックスタブ名
    pub semantic_stub: Option<String>,
    pub locals: Vec<LocalVariable>,
    pub state: AnalysisState,
}

/// エンジン解析のブレークポイント
///
/// オーバーライドは (space, pc) にキー付けされるため、
/// デッドコード除去がpcを消す前に同期する必要がある。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    BeforeDeadCode,
}

/// プリティプリンタ出力
///
/// 表示識別子 → 格納位置のマップはホストの対話的リネーム・
/// リタイプの往復を支える出力契約の一部。
#[derive(Debug, Clone)]
pub struct Rendered {
    pub text: String,
    pub tokens: IndexMap<String, MemoryLocation>,
}

/// デコンパイラの内部デフォルトスコープ
///
/// ブリッジが簿記を委譲する先。シンボル・関数のアリーナと
/// (address, usepoint) のマップポイントキャッシュを持つ。
/// キャッシュ全体は各デコンパイル開始時に破棄・再構築される。
#[derive(Default)]
pub struct DefaultScope {
    symbols: Vec<NativeSymbol>,
    functions: Vec<NativeFunction>,
    /// (address, usepoint) → シンボル。usepointなしはアドレス単独の登録
    map_points: HashMap<(u64, Option<u64>), SymbolId>,
    by_address: HashMap<u64, SymbolId>,
}

impl DefaultScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// キャッシュ全体を破棄（各デコンパイル開始時）
    pub fn clear(&mut self) {
        self.symbols.clear();
        self.functions.clear();
        self.map_points.clear();
        self.by_address.clear();
    }

    pub fn symbol(&self, id: SymbolId) -> &NativeSymbol {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut NativeSymbol {
        &mut self.symbols[id.0]
    }

    pub fn function(&self, id: FunctionId) -> &NativeFunction {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut NativeFunction {
        &mut self.functions[id.0]
    }

    fn push_symbol(&mut self, sym: NativeSymbol) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.by_address.insert(sym.address, id);
        self.symbols.push(sym);
        id
    }

    /// 関数シンボルと関数データを実体化
    pub fn add_function(
        &mut self,
        addr: u64,
        name: &str,
        prototype: Prototype,
    ) -> (SymbolId, FunctionId) {
        let func_id = FunctionId(self.functions.len());
        self.functions.push(NativeFunction {
            name: name.to_string(),
            address: addr,
            prototype,
            semantic_stub: None,
            locals: Vec::new(),
            state: AnalysisState::Raw,
        });
        let sym_id = self.push_symbol(NativeSymbol {
            name: name.to_string(),
            address: addr,
            kind: NativeSymbolKind::Function,
            ref_target: None,
            data_type: None,
            read_only: false,
            type_locked: false,
            function: Some(func_id),
        });
        (sym_id, func_id)
    }

    /// 外部参照シンボルを実体化
    pub fn add_external_ref(&mut self, addr: u64, target: u64, name: &str) -> SymbolId {
        self.push_symbol(NativeSymbol {
            name: name.to_string(),
            address: addr,
            kind: NativeSymbolKind::ExternalRef,
            ref_target: Some(target),
            data_type: None,
            read_only: false,
            type_locked: false,
            function: None,
        })
    }

    /// コードラベルを実体化
    pub fn add_code_label(&mut self, addr: u64, name: &str) -> SymbolId {
        self.push_symbol(NativeSymbol {
            name: name.to_string(),
            address: addr,
            kind: NativeSymbolKind::Label,
            ref_target: None,
            data_type: None,
            read_only: false,
            type_locked: false,
            function: None,
        })
    }

    /// データシンボルを実体化
    pub fn add_data_symbol(&mut self, addr: u64, name: &str, ty: Rc<NativeType>) -> SymbolId {
        self.push_symbol(NativeSymbol {
            name: name.to_string(),
            address: addr,
            kind: NativeSymbolKind::Data,
            ref_target: None,
            data_type: Some(ty),
            read_only: false,
            type_locked: false,
            function: None,
        })
    }

    /// マッピングを (addr, usepoint) で登録
    /// 同じ文脈の後続クエリはブリッジではなくこのキャッシュにヒットする
    pub fn add_map_point(&mut self, sym: SymbolId, addr: u64, usepoint: Option<u64>) -> SymbolId {
        self.map_points.insert((addr, usepoint), sym);
        sym
    }

    /// キャッシュ済み関数を検索
    pub fn find_function(&self, addr: u64) -> Option<FunctionId> {
        let id = self.by_address.get(&addr)?;
        self.symbols[id.0].function
    }

    /// アドレスに実体化済みのシンボルを検索
    pub fn symbol_at(&self, addr: u64) -> Option<SymbolId> {
        self.by_address.get(&addr).copied()
    }

    /// (addr, usepoint) キャッシュを検索
    pub fn find_container(&self, addr: u64, _size: u32, usepoint: Option<u64>) -> Option<SymbolId> {
        self.map_points
            .get(&(addr, usepoint))
            .or_else(|| self.map_points.get(&(addr, None)))
            .copied()
    }

    /// キャッシュ済み外部参照を検索
    pub fn find_external_ref(&self, addr: u64) -> Option<SymbolId> {
        let id = *self.by_address.get(&addr)?;
        (self.symbols[id.0].kind == NativeSymbolKind::ExternalRef).then_some(id)
    }

    /// キャッシュ済みコードラベルを検索
    pub fn find_code_label(&self, addr: u64) -> Option<SymbolId> {
        let id = *self.by_address.get(&addr)?;
        (self.symbols[id.0].kind == NativeSymbolKind::Label).then_some(id)
    }

    pub fn is_name_used(&self, name: &str) -> bool {
        self.symbols.iter().any(|s| s.name == name)
    }

    /// 読み取り専用属性を設定
    pub fn set_read_only(&mut self, id: SymbolId) {
        self.symbols[id.0].read_only = true;
    }

    /// シンボルへの書き込み分類を試みる
    ///
    /// 読み取り専用シンボルは書き込み分類を拒否する
    pub fn classify_write(&mut self, id: SymbolId) -> bool {
        !self.symbols[id.0].read_only
    }
}

/// デコンパイラエンジンの拡張ポイント
///
/// 解析は2段階: ブレークポイントまでのユニバーサル解析と
/// その後の完了までの再開。負の結果コードは解析の中断を意味する。
pub trait Engine {
    /// アーキテクチャ固有の一回限りのセットアップ
    fn prepare(&mut self, arch: &Architecture) -> Result<()>;

    /// ユニバーサル解析をブレークポイントまで実行
    /// 未解決アドレスはスコープセッション経由で解決される
    fn analyze_until(
        &mut self,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        breakpoint: Breakpoint,
    ) -> Result<i32>;

    /// アーキテクチャ固有パス（例: 関数エントリの暗黙レジスタシード）
    fn apply_arch_pass(
        &mut self,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        seed_register: &str,
    ) -> Result<()>;

    /// 解析を完了まで再開（デッドコード除去を含む）
    fn resume(&mut self, session: &mut ScopeSession<'_>, func: FunctionId) -> Result<i32>;

    /// レンダリングテキストとトークン位置マップを生成
    fn render(&self, session: &ScopeSession<'_>, func: FunctionId) -> Result<Rendered>;
}

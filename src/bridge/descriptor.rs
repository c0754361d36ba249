//! ホスト非依存の記述子
//!
//! バックエンドデータベースの事実（シンボル・型・格納位置）を
//! 読み取り専用スナップショットとして表現する

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// アドレス空間の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceKind {
    /// メモリ空間
    Ram,
    /// レジスタ空間
    Register,
    /// スタック空間
    Stack,
    /// 一時変数空間
    Unique,
    /// 定数空間
    Const,
}

impl SpaceKind {
    /// 空間名（オーバーライドキーの一部として使用）
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceKind::Ram => "ram",
            SpaceKind::Register => "register",
            SpaceKind::Stack => "stack",
            SpaceKind::Unique => "unique",
            SpaceKind::Const => "const",
        }
    }
}

/// 格納位置
///
/// デコンパイラIRとホストオーバーライドの結合キー。
/// 同じレジスタが異なるpcで別の論理変数を指すため、
/// オーバーライドは常に (space, pc) でキー付けする。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryLocation {
    /// アドレス空間の種類
    pub space: SpaceKind,
    /// 空間内オフセット
    pub offset: u64,
    /// アドレスサイズ（バイト）
    pub addr_size: u32,
    /// この位置が定義・使用されるプログラムカウンタのリスト
    pub pcs: Vec<u64>,
}

impl MemoryLocation {
    pub fn new(space: SpaceKind, offset: u64, addr_size: u32) -> Self {
        Self {
            space,
            offset,
            addr_size,
            pcs: Vec::new(),
        }
    }

    pub fn with_pcs(space: SpaceKind, offset: u64, addr_size: u32, pcs: Vec<u64>) -> Self {
        Self {
            space,
            offset,
            addr_size,
            pcs,
        }
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:#x}", self.space.as_str(), self.offset)
    }
}

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Label,
    Import,
    Other,
}

/// シンボル記述子
///
/// クエリごとに生成される不変スナップショット。
/// アドレスとクエリ世代以外の同一性を持たない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    /// シンボルのアドレス
    pub address: u64,
    /// シンボル名
    pub name: String,
    /// シンボルの種類
    pub kind: SymbolKind,
    /// 読み取り専用領域に属するか
    pub is_read_only: bool,
    /// 関数の場合のみ: 関数サイズ（バイト）
    pub function_size: Option<u64>,
}

impl SymbolDescriptor {
    pub fn function(address: u64, name: impl Into<String>, size: u64) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Function,
            is_read_only: false,
            function_size: Some(size),
        }
    }

    pub fn label(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Label,
            is_read_only: false,
            function_size: None,
        }
    }

    pub fn import(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Import,
            is_read_only: false,
            function_size: None,
        }
    }

    pub fn data(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Other,
            is_read_only: false,
            function_size: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// 関数シンボルのサイズを取得
    ///
    /// 関数以外のシンボルに対してはSymbolIsNotAFunction
    pub fn function_size(&self) -> Result<u64> {
        if self.kind != SymbolKind::Function {
            return Err(BridgeError::SymbolIsNotAFunction(self.name.clone()));
        }
        self.function_size
            .ok_or_else(|| BridgeError::SymbolIsNotAFunction(self.name.clone()))
    }
}

/// 構造体フィールド記述子（宣言順・バイトオフセット付き）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructFieldDescriptor {
    pub offset: u64,
    pub name: String,
    pub ty: TypeDescriptor,
}

/// 配列ビュー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    /// 要素型
    pub element: Box<TypeDescriptor>,
    /// 要素数
    pub count: u64,
}

/// 関数型記述子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// 関数名
    pub name: String,
    /// 戻り値型
    pub return_type: TypeDescriptor,
    /// パラメータ型（宣言順）
    pub param_types: Vec<TypeDescriptor>,
    /// ホストが提供するパラメータ名（空も可）
    pub param_names: Vec<String>,
    /// 呼び出し規約名（ツールチェーン表記のまま）
    pub calling_convention: Option<String>,
    /// 可変長引数か
    pub is_variadic: bool,
}

/// 型記述子
///
/// フラグ＋ビュー形式。バックエンドはポインタとintを同時に
/// フラグ付けできるため閉じたenumでは表現しない。
/// ディスパッチ優先順位はTypeManagerが規定する（ポインタが常に勝つ）。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// 型名（デコンパイラは名前で重複排除する）
    pub name: String,
    /// サイズ（バイト）
    pub size: u64,
    pub is_int: bool,
    pub is_bool: bool,
    pub is_float: bool,
    pub is_char: bool,
    pub is_unicode: bool,
    pub is_void: bool,
    pub is_const: bool,
    /// Some ならポインタ型（指し先）
    pub pointee: Option<Box<TypeDescriptor>>,
    /// Some なら配列型
    pub array: Option<ArrayDescriptor>,
    /// Some なら構造体型（フィールドは宣言順）
    pub fields: Option<Vec<StructFieldDescriptor>>,
    /// Some なら関数型
    pub func: Option<Box<FunctionDescriptor>>,
}

impl TypeDescriptor {
    pub fn int(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_int: true,
            ..Default::default()
        }
    }

    pub fn boolean(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_bool: true,
            ..Default::default()
        }
    }

    pub fn float(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_float: true,
            ..Default::default()
        }
    }

    pub fn character(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 1,
            is_int: true,
            is_char: true,
            ..Default::default()
        }
    }

    pub fn unicode(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_unicode: true,
            ..Default::default()
        }
    }

    pub fn void(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_void: true,
            ..Default::default()
        }
    }

    pub fn pointer(name: impl Into<String>, size: u64, pointee: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            size,
            pointee: Some(Box::new(pointee)),
            ..Default::default()
        }
    }

    pub fn array(name: impl Into<String>, size: u64, element: TypeDescriptor, count: u64) -> Self {
        Self {
            name: name.into(),
            size,
            array: Some(ArrayDescriptor {
                element: Box::new(element),
                count,
            }),
            ..Default::default()
        }
    }

    pub fn structure(name: impl Into<String>, size: u64, fields: Vec<StructFieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            size,
            fields: Some(fields),
            ..Default::default()
        }
    }

    pub fn function(descriptor: FunctionDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            size: 1,
            func: Some(Box::new(descriptor)),
            ..Default::default()
        }
    }

    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    /// 名前だけで型を参照する記述子か
    /// （保存済みオーバーライドは宣言済み型を名前で指すことがある）
    pub fn is_named_reference(&self) -> bool {
        !self.name.is_empty()
            && !(self.is_int
                || self.is_bool
                || self.is_float
                || self.is_char
                || self.is_unicode
                || self.is_void)
            && self.pointee.is_none()
            && self.array.is_none()
            && self.fields.is_none()
            && self.func.is_none()
    }

    pub fn is_pointer(&self) -> bool {
        self.pointee.is_some()
    }

    pub fn is_function(&self) -> bool {
        self.func.is_some()
    }
}

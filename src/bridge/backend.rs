//! バックエンドファクトリ
//!
//! ホストが実装するプル型インターフェース。
//! シンボル・型・オーバーライドのクエリはすべてここを経由する。
//! InMemoryDatabaseはテストとデモ用の完全な実装。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::descriptor::{MemoryLocation, SpaceKind, SymbolDescriptor, TypeDescriptor};

/// シンボルデータベースのプルインターフェース
pub trait SymbolInfoFactory {
    /// アドレスにあるシンボルを検索
    fn find(&self, ea: u64) -> Option<SymbolDescriptor>;

    /// アドレスを含む関数のハンドルを検索
    /// （エントリポイントに限らず関数内の任意アドレスで一致する）
    fn find_function(&self, ea: u64) -> Option<Box<dyn FunctionHandle>>;
}

/// 関数単位のオーバーライドストア
///
/// 名前・型オーバーライドのキーは厳密に (space, pc)。
/// デコンパイラ自身の (space, pc) アドレッシングを正確に再現しないと
/// オーバーライドは静かに適用されない。
pub trait FunctionHandle {
    /// 関数シンボルの記述子
    fn symbol(&self) -> &SymbolDescriptor;

    /// スタックフレーム内の変数名を検索
    fn find_stack_var(&self, offset: u64, addr_size: u32) -> Option<String>;

    /// (space, pc) に保存された名前オーバーライドを検索
    fn find_name(&self, pc: u64, space: SpaceKind) -> Option<String>;

    /// 名前オーバーライドを保存（位置の全定義pcに対して）
    fn save_name(&self, loc: &MemoryLocation, name: &str);

    /// (space, pc) に保存された型オーバーライドを検索
    fn find_type(&self, pc: u64, space: SpaceKind) -> Option<TypeDescriptor>;

    /// 型オーバーライドを保存（位置の全定義pcに対して）
    fn save_type(&self, loc: &MemoryLocation, ty: &TypeDescriptor);

    /// 型オーバーライドを削除
    fn clear_type(&self, loc: &MemoryLocation) -> bool;
}

/// 型データベースのプルインターフェース
pub trait TypeInfoFactory {
    /// アドレスに紐付く型を構築
    fn build_by_address(&self, ea: u64) -> Option<TypeDescriptor>;

    /// 名前で型を構築
    fn build_by_name(&self, name: &str) -> Option<TypeDescriptor>;
}

/// 関数レコード（インメモリ実装用）
#[derive(Debug, Clone, Default)]
struct FunctionRecord {
    stack_vars: HashMap<(u64, u32), String>,
    names: HashMap<(SpaceKind, u64), String>,
    types: HashMap<(SpaceKind, u64), TypeDescriptor>,
}

#[derive(Default)]
struct DbInner {
    symbols: BTreeMap<u64, SymbolDescriptor>,
    functions: BTreeMap<u64, FunctionRecord>,
    types_by_addr: HashMap<u64, TypeDescriptor>,
    types_by_name: HashMap<String, TypeDescriptor>,
}

/// インメモリのシンボル・型データベース
///
/// SymbolInfoFactoryとTypeInfoFactoryを同時に実装する。
/// クローンは同じ内部状態を共有する（ハンドルの書き戻し用）。
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<Mutex<DbInner>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// シンボルを登録。関数シンボルにはオーバーライドストアも作られる
    pub fn add_symbol(&self, desc: SymbolDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        if desc.function_size.is_some() {
            inner.functions.entry(desc.address).or_default();
        }
        inner.symbols.insert(desc.address, desc);
    }

    /// アドレスに型を紐付ける
    pub fn add_type_at(&self, ea: u64, ty: TypeDescriptor) {
        self.inner.lock().unwrap().types_by_addr.insert(ea, ty);
    }

    /// 名前で型を登録
    pub fn add_named_type(&self, ty: TypeDescriptor) {
        self.inner
            .lock()
            .unwrap()
            .types_by_name
            .insert(ty.name.clone(), ty);
    }

    /// スタック変数名を登録
    pub fn add_stack_var(&self, func: u64, offset: u64, addr_size: u32, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .functions
            .entry(func)
            .or_default()
            .stack_vars
            .insert((offset, addr_size), name.to_string());
    }

    /// (space, pc) キーの名前オーバーライドを登録
    pub fn add_name_override(&self, func: u64, space: SpaceKind, pc: u64, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .functions
            .entry(func)
            .or_default()
            .names
            .insert((space, pc), name.to_string());
    }

    /// (space, pc) キーの型オーバーライドを登録
    pub fn add_type_override(&self, func: u64, space: SpaceKind, pc: u64, ty: TypeDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .functions
            .entry(func)
            .or_default()
            .types
            .insert((space, pc), ty);
    }
}

impl SymbolInfoFactory for InMemoryDatabase {
    fn find(&self, ea: u64) -> Option<SymbolDescriptor> {
        self.inner.lock().unwrap().symbols.get(&ea).cloned()
    }

    fn find_function(&self, ea: u64) -> Option<Box<dyn FunctionHandle>> {
        let inner = self.inner.lock().unwrap();
        // 関数範囲 [start, start + size) にeaを含むエントリを検索
        let (entry, desc) = inner
            .symbols
            .range(..=ea)
            .rev()
            .find(|(addr, desc)| match desc.function_size {
                Some(size) => ea >= **addr && ea < **addr + size,
                None => false,
            })
            .map(|(addr, desc)| (*addr, desc.clone()))?;
        drop(inner);

        Some(Box::new(InMemoryFunctionHandle {
            inner: Arc::clone(&self.inner),
            entry,
            descriptor: desc,
        }))
    }
}

impl TypeInfoFactory for InMemoryDatabase {
    fn build_by_address(&self, ea: u64) -> Option<TypeDescriptor> {
        self.inner.lock().unwrap().types_by_addr.get(&ea).cloned()
    }

    fn build_by_name(&self, name: &str) -> Option<TypeDescriptor> {
        self.inner.lock().unwrap().types_by_name.get(name).cloned()
    }
}

/// InMemoryDatabase用の関数ハンドル
struct InMemoryFunctionHandle {
    inner: Arc<Mutex<DbInner>>,
    entry: u64,
    descriptor: SymbolDescriptor,
}

impl FunctionHandle for InMemoryFunctionHandle {
    fn symbol(&self) -> &SymbolDescriptor {
        &self.descriptor
    }

    fn find_stack_var(&self, offset: u64, addr_size: u32) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .functions
            .get(&self.entry)?
            .stack_vars
            .get(&(offset, addr_size))
            .cloned()
    }

    fn find_name(&self, pc: u64, space: SpaceKind) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .functions
            .get(&self.entry)?
            .names
            .get(&(space, pc))
            .cloned()
    }

    fn save_name(&self, loc: &MemoryLocation, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.functions.entry(self.entry).or_default();
        for pc in &loc.pcs {
            record.names.insert((loc.space, *pc), name.to_string());
        }
    }

    fn find_type(&self, pc: u64, space: SpaceKind) -> Option<TypeDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .functions
            .get(&self.entry)?
            .types
            .get(&(space, pc))
            .cloned()
    }

    fn save_type(&self, loc: &MemoryLocation, ty: &TypeDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.functions.entry(self.entry).or_default();
        for pc in &loc.pcs {
            record.types.insert((loc.space, *pc), ty.clone());
        }
    }

    fn clear_type(&self, loc: &MemoryLocation) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.functions.get_mut(&self.entry) else {
            return false;
        };
        let mut cleared = false;
        for pc in &loc.pcs {
            cleared |= record.types.remove(&(loc.space, *pc)).is_some();
        }
        cleared
    }
}

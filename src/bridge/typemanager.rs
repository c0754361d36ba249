//! 型マネージャ
//!
//! ホスト記述子 → デコンパイラネイティブ型グラフへの一方向変換。
//! 逆方向（デコンパイラ推論 → ホスト）はアクションパイプラインの
//! リネーム・リタイプパスの責務であってここではない。

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{error, info, warn};

use super::architecture::Architecture;
use super::descriptor::{FunctionDescriptor, TypeDescriptor};
use super::engine::{NativeFunction, NativeType, NativeField, Prototype, TypeMeta};
use crate::error::{BridgeError, Result};

/// 型マネージャ
///
/// 名前キーのレジストリで型の同一性をデコンパイル中一定に保つ。
/// レジストリは各デコンパイル開始時にコア型まで破棄される。
pub struct TypeManager {
    /// 名前 → ネイティブ型（エンジンは名前で重複排除する）
    registry: IndexMap<String, Rc<NativeType>>,
    /// 解析中の型名（再帰ガード）
    in_progress: HashSet<String>,
}

impl TypeManager {
    pub fn new() -> Self {
        let mut manager = Self {
            registry: IndexMap::new(),
            in_progress: HashSet::new(),
        };
        manager.register_core_types();
        manager
    }

    /// メモをコア型まで破棄（各デコンパイル開始時）
    pub fn clear(&mut self) {
        self.registry.clear();
        self.in_progress.clear();
        self.register_core_types();
    }

    /// エンジンのコア型を登録
    fn register_core_types(&mut self) {
        let core: &[(&str, u64, TypeMeta)] = &[
            ("void", 1, TypeMeta::Void),
            ("bool", 1, TypeMeta::Bool),
            ("char", 1, TypeMeta::Char),
            ("int8_t", 1, TypeMeta::Int),
            ("int16_t", 2, TypeMeta::Int),
            ("int32_t", 4, TypeMeta::Int),
            ("int64_t", 8, TypeMeta::Int),
            ("uint8_t", 1, TypeMeta::Uint),
            ("uint16_t", 2, TypeMeta::Uint),
            ("uint32_t", 4, TypeMeta::Uint),
            ("uint64_t", 8, TypeMeta::Uint),
            ("float", 4, TypeMeta::Float),
            ("double", 8, TypeMeta::Float),
        ];
        for (name, size, meta) in core {
            self.registry
                .insert(name.to_string(), NativeType::new(*name, *size, meta.clone()));
        }
    }

    /// 既定の void 型
    pub fn void_type(&self) -> Rc<NativeType> {
        Rc::clone(&self.registry["void"])
    }

    /// 登録済み型を名前で取得（レジストリのみ）
    pub fn lookup(&self, name: &str) -> Option<Rc<NativeType>> {
        self.registry.get(name).cloned()
    }

    /// 名前から型を解決
    ///
    /// レジストリ → バックエンド build_by_name の順。
    /// どちらにもなければUnknownType（現在のデコンパイルに致命的）
    pub fn find_by_name(&mut self, arch: &Architecture, name: &str) -> Result<Rc<NativeType>> {
        if let Some(cached) = self.registry.get(name) {
            return Ok(Rc::clone(cached));
        }

        let descriptor = arch
            .type_factory()
            .build_by_name(name)
            .ok_or_else(|| BridgeError::UnknownType(name.to_string()))?;

        self.parse_type_info(arch, &descriptor)
    }

    /// 記述子から型を解決（名前でメモ化）
    ///
    /// 同名の型が既にこのセッションで構築済みならそのまま返し
    /// 関数全体で型同一性を安定に保つ
    pub fn find_by_type_info(
        &mut self,
        arch: &Architecture,
        descriptor: &TypeDescriptor,
    ) -> Result<Rc<NativeType>> {
        if !descriptor.name.is_empty() {
            if let Some(cached) = self.registry.get(&descriptor.name) {
                return Ok(Rc::clone(cached));
            }
        }
        self.parse_type_info(arch, descriptor)
    }

    /// 記述子をネイティブ型へ変換
    ///
    /// ディスパッチ優先順位は固定:
    /// ポインタ（プリミティブ判定より先。記述子はポインタとintを
    /// 同時にフラグ付けできるためポインタが勝つ）→
    /// bool/unicode/char/int/float → 構造体 → void → 関数 → 配列 →
    /// 不明型フォールバック
    pub fn parse_type_info(
        &mut self,
        arch: &Architecture,
        descriptor: &TypeDescriptor,
    ) -> Result<Rc<NativeType>> {
        let name = descriptor.name.clone();

        if let Some(pointee) = &descriptor.pointee {
            let target = self.resolve_recursive(arch, pointee)?;
            // ポインタ幅はアーキテクチャの既定コード空間から
            let ty = NativeType::new(name, arch.addr_size() as u64, TypeMeta::Pointer(target));
            return Ok(self.register(ty));
        }

        if descriptor.is_bool {
            return Ok(self.register(NativeType::new(name, descriptor.size, TypeMeta::Bool)));
        }

        if descriptor.is_unicode {
            return Ok(self.register(NativeType::new(name, descriptor.size, TypeMeta::Unicode)));
        }

        if descriptor.is_char {
            return Ok(self.register(NativeType::new(name, 1, TypeMeta::Char)));
        }

        if descriptor.is_int {
            return Ok(self.register(NativeType::new(name, descriptor.size, TypeMeta::Int)));
        }

        if descriptor.is_float {
            return Ok(self.register(NativeType::new(name, descriptor.size, TypeMeta::Float)));
        }

        if let Some(fields) = &descriptor.fields {
            self.in_progress.insert(name.clone());
            let mut resolved = Vec::with_capacity(fields.len());
            // フィールドは宣言順・宣言オフセットのまま
            for field in fields {
                let ty = self.resolve_recursive(arch, &field.ty);
                if ty.is_err() {
                    self.in_progress.remove(&name);
                }
                resolved.push(NativeField {
                    offset: field.offset,
                    name: field.name.clone(),
                    ty: ty?,
                });
            }
            self.in_progress.remove(&name);
            let ty = NativeType::new(
                name,
                descriptor.size,
                TypeMeta::Struct { fields: resolved },
            );
            return Ok(self.register(ty));
        }

        if descriptor.is_void {
            // サイズ0のvoidはアーキテクチャのアドレスサイズに置換
            let mut size = descriptor.size;
            if size == 0 {
                size = arch.addr_size() as u64;
            }
            return Ok(self.register(NativeType::new(name, size, TypeMeta::Void)));
        }

        if let Some(func) = &descriptor.func {
            let prototype = self.parse_func(arch, func)?;
            let ty = NativeType::new(name, 1, TypeMeta::Code(Box::new(prototype)));
            return Ok(self.register(ty));
        }

        if let Some(array) = &descriptor.array {
            let element = self.resolve_recursive(arch, &array.element)?;
            // 要素数0の配列はエンジンが扱えないため要素へのポインタに退化
            if array.count == 0 {
                let ty = NativeType::new(name, arch.addr_size() as u64, TypeMeta::Pointer(element));
                return Ok(self.register(ty));
            }
            let ty = NativeType::new(
                name,
                descriptor.size,
                TypeMeta::Array {
                    element,
                    count: array.count,
                },
            );
            return Ok(self.register(ty));
        }

        // 分類不能: アドレスサイズの不明型として記述子の生の名前を使う
        let ty = NativeType::new(name, arch.addr_size() as u64, TypeMeta::Unknown);
        Ok(self.register(ty))
    }

    /// 関数記述子からプロトタイプを構築
    ///
    /// 呼び出し規約はフォールバックチェーンで解決する:
    /// 指名規約 → アーキテクチャ既定 → 最初に登録されたモデル。
    /// ツールチェーンの規約表記はエンジンの登録モデル名と一致しないことがある
    pub fn parse_func(
        &mut self,
        arch: &Architecture,
        descriptor: &FunctionDescriptor,
    ) -> Result<Prototype> {
        let return_type = self.resolve_recursive(arch, &descriptor.return_type)?;

        let mut params = Vec::with_capacity(descriptor.param_types.len());
        for ty in &descriptor.param_types {
            params.push(self.resolve_recursive(arch, ty)?);
        }

        // 自動生成パラメータ名（ホスト名はupdateが条件付きで上書きする）
        let param_names: Vec<String> = (1..=params.len()).map(|i| format!("param_{}", i)).collect();

        let calling_convention =
            self.resolve_convention(arch, descriptor.calling_convention.as_deref(), &descriptor.name);

        Ok(Prototype {
            return_type,
            params,
            param_names,
            calling_convention,
            is_variadic: descriptor.is_variadic,
        })
    }

    /// 指名された規約名をエンジンの登録モデルに対して解決
    fn named_convention(arch: &Architecture, cc: &str) -> Result<String> {
        if arch.has_convention(cc) {
            Ok(cc.to_string())
        } else {
            Err(BridgeError::UnknownCallingConvention(cc.to_string()))
        }
    }

    /// 呼び出し規約のフォールバックチェーン
    fn resolve_convention(
        &self,
        arch: &Architecture,
        requested: Option<&str>,
        function_name: &str,
    ) -> String {
        if let Some(cc) = requested {
            match Self::named_convention(arch, cc) {
                Ok(cc) => return cc,
                // 非致命。フォールバックチェーンを起動する
                Err(err) => warn!("{} for {}", err, function_name),
            }
        }

        let fallback = if arch.has_convention(arch.default_cc()) {
            arch.default_cc().to_string()
        } else {
            arch.conventions()[0].clone()
        };
        info!(
            "use {} as default calling convention for {}",
            fallback, function_name
        );
        fallback
    }

    /// 関数シンボルの初回実体化時に呼ばれる
    ///
    /// 関数アドレスの型記述子を解決し（関数ポインタは1段階たどる）、
    /// プロトタイプを再構築する。ホスト提供のパラメータ名は
    /// 解決済みパラメータ数と完全一致する場合のみ上書きする。
    /// ずれた名前はデコンパイラの自動生成名より有害なため黙って無視する
    pub fn update(&mut self, arch: &Architecture, func: &mut NativeFunction) -> Result<()> {
        let Some(descriptor) = arch.type_factory().build_by_address(func.address) else {
            return Ok(());
        };

        // シンボルに関数型でなく関数ポインタ型を置くバックエンドがある
        let descriptor = match descriptor.pointee {
            Some(pointee) => *pointee,
            None => descriptor,
        };

        let Some(func_desc) = &descriptor.func else {
            error!(
                "unable to update function {}: symbol is not a function",
                func.name
            );
            return Ok(());
        };

        let mut prototype = self.parse_func(arch, func_desc)?;

        let host_names = &func_desc.param_names;
        if host_names.len() == prototype.params.len() {
            prototype.param_names = host_names.clone();
        }

        func.prototype = prototype;
        Ok(())
    }

    /// 再帰解決: 名前メモ → 解析中ガード → 新規変換
    fn resolve_recursive(
        &mut self,
        arch: &Architecture,
        descriptor: &TypeDescriptor,
    ) -> Result<Rc<NativeType>> {
        if !descriptor.name.is_empty() {
            if let Some(cached) = self.registry.get(&descriptor.name) {
                return Ok(Rc::clone(cached));
            }
            // 自己参照構造体: 解析中の名前は不透明な前方宣言として扱う
            if self.in_progress.contains(&descriptor.name) {
                return Ok(NativeType::new(
                    descriptor.name.clone(),
                    arch.addr_size() as u64,
                    TypeMeta::Unknown,
                ));
            }
        }
        self.parse_type_info(arch, descriptor)
    }

    /// 名前付き型をレジストリに登録（匿名型は登録しない）
    fn register(&mut self, ty: Rc<NativeType>) -> Rc<NativeType> {
        if !ty.name.is_empty() {
            self.registry.insert(ty.name.clone(), Rc::clone(&ty));
        }
        ty
    }
}

impl Default for TypeManager {
    fn default() -> Self {
        Self::new()
    }
}

//! アーキテクチャインスタンス
//!
//! 1回のデコンパイルを超えて共有される唯一の可変リソース。
//! コンパイラ仕様・呼び出し規約モデル・インジェクションマップ・
//! バックエンドファクトリを集約する。アンビエントシングルトンは使わず、
//! 必要なコンポーネントへ参照で渡す。

use std::collections::HashMap;

use tracing::info;

use super::backend::{SymbolInfoFactory, TypeInfoFactory};
use crate::error::{BridgeError, Result};

/// 対象言語（コンパイラファミリ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    X86,
    X86Gcc,
    X86Windows,
    Arm,
    Ppc,
    Mips,
}

/// エンディアン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// アドレッシングモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    M16,
    M32,
    M64,
}

/// コンパイラ仕様
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerSpec {
    pub language: Language,
    pub endianness: Endianness,
    pub mode: Mode,
}

impl CompilerSpec {
    pub fn new(language: Language, endianness: Endianness, mode: Mode) -> Self {
        Self {
            language,
            endianness,
            mode,
        }
    }

    /// エンジンの言語ID文字列を計算
    pub fn language_id(&self) -> String {
        let (language, meta) = match self.language {
            Language::X86 => ("x86", "default".to_string()),
            Language::X86Gcc => ("x86", "default:gcc".to_string()),
            Language::X86Windows => ("x86", "default:windows".to_string()),
            Language::Arm => {
                if self.mode == Mode::M64 {
                    ("AARCH64", "v8A:default".to_string())
                } else {
                    ("ARM", "v7".to_string())
                }
            }
            Language::Ppc => ("PowerPC", "default".to_string()),
            Language::Mips => ("MIPS", "default".to_string()),
        };

        let endianness = match self.endianness {
            Endianness::Little => "LE",
            Endianness::Big => "BE",
        };

        let mode = match self.mode {
            Mode::M16 => "16",
            Mode::M32 => "32",
            Mode::M64 => "64",
        };

        format!("{}:{}:{}:{}", language, endianness, mode, meta)
    }

    /// アドレスサイズ（バイト）
    pub fn addr_size(&self) -> u32 {
        match self.mode {
            Mode::M16 => 2,
            Mode::M32 => 4,
            Mode::M64 => 8,
        }
    }

    /// 既定の呼び出し規約
    pub fn default_cc(&self) -> &'static str {
        match self.language {
            Language::X86 | Language::X86Gcc => "__stdcall",
            Language::X86Windows => "__fastcall",
            Language::Arm => {
                if self.mode == Mode::M32 {
                    "__stdcall"
                } else {
                    "__cdecl"
                }
            }
            Language::Ppc | Language::Mips => "__stdcall",
        }
    }

    /// エンジンに登録済みの呼び出し規約モデル（登録順）
    pub fn conventions(&self) -> Vec<&'static str> {
        match self.language {
            Language::X86 | Language::X86Gcc | Language::X86Windows => {
                vec!["__stdcall", "__cdecl", "__fastcall", "__thiscall"]
            }
            Language::Arm => vec!["__stdcall", "__cdecl"],
            Language::Ppc | Language::Mips => vec!["__stdcall"],
        }
    }

    /// 関数エントリで暗黙にシードされるレジスタ
    /// （MIPSはt9が関数エントリアドレスを保持する前提で解析する）
    pub fn entry_seed_register(&self) -> Option<&'static str> {
        match self.language {
            Language::Mips => Some("t9"),
            _ => None,
        }
    }
}

/// アーキテクチャインスタンス
pub struct Architecture {
    spec: CompilerSpec,
    language_id: String,
    default_cc: String,
    conventions: Vec<String>,
    /// 関数名 → セマンティックスタブ名
    injections: HashMap<String, String>,
    symbols: Box<dyn SymbolInfoFactory>,
    types: Box<dyn TypeInfoFactory>,
}

impl Architecture {
    /// アーキテクチャを構築
    ///
    /// 登録済み規約が1つもない仕様はBackendUnavailable
    /// （デコンパイル開始前の環境障害）
    pub fn build(
        spec: CompilerSpec,
        symbols: Box<dyn SymbolInfoFactory>,
        types: Box<dyn TypeInfoFactory>,
    ) -> Result<Self> {
        let conventions: Vec<String> = spec.conventions().iter().map(|s| s.to_string()).collect();
        if conventions.is_empty() {
            return Err(BridgeError::BackendUnavailable(format!(
                "no calling convention model registered for {}",
                spec.language_id()
            )));
        }

        let language_id = spec.language_id();
        info!("load engine with language id: {}", language_id);

        let mut arch = Self {
            spec,
            language_id,
            default_cc: spec.default_cc().to_string(),
            conventions,
            injections: HashMap::new(),
            symbols,
            types,
        };

        // x86ファミリの既知のセマンティックスタブ
        if matches!(
            spec.language,
            Language::X86 | Language::X86Gcc | Language::X86Windows
        ) {
            arch.add_injection("alloca_probe", "alloca_probe");
            arch.add_injection("guard_dispatch_icall_fptr", "guard_dispatch_icall");
        }

        Ok(arch)
    }

    pub fn spec(&self) -> &CompilerSpec {
        &self.spec
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn addr_size(&self) -> u32 {
        self.spec.addr_size()
    }

    pub fn default_cc(&self) -> &str {
        &self.default_cc
    }

    /// 登録済み呼び出し規約モデル（登録順）
    pub fn conventions(&self) -> &[String] {
        &self.conventions
    }

    pub fn has_convention(&self, name: &str) -> bool {
        self.conventions.iter().any(|c| c == name)
    }

    /// インジェクションを登録（プロセスインスタンス全体で有効）
    pub fn add_injection(&mut self, function_name: impl Into<String>, stub: impl Into<String>) {
        self.injections.insert(function_name.into(), stub.into());
    }

    /// 関数名に対応するセマンティックスタブを検索
    pub fn find_injection(&self, function_name: &str) -> Option<&str> {
        self.injections.get(function_name).map(String::as_str)
    }

    pub fn injections(&self) -> &HashMap<String, String> {
        &self.injections
    }

    pub fn symbol_database(&self) -> &dyn SymbolInfoFactory {
        self.symbols.as_ref()
    }

    pub fn type_factory(&self) -> &dyn TypeInfoFactory {
        self.types.as_ref()
    }
}

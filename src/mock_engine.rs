//! スクリプト駆動のモックエンジン
//!
//! 実エンジン（CFG/SSA構築・最適化）の代役。関数アドレスごとの
//! スクリプトに従ってローカル変数の発見・参照解決・デッドコード除去を
//! 再現する。ブリッジ側の契約検証とデモCLIがこれを使う。

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use crate::bridge::architecture::Architecture;
use crate::bridge::engine::{Breakpoint, Engine, FunctionId, LocalVariable, Rendered};
use crate::bridge::descriptor::MemoryLocation;
use crate::bridge::scope::{ScopeContract, ScopeSession};
use crate::error::Result;

/// 関数1つ分の解析スクリプト
#[derive(Debug, Clone, Default)]
pub struct FunctionScript {
    /// ユニバーサル解析で発見されるローカル変数
    pub locals: Vec<LocalVariable>,
    /// 解析中に解決されるデータ参照 (addr, size, usepoint)
    pub data_refs: Vec<(u64, u32, Option<u64>)>,
    /// 解析中に解決される呼び出し先
    pub call_targets: Vec<u64>,
    /// 解析中に解決されるジャンプ先ラベル
    pub label_refs: Vec<u64>,
    /// 解析中に解決される外部参照
    pub extern_refs: Vec<u64>,
    /// デッドコード除去で消えるpc
    pub dead_pcs: Vec<u64>,
    /// レンダリング本体の行
    pub body: Vec<String>,
}

/// スクリプト駆動のモックエンジン
#[derive(Default)]
pub struct MockEngine {
    scripts: HashMap<u64, FunctionScript>,
    /// Some なら解析が常にこの結果コードを返す
    pub forced_code: Option<i32>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 関数アドレスにスクリプトを登録
    pub fn script(&mut self, address: u64, script: FunctionScript) -> &mut Self {
        self.scripts.insert(address, script);
        self
    }

    pub fn with_script(mut self, address: u64, script: FunctionScript) -> Self {
        self.scripts.insert(address, script);
        self
    }

    /// 全解析を固定の結果コードで失敗させる
    pub fn with_forced_code(mut self, code: i32) -> Self {
        self.forced_code = Some(code);
        self
    }
}

impl Engine for MockEngine {
    fn prepare(&mut self, arch: &Architecture) -> Result<()> {
        debug!("mock engine prepared for {}", arch.language_id());
        Ok(())
    }

    fn analyze_until(
        &mut self,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        _breakpoint: Breakpoint,
    ) -> Result<i32> {
        if let Some(code) = self.forced_code {
            return Ok(code);
        }

        let address = session.scope.proxy().function(func).address;
        let Some(script) = self.scripts.get(&address).cloned() else {
            return Ok(0);
        };

        // 未解決参照をブリッジ経由で解決する（実エンジンの挙動の再現）
        for target in &script.call_targets {
            session.find_function(*target)?;
        }
        for (addr, size, usepoint) in &script.data_refs {
            session.find_container(*addr, *size, *usepoint)?;
        }
        for addr in &script.label_refs {
            session.find_code_label(*addr)?;
        }
        for addr in &script.extern_refs {
            if let Some(sym) = session.find_external_ref(*addr)? {
                session.resolve_external_ref_function(sym)?;
            }
        }

        let native = session.scope.proxy_mut().function_mut(func);
        native.locals = script.locals;
        Ok(0)
    }

    fn apply_arch_pass(
        &mut self,
        session: &mut ScopeSession<'_>,
        func: FunctionId,
        seed_register: &str,
    ) -> Result<()> {
        let name = &session.scope.proxy().function(func).name;
        debug!("seed register {} at entry of {}", seed_register, name);
        Ok(())
    }

    fn resume(&mut self, session: &mut ScopeSession<'_>, func: FunctionId) -> Result<i32> {
        if let Some(code) = self.forced_code {
            return Ok(code);
        }

        let address = session.scope.proxy().function(func).address;
        let Some(script) = self.scripts.get(&address) else {
            return Ok(0);
        };
        let dead = script.dead_pcs.clone();

        // デッドpcを落とし、全定義が死んだ非ロックのローカルを除去する。
        // 型ロックされたローカルは除去を生き延びる
        let native = session.scope.proxy_mut().function_mut(func);
        for local in &mut native.locals {
            local.storage.pcs.retain(|pc| !dead.contains(pc));
        }
        native
            .locals
            .retain(|local| !local.storage.pcs.is_empty() || local.type_locked);
        Ok(0)
    }

    fn render(&self, session: &ScopeSession<'_>, func: FunctionId) -> Result<Rendered> {
        let native = session.scope.proxy().function(func);
        let proto = &native.prototype;

        let params = if proto.params.is_empty() {
            "void".to_string()
        } else {
            proto
                .params
                .iter()
                .zip(proto.param_names.iter())
                .map(|(ty, name)| format!("{} {}", ty.display_name(), name))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut text = format!(
            "{} {}({})\n{{\n",
            proto.return_type.display_name(),
            native.name,
            params
        );

        let mut tokens: IndexMap<String, MemoryLocation> = IndexMap::new();
        for local in &native.locals {
            let ty = local
                .data_type
                .as_ref()
                .map(|t| t.display_name())
                .unwrap_or_else(|| "undefined8".to_string());
            text.push_str(&format!("  {} {};\n", ty, local.name));
            tokens.insert(local.name.clone(), local.storage.clone());
        }

        if let Some(script) = self.scripts.get(&native.address) {
            for line in &script.body {
                text.push_str(&format!("  {}\n", line));
            }
        }
        text.push_str("}\n");

        Ok(Rendered { text, tokens })
    }
}

use anyhow::Result;
use clap::Parser;
use tracing::info;

use decomp_bridge::bridge::{
    Architecture, CompilerSpec, Decompiler, Endianness, FunctionDescriptor, InMemoryDatabase,
    Language, MemoryLocation, Mode, SpaceKind, SymbolDescriptor, TypeDescriptor,
};
use decomp_bridge::bridge::engine::LocalVariable;
use decomp_bridge::mock_engine::{FunctionScript, MockEngine};

/// デコンパイラブリッジのデモCLI
///
/// インメモリのシンボルデータベースとモックエンジンで
/// ブリッジの一連の動作（解決・リタイプ・リネーム・レンダリング）を確認する
#[derive(Parser, Debug)]
#[command(name = "decomp-bridge", version, about = "decompiler bridge demo")]
struct Args {
    /// デコンパイルするアドレス（16進可）
    #[arg(long, default_value = "0x1000", value_parser = parse_address)]
    address: u64,

    /// 結果をJSONで出力
    #[arg(long)]
    json: bool,
}

fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

/// デモ用のサンプルデータベースを構築
fn sample_database() -> InMemoryDatabase {
    let db = InMemoryDatabase::new();

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

    // ホスト側で付けられたローカル変数名
    db.add_stack_var(0x1000, 0x8, 8, "total");
    db.add_type_override(
        0x1000,
        SpaceKind::Stack,
        0x1010,
        TypeDescriptor::int("int32_t", 4),
    );

    // 読み取り専用のグローバルテーブル
    db.add_symbol(SymbolDescriptor::data(0x2000, "g_weights").read_only());
    db.add_type_at(
        0x2000,
        TypeDescriptor::array("", 16, TypeDescriptor::int("int32_t", 4), 4),
    );

    db
}

fn sample_engine() -> MockEngine {
    MockEngine::new().with_script(
        0x1000,
        FunctionScript {
            locals: vec![LocalVariable::new(
                "local_8",
                MemoryLocation::with_pcs(SpaceKind::Stack, 0x8, 8, vec![0x1010]),
            )],
            data_refs: vec![(0x2000, 16, Some(0x1020))],
            body: vec![
                "total = a + b + g_weights[0];".to_string(),
                "return total;".to_string(),
            ],
            ..Default::default()
        },
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let db = sample_database();
    let arch = Architecture::build(
        CompilerSpec::new(Language::X86Windows, Endianness::Little, Mode::M64),
        Box::new(db.clone()),
        Box::new(db.clone()),
    )?;
    info!("bridge ready, language id: {}", arch.language_id());

    let mut decompiler = Decompiler::new(arch, sample_engine())?;
    let result = decompiler.decompile(args.address);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(text) = &result.text {
        print!("{}", text);
        for (token, loc) in &result.symbols {
            info!("symbol {} stored at {}", token, loc);
        }
    } else if let Some(err) = &result.error {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }

    Ok(())
}

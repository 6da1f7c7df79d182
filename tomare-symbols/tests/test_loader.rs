//! ELFローダーとシンボルテーブルのテスト
//!
//! テストバイナリ自身をモジュールとしてロードして解決する

use std::hint::black_box;
use tomare_symbols::{ElfLoader, LineInfoProvider, SymbolLookup, SymbolResolver, SymbolTable};

#[no_mangle]
#[inline(never)]
pub extern "C" fn tomare_loader_marker() -> u64 {
    black_box(0x7a7a)
}

/// PIEなら適当なベースにロードされたものとして扱う
fn load_base(loader: &ElfLoader) -> u64 {
    if loader.is_pie() {
        0x5555_0000_0000
    } else {
        0
    }
}

#[test]
fn test_load_test_binary() {
    // マーカー関数をリンクさせる
    let marker: extern "C" fn() -> u64 = black_box(tomare_loader_marker);
    assert_eq!(marker(), 0x7a7a);

    let exe = std::env::current_exe().expect("Failed to locate test binary");
    let loader = ElfLoader::load(&exe).expect("Failed to load test binary");
    assert_eq!(loader.path(), exe.as_path());

    let resolver = SymbolResolver::new(&loader).expect("Failed to create symbol resolver");
    let offset = resolver
        .resolve("tomare_loader_marker")
        .expect("Failed to find marker symbol");
    let sym = resolver.reverse_resolve(offset).expect("Failed to reverse resolve marker");
    assert_eq!(sym.name, "tomare_loader_marker");
}

#[test]
fn test_symbol_table_module() {
    let exe = std::env::current_exe().expect("Failed to locate test binary");
    let loader = ElfLoader::load(&exe).expect("Failed to load test binary");
    let base = load_base(&loader);

    let mut table = SymbolTable::new();
    table
        .add_module("test_loader", &exe, base, u64::MAX / 2)
        .expect("Failed to add module");
    assert_eq!(table.module_count(), 1);

    let addr = table
        .resolve("tomare_loader_marker")
        .expect("Failed to resolve marker");
    let sym = table.symbol_for(addr).expect("Failed to find symbol for marker");
    assert_eq!(sym.name.as_deref(), Some("tomare_loader_marker"));
    assert_eq!(sym.module_name.as_deref(), Some("test_loader"));
    assert_eq!(sym.address, addr);

    // 行情報があればこのファイルを指す
    if let Some(file) = sym.file_name {
        assert!(file.ends_with("test_loader.rs"), "unexpected file {}", file);
        assert!(sym.line_number.is_some());
    }

    let found = table.find_matching("tomare_loader_*");
    assert!(found.iter().any(|s| s.address == addr));
}

#[test]
fn test_line_info_provider() {
    let exe = std::env::current_exe().expect("Failed to locate test binary");
    let loader = ElfLoader::load(&exe).expect("Failed to load test binary");
    if !loader.has_line_info() {
        return;
    }

    let lines = LineInfoProvider::new(&loader).expect("Failed to create line info provider");
    let resolver = SymbolResolver::new(&loader).expect("Failed to create symbol resolver");
    let offset = resolver
        .resolve("tomare_loader_marker")
        .expect("Failed to find marker symbol");

    if let Some(line) = lines.lookup(offset).expect("Failed to look up line") {
        assert!(line.file.ends_with("test_loader.rs"));
        assert!(line.line > 0);
    }
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(ElfLoader::parse(b"not an elf file".to_vec()).is_err());
    assert!(ElfLoader::load("/nonexistent/tomare/binary").is_err());
}

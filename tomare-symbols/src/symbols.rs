//! シンボル解決機能

use crate::{ElfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use regex::Regex;
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// モジュール内のアドレス（PIEの場合はオフセット）
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: impl Into<String>, address: u64, size: u64) -> Self {
        let name = name.into();
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// アドレスがこのシンボルの範囲内にあるかどうか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address.saturating_add(self.size.max(1))
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }

    name.to_string()
}

/// 1つのモジュールのシンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> symbols_by_address のインデックス
    index_by_name: HashMap<String, usize>,
    /// アドレス順にソートされたシンボル
    symbols_by_address: Vec<Symbol>,
    /// PIE（Position Independent Executable）かどうか
    is_pie: bool,
}

impl SymbolResolver {
    /// ELFローダーからシンボル解決を作成する
    ///
    /// 関数とデータのシンボルだけを対象にし、静的シンボルテーブルが空の場合は
    /// 動的シンボルテーブルを使います（stripされた共有ライブラリ）。
    pub fn new(loader: &ElfLoader) -> Result<Self> {
        let object_file = loader.object_file();

        let mut symbols: Vec<Symbol> = object_file
            .symbols()
            .filter_map(Self::convert)
            .collect();

        if symbols.is_empty() {
            symbols = object_file
                .dynamic_symbols()
                .filter_map(Self::convert)
                .collect();
        }

        Ok(Self::from_symbols(symbols, loader.is_pie()))
    }

    /// シンボル一覧から直接作成する
    pub fn from_symbols(mut symbols: Vec<Symbol>, is_pie: bool) -> Self {
        symbols.sort_by_key(|s| s.address);

        let index_by_name = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        Self {
            index_by_name,
            symbols_by_address: symbols,
            is_pie,
        }
    }

    fn convert<'data, S: ObjectSymbol<'data>>(symbol: S) -> Option<Symbol> {
        if !matches!(symbol.kind(), SymbolKind::Text | SymbolKind::Data) || symbol.is_undefined() {
            return None;
        }

        let name = symbol.name().ok()?;
        if name.is_empty() {
            return None;
        }

        Some(Symbol::new(name, symbol.address(), symbol.size()))
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.index_by_name
            .get(symbol)
            .map(|&i| self.symbols_by_address[i].address)
    }

    /// アドレスからシンボルを解決する（最も近い手前のシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = match self.symbols_by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => return Some(&self.symbols_by_address[idx]),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let sym = &self.symbols_by_address[idx];
        // サイズ情報がないシンボルは最も近いものとして扱う
        if sym.size == 0 || sym.contains(addr) {
            Some(sym)
        } else {
            None
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// 正規表現にマッチするシンボルを検索する
    /// マングル名とデマングル名の両方で検索する
    pub fn find_matching<'a>(&'a self, pattern: &'a Regex) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.symbols_by_address
            .iter()
            .filter(move |s| pattern.is_match(&s.name) || pattern.is_match(&s.demangled_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols(
            vec![
                Symbol::new("open_config", 0x2000, 0x40),
                Symbol::new("main", 0x1000, 0x80),
                Symbol::new("_ZN6tomare4main17h0123456789abcdefE", 0x3000, 0),
            ],
            true,
        )
    }

    #[test]
    fn test_resolve_by_name() {
        let r = resolver();
        assert_eq!(r.resolve("main"), Some(0x1000));
        assert_eq!(r.resolve("open_config"), Some(0x2000));
        assert_eq!(r.resolve("missing"), None);
    }

    #[test]
    fn test_reverse_resolve_within_size() {
        let r = resolver();
        assert_eq!(r.reverse_resolve(0x1010).map(|s| s.name.as_str()), Some("main"));
        assert_eq!(r.reverse_resolve(0x2000).map(|s| s.name.as_str()), Some("open_config"));
        // mainの範囲外でopen_configより手前
        assert!(r.reverse_resolve(0x1900).is_none());
        assert!(r.reverse_resolve(0x10).is_none());
    }

    #[test]
    fn test_sizeless_symbol_is_nearest() {
        let r = resolver();
        let sym = r.reverse_resolve(0x3100).unwrap();
        assert_eq!(sym.display_name(), "tomare::main");
    }

    #[test]
    fn test_find_matching_demangled() {
        let r = resolver();
        let re = Regex::new("^tomare::").unwrap();
        let found: Vec<_> = r.find_matching(&re).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, 0x3000);
    }
}

//! ロード済みモジュールのシンボルテーブル

use crate::{ElfLoader, LineInfoProvider, Result, Symbol, SymbolResolver};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::path::Path;

/// アドレスに対応するデバッグシンボル
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugSymbol {
    #[serde(serialize_with = "serialize_hex")]
    pub address: u64,
    pub name: Option<String>,
    pub module_name: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
}

impl DebugSymbol {
    /// シンボル情報のないアドレスのみのデバッグシンボル
    pub fn unknown(address: u64) -> Self {
        Self {
            address,
            name: None,
            module_name: None,
            file_name: None,
            line_number: None,
        }
    }
}

fn serialize_hex<S: Serializer>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:#x}", value))
}

/// デバッグシンボルの解決
///
/// エンジンはこのトレイトを通してのみシンボル情報を参照します。
pub trait SymbolLookup: Send + Sync {
    /// アドレスからデバッグシンボルを解決する
    fn symbol_for(&self, addr: u64) -> Option<DebugSymbol>;

    /// グロブパターンにマッチするシンボルを検索する
    fn find_matching(&self, pattern: &str) -> Vec<DebugSymbol>;
}

struct ModuleSymbols {
    name: String,
    base: u64,
    size: u64,
    resolver: SymbolResolver,
    lines: Option<LineInfoProvider>,
}

impl ModuleSymbols {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base.saturating_add(self.size)
    }

    /// 実行時アドレスをシンボルテーブル上のアドレスに変換
    fn to_symbol_space(&self, addr: u64) -> u64 {
        if self.resolver.is_pie() {
            addr - self.base
        } else {
            addr
        }
    }

    fn to_runtime(&self, addr: u64) -> u64 {
        if self.resolver.is_pie() {
            self.base.wrapping_add(addr)
        } else {
            addr
        }
    }

    fn debug_symbol(&self, runtime_addr: u64, symbol: Option<&Symbol>) -> DebugSymbol {
        let lookup_addr = self.to_symbol_space(runtime_addr);

        let line = self.lines.as_ref().and_then(|lines| match lines.lookup(lookup_addr) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Line lookup failed in {}: {}", self.name, e);
                None
            }
        });

        DebugSymbol {
            address: runtime_addr,
            name: symbol.map(|s| s.display_name().to_string()),
            module_name: Some(self.name.clone()),
            file_name: line.as_ref().map(|l| l.file.clone()),
            line_number: line.map(|l| l.line),
        }
    }
}

/// ロード済みモジュールのシンボルテーブル
#[derive(Default)]
pub struct SymbolTable {
    modules: Vec<ModuleSymbols>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ELFファイルからモジュールのシンボルを追加する
    pub fn add_module<P: AsRef<Path>>(&mut self, name: &str, path: P, base: u64, size: u64) -> Result<()> {
        let loader = ElfLoader::load(path)?;
        let resolver = SymbolResolver::new(&loader)?;

        let lines = if loader.has_line_info() {
            match LineInfoProvider::new(&loader) {
                Ok(lines) => Some(lines),
                Err(e) => {
                    tracing::warn!("Failed to load line info for {}: {}", name, e);
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            "Loaded {} symbols for {} at {:#x}",
            resolver.all_symbols().count(),
            name,
            base
        );

        self.modules.push(ModuleSymbols {
            name: name.to_string(),
            base,
            size,
            resolver,
            lines,
        });
        Ok(())
    }

    /// シンボル一覧からモジュールを追加する（アドレスはモジュール先頭からのオフセット）
    pub fn add_symbols(&mut self, name: &str, base: u64, size: u64, symbols: Vec<Symbol>) {
        self.modules.push(ModuleSymbols {
            name: name.to_string(),
            base,
            size,
            resolver: SymbolResolver::from_symbols(symbols, true),
            lines: None,
        });
    }

    /// シンボル名から実行時アドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.modules
            .iter()
            .find_map(|m| m.resolver.resolve(name).map(|addr| m.to_runtime(addr)))
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl SymbolLookup for SymbolTable {
    fn symbol_for(&self, addr: u64) -> Option<DebugSymbol> {
        let module = self.modules.iter().find(|m| m.contains(addr))?;
        let symbol = module.resolver.reverse_resolve(module.to_symbol_space(addr));
        Some(module.debug_symbol(addr, symbol))
    }

    fn find_matching(&self, pattern: &str) -> Vec<DebugSymbol> {
        let regex = match glob_to_regex(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!("Invalid symbol pattern {:?}: {}", pattern, e);
                return Vec::new();
            }
        };

        self.modules
            .iter()
            .flat_map(|m| {
                m.resolver
                    .find_matching(&regex)
                    .map(move |s| m.debug_symbol(m.to_runtime(s.address), Some(s)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// グロブパターン（`*` と `?`）を正規表現に変換する
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| anyhow::anyhow!("Failed to compile pattern {:?}: {}", pattern, e))
}

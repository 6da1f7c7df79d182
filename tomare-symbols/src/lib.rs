//! Tomare シンボル解決
//!
//! このクレートは、ターゲットプロセスにロードされたモジュールのELFシンボルテーブルと
//! DWARF行情報から、アドレスに対応するデバッグシンボルを解決する機能を提供します。
//! コントローラへ送るブレークポイント情報やフック情報のシンボル表示に使われます。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod table;

pub use loader::ElfLoader;
pub use symbols::{Symbol, SymbolResolver};
pub use lines::{LineInfo, LineInfoProvider};
pub use table::{glob_to_regex, DebugSymbol, SymbolLookup, SymbolTable};

/// シンボル解決の結果型
pub type Result<T> = anyhow::Result<T>;

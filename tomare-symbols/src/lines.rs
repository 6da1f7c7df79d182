//! ソース行情報

use crate::{ElfLoader, Result};
use std::sync::Mutex;

type Addr2LineContext =
    addr2line::Context<gimli::EndianSlice<'static, gimli::RunTimeEndian>>;

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// ソース行情報の取得
///
/// addr2lineのコンテキストは内部で遅延パースを行うため、スレッド間で共有できるように
/// ロックで保護しています。
pub struct LineInfoProvider {
    context: Mutex<Addr2LineContext>,
}

impl LineInfoProvider {
    /// ELFローダーのDWARFセクションからソース行情報プロバイダを作成する
    pub fn new(loader: &ElfLoader) -> Result<Self> {
        let dwarf = loader.load_dwarf()?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;

        Ok(Self {
            context: Mutex::new(context),
        })
    }

    /// アドレスからソース行情報を取得する
    ///
    /// `addr` はモジュール内のアドレス（PIEの場合はオフセット）です。
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let context = self
            .context
            .lock()
            .map_err(|_| anyhow::anyhow!("Line table context lock poisoned"))?;

        let location = context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up line for {:#x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}

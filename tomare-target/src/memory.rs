//! メモリアクセス機能

use crate::Result;
use std::fmt;
use std::str::FromStr;

/// メモリ保護属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const NONE: Protection = Protection {
        read: false,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Protection = Protection {
        read: true,
        write: true,
        execute: false,
    };
    pub const READ_EXECUTE: Protection = Protection {
        read: true,
        write: false,
        execute: true,
    };
}

impl FromStr for Protection {
    type Err = anyhow::Error;

    /// "rwx" 形式（/proc/pid/maps と同じ）をパースする
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let mut flag = |expected: char| -> Result<bool> {
            match chars.next() {
                Some(c) if c == expected => Ok(true),
                Some('-') => Ok(false),
                other => Err(anyhow::anyhow!("Invalid protection string {:?} at {:?}", s, other)),
            }
        };

        Ok(Protection {
            read: flag('r')?,
            write: flag('w')?,
            execute: flag('x')?,
        })
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
    pub protection: Protection,
    pub file: Option<String>,
}

impl MemoryRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base.saturating_add(self.size)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// メモリアクセスの失敗
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
    #[error("access to {address:#x} denied (protection {protection})")]
    AccessDenied { address: u64, protection: Protection },
    #[error("range {address:#x}+{size:#x} wraps past the end of the address space")]
    Overflow { address: u64, size: u64 },
}

/// `[addr, addr+len)` の終端（`len` が0なら1バイトとして扱う）
///
/// 末尾のバイトが `u64::MAX` の範囲は終端を `u64::MAX` に丸めます。
pub fn range_end(addr: u64, len: usize) -> std::result::Result<u64, MemoryError> {
    let size = (len as u64).max(1);
    match addr.checked_add(size) {
        Some(end) => Ok(end),
        None if addr.checked_add(size - 1).is_some() => Ok(u64::MAX),
        None => Err(MemoryError::Overflow { address: addr, size }),
    }
}

/// ターゲットのメモリアクセス
///
/// 読み書きはページ保護を尊重し、アクセスできない場合は `MemoryError` を返します。
pub trait MemoryAccess: Send + Sync {
    /// メモリからデータを読み取る
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// メモリにデータを書き込む
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// ページ保護を変更する（`addr` を含むページ単位で適用される）
    fn protect(&self, addr: u64, size: usize, protection: Protection) -> Result<()>;

    /// アドレスを含むマッピングを取得する
    fn find_range(&self, addr: u64) -> Option<MemoryRange>;

    fn page_size(&self) -> u64 {
        4096
    }

    /// u64値を読み取る（リトルエンディアン）
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Failed to convert {} bytes to u64 array (expected 8 bytes)", bytes.len())
        })?;
        Ok(u64::from_le_bytes(array))
    }

    /// ポインタサイズの値を読み取る
    fn read_pointer(&self, addr: u64, pointer_size: usize) -> Result<u64> {
        if pointer_size == 8 {
            return self.read_u64(addr);
        }

        let bytes = self.read(addr, 4)?;
        let array: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Failed to convert {} bytes to u32 array (expected 4 bytes)", bytes.len())
        })?;
        Ok(u32::from_le_bytes(array) as u64)
    }

    /// NUL終端文字列を読み取る（最大 `max_len` バイト）
    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<Vec<u8>> {
        let page_size = self.page_size();
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max_len {
            // ページ境界をまたがないように読み取る
            let in_page = page_size - cursor % page_size;
            let chunk = usize::try_from(in_page).unwrap_or(usize::MAX).min(max_len - out.len());
            let bytes = self.read(cursor, chunk)?;
            if let Some(pos) = bytes.iter().position(|&b| b == 0) {
                out.extend_from_slice(&bytes[..pos]);
                return Ok(out);
            }
            out.extend_from_slice(&bytes);
            match cursor.checked_add(chunk as u64) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// 読み取り可能なアドレスかどうか
    fn is_readable(&self, addr: u64) -> bool {
        self.find_range(addr)
            .map(|r| r.protection.read)
            .unwrap_or(false)
    }
}

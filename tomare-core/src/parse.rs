//! パース関連のユーティリティ関数

use anyhow::Result;
use tomare_target::Arch;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use tomare_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        // 10進数でもダメなら16進数として解釈を試みる
        s.parse::<u64>()
            .or_else(|_| u64::from_str_radix(s, 16))
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// ARMファミリではThumbビット（bit 0）を落とす
pub fn dethumbify(arch: Arch, address: u64) -> u64 {
    if arch.is_arm_family() {
        address & !1
    } else {
        address
    }
}

/// バイト列を16進文字列に変換
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 16進文字列をバイト列に変換（空白は無視する）
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(anyhow::anyhow!("Odd number of hex digits in '{}'", s));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)
                .map_err(|e| anyhow::anyhow!("Invalid hex string '{}': {}", s, e))?;
            u8::from_str_radix(text, 16)
                .map_err(|e| anyhow::anyhow!("Invalid hex byte '{}': {}", text, e))
        })
        .collect()
}

//! ターゲットのアーキテクチャとプラットフォーム

use serde::Serialize;
use std::fmt;

/// CPUアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Ia32,
    X64,
    Arm,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Ia32 => "ia32",
            Arch::X64 => "x64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
        }
    }

    /// ポインタサイズ（バイト数）
    pub fn pointer_size(&self) -> usize {
        match self {
            Arch::Ia32 | Arch::Arm => 4,
            Arch::X64 | Arch::Arm64 => 8,
        }
    }

    /// プログラムカウンタのレジスタ名
    pub fn pc_register(&self) -> &'static str {
        match self {
            Arch::Ia32 => "eip",
            Arch::X64 => "rip",
            Arch::Arm | Arch::Arm64 => "pc",
        }
    }

    /// スタックポインタのレジスタ名
    pub fn sp_register(&self) -> &'static str {
        match self {
            Arch::Ia32 => "esp",
            Arch::X64 => "rsp",
            Arch::Arm | Arch::Arm64 => "sp",
        }
    }

    /// フレームポインタのレジスタ名
    pub fn fp_register(&self) -> &'static str {
        match self {
            Arch::Ia32 => "ebp",
            Arch::X64 => "rbp",
            Arch::Arm => "r11",
            Arch::Arm64 => "fp",
        }
    }

    /// 命令トレーサによるステップ実行をサポートするかどうか
    pub fn supports_stepping(&self) -> bool {
        matches!(self, Arch::X64 | Arch::Arm64)
    }

    /// 実行前にベーシックブロック全体をコピーするアーキテクチャかどうか
    ///
    /// この場合、ステップ実行の開始時にブロックを1つ余分に読み飛ばす必要があります。
    pub fn copies_block_before_execution(&self) -> bool {
        matches!(self, Arch::Arm64)
    }

    /// ARMファミリ（Thumbビットを持つ可能性がある）かどうか
    pub fn is_arm_family(&self) -> bool {
        matches!(self, Arch::Arm | Arch::Arm64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// オペレーティングシステム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Darwin,
    Other,
}

//! 逆アセンブル機能
//!
//! Capstoneでメモリ上の命令をデコードし、ステップ実行の分類に使う命令グループ名を取り出します。

use crate::Result;
use capstone::prelude::*;
use capstone::Capstone;
use std::sync::Arc;
use tomare_target::{Arch, Instruction, InstructionDecoder, MemoryAccess};

/// 1命令の最大長
const MAX_INSN_LEN: u64 = 16;

/// アーキテクチャに合わせたCapstoneを作成する
///
/// ARMではアドレスのbit 0が立っていればThumbモードでデコードします。
fn build_capstone(target_arch: Arch, address: u64) -> Result<Capstone> {
    let cs = match target_arch {
        Arch::X64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build(),
        Arch::Ia32 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build(),
        Arch::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build(),
        Arch::Arm => {
            let mode = if address & 1 != 0 {
                arch::arm::ArchMode::Thumb
            } else {
                arch::arm::ArchMode::Arm
            };
            Capstone::new().arm().mode(mode).detail(true).build()
        }
    };
    cs.map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// バイト列の先頭の1命令をデコードする
pub fn decode_bytes(arch: Arch, code: &[u8], address: u64) -> Result<Instruction> {
    let cs = build_capstone(arch, address)?;
    let runtime_address = if arch.is_arm_family() { address & !1 } else { address };

    let insns = cs
        .disasm_count(code, runtime_address, 1)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble at {:#x}: {}", address, e))?;
    let insn = insns
        .iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No instruction at {:#x}", address))?;

    let detail = cs
        .insn_detail(insn)
        .map_err(|e| anyhow::anyhow!("Failed to get instruction detail at {:#x}: {}", address, e))?;

    let mut groups: Vec<String> = detail
        .groups()
        .iter()
        .filter_map(|&group| cs.group_name(group))
        .collect();
    if arch == Arch::Arm && address & 1 != 0 && !groups.iter().any(|g| g.starts_with("thumb")) {
        groups.push("thumb".to_string());
    }

    Ok(Instruction {
        address: runtime_address,
        size: insn.bytes().len() as u32,
        mnemonic: insn.mnemonic().unwrap_or("").to_string(),
        op_str: insn.op_str().unwrap_or("").to_string(),
        groups,
    })
}

/// ターゲットのメモリを読んでデコードするデコーダ
pub struct CapstoneDecoder {
    arch: Arch,
    memory: Arc<dyn MemoryAccess>,
}

impl CapstoneDecoder {
    pub fn new(arch: Arch, memory: Arc<dyn MemoryAccess>) -> Self {
        Self { arch, memory }
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(&self, address: u64) -> Result<Instruction> {
        let start = if self.arch.is_arm_family() { address & !1 } else { address };

        // ページ境界を越えて読まない
        let page_size = self.memory.page_size();
        let page_end = (start & !(page_size - 1)) + page_size;
        let len = MAX_INSN_LEN.min(page_end - start) as usize;

        let code = self
            .memory
            .read(start, len)
            .map_err(|e| anyhow::anyhow!("Failed to read instruction at {:#x}: {}", address, e))?;
        decode_bytes(self.arch, &code, address)
    }
}

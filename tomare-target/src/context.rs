//! アーキテクチャ非依存のCPUコンテキスト

use crate::{Arch, Result};

const X64_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

const IA32_REGISTERS: &[&str] = &["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "eip"];

const ARM_REGISTERS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

const ARM64_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc",
];

/// アーキテクチャのレジスタ名一覧（表示順）
pub fn register_names(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::X64 => X64_REGISTERS,
        Arch::Ia32 => IA32_REGISTERS,
        Arch::Arm => ARM_REGISTERS,
        Arch::Arm64 => ARM64_REGISTERS,
    }
}

/// トラップ時に取得されたレジスタのスナップショット
///
/// インターセプタやトレーサから渡され、書き込みは再開後のスレッドに反映されます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuContext {
    arch: Arch,
    registers: Vec<(&'static str, u64)>,
}

impl CpuContext {
    /// すべてのレジスタが0のコンテキストを作成する
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            registers: register_names(arch).iter().map(|&name| (name, 0)).collect(),
        }
    }

    /// 指定したレジスタ値を持つコンテキストを作成する
    pub fn with_registers(arch: Arch, values: &[(&str, u64)]) -> Result<Self> {
        let mut ctx = Self::new(arch);
        for (name, value) in values {
            ctx.set(name, *value)?;
        }
        Ok(ctx)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// レジスタ値を取得する
    pub fn get(&self, name: &str) -> Option<u64> {
        self.registers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// レジスタ値を設定する
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let slot = self
            .registers
            .iter_mut()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| anyhow::anyhow!("Unknown register {} for {}", name, self.arch))?;
        slot.1 = value;
        Ok(())
    }

    /// レジスタ名と値の一覧
    pub fn registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.registers.iter().copied()
    }

    pub fn pc(&self) -> u64 {
        self.get(self.arch.pc_register()).unwrap_or(0)
    }

    pub fn set_pc(&mut self, pc: u64) {
        let name = self.arch.pc_register();
        if let Some(slot) = self.registers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = pc;
        }
    }

    pub fn sp(&self) -> u64 {
        self.get(self.arch.sp_register()).unwrap_or(0)
    }

    pub fn frame_pointer(&self) -> u64 {
        self.get(self.arch.fp_register()).unwrap_or(0)
    }
}

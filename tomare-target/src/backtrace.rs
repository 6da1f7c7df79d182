//! フレームポインタによるバックトレース

use crate::{CpuContext, MemoryAccess};

/// バックトレースの最大フレーム数
pub const MAX_FRAMES: usize = 64;

/// フレームポインタのチェーンをたどってリターンアドレスを収集する
///
/// 最初のフレームはpcです。フレームポインタが0、境界に揃っていない、
/// 読み取れない、または減少した時点で終了します。
pub fn capture_backtrace(
    context: &CpuContext,
    memory: &dyn MemoryAccess,
    max_depth: usize,
) -> Vec<u64> {
    let mut frames = Vec::with_capacity(max_depth.min(MAX_FRAMES));
    if max_depth == 0 {
        return frames;
    }

    if context.pc() != 0 {
        frames.push(context.pc());
    }

    let pointer_size = context.arch().pointer_size() as u64;
    let mut fp = context.frame_pointer();
    for _ in 0..max_depth.saturating_sub(1) {
        if fp < 0x1000 || fp % pointer_size != 0 {
            break;
        }

        let Ok(prev_fp) = memory.read_pointer(fp, pointer_size as usize) else {
            break;
        };
        let Some(ret_slot) = fp.checked_add(pointer_size) else {
            break;
        };
        let Ok(ret_addr) = memory.read_pointer(ret_slot, pointer_size as usize) else {
            break;
        };
        if ret_addr == 0 {
            break;
        }

        frames.push(ret_addr);
        if prev_fp <= fp {
            break;
        }
        fp = prev_fp;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;
    use crate::{Arch, Protection};

    #[test]
    fn test_walks_frame_chain() {
        let memory = SimMemory::new();
        memory.map(0x7000, 0x1000, Protection::READ_WRITE);
        // frame0: [prev=0x7100, ret=0x401234]
        memory.write_u64(0x7000, 0x7100);
        memory.write_u64(0x7008, 0x40_1234);
        // frame1: [prev=0, ret=0x405678]
        memory.write_u64(0x7100, 0);
        memory.write_u64(0x7108, 0x40_5678);

        let ctx = CpuContext::with_registers(Arch::X64, &[("rip", 0x40_1000), ("rbp", 0x7000)]).unwrap();
        let frames = capture_backtrace(&ctx, &memory, MAX_FRAMES);
        assert_eq!(frames, vec![0x40_1000, 0x40_1234, 0x40_5678]);
    }

    #[test]
    fn test_zero_depth_is_empty() {
        let memory = SimMemory::new();
        let ctx = CpuContext::with_registers(Arch::X64, &[("rip", 0x1000)]).unwrap();
        assert!(capture_backtrace(&ctx, &memory, 0).is_empty());
    }

    #[test]
    fn test_unreadable_frame_pointer_stops() {
        let memory = SimMemory::new();
        let ctx = CpuContext::with_registers(Arch::Arm64, &[("pc", 0x1000), ("fp", 0x9000)]).unwrap();
        assert_eq!(capture_backtrace(&ctx, &memory, MAX_FRAMES), vec![0x1000]);
    }

    #[test]
    fn test_frame_pointer_at_top_of_address_space_stops() {
        let memory = SimMemory::new();
        memory.map(0xffff_ffff_ffff_f000, 0x1000, Protection::READ_WRITE);
        let ctx = CpuContext::with_registers(Arch::X64, &[("rip", 0x1000), ("rbp", 0xffff_ffff_ffff_fff8)]).unwrap();
        assert_eq!(capture_backtrace(&ctx, &memory, MAX_FRAMES), vec![0x1000]);
    }
}

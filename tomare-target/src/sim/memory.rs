//! シミュレーションのメモリ

use crate::memory::range_end;
use crate::{MemoryAccess, MemoryError, MemoryOperation, MemoryRange, Protection, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

const PAGE_SIZE: u64 = 0x1000;
/// 1回でマップできる大きさの上限
const MAX_REGION: u64 = 1 << 32;

struct Region {
    base: u64,
    data: Vec<u8>,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.data.len() as u64
    }
}

#[derive(Default)]
struct State {
    regions: Vec<Region>,
    /// ページ先頭アドレス -> 保護属性
    pages: BTreeMap<u64, Protection>,
}

impl State {
    fn region(&self, addr: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    fn region_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.contains(addr))
    }

    fn protection(&self, addr: u64) -> Option<Protection> {
        self.pages.get(&(addr & !(PAGE_SIZE - 1))).copied()
    }

    /// `[addr, addr+len)` のすべてのページが条件を満たすか確認する
    fn check(&self, addr: u64, len: usize, allowed: impl Fn(Protection) -> bool) -> std::result::Result<(), MemoryError> {
        let end = range_end(addr, len)?;
        let mut page = addr & !(PAGE_SIZE - 1);
        while page < end {
            let protection = self.protection(page).ok_or(MemoryError::Unmapped(page.max(addr)))?;
            if !allowed(protection) {
                return Err(MemoryError::AccessDenied {
                    address: page.max(addr),
                    protection,
                });
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(())
    }
}

/// ページ保護を持つ疎なメモリ
#[derive(Default)]
pub struct SimMemory {
    state: RwLock<State>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// ゼロ埋めされた領域をマップする（ページ単位に切り上げる）
    ///
    /// アドレス空間の終端を越える領域と大きすぎる領域はマップしません。
    pub fn map(&self, base: u64, size: u64, protection: Protection) {
        let base = base & !(PAGE_SIZE - 1);
        let pages = size.div_ceil(PAGE_SIZE);
        if pages == 0 {
            return;
        }
        let size = pages.saturating_mul(PAGE_SIZE);
        if size > MAX_REGION || base.checked_add(size - 1).is_none() {
            tracing::warn!("Refusing to map {:#x}+{:#x}", base, size);
            return;
        }

        let mut state = self.state.write();
        state.regions.push(Region {
            base,
            data: vec![0; size as usize],
        });
        for i in 0..pages {
            state.pages.insert(base + i * PAGE_SIZE, protection);
        }
    }

    /// 保護属性を無視して書き込む（セットアップ用）
    pub fn poke(&self, addr: u64, bytes: &[u8]) {
        let mut state = self.state.write();
        for (i, byte) in bytes.iter().enumerate() {
            let Some(a) = addr.checked_add(i as u64) else {
                break;
            };
            if let Some(region) = state.region_mut(a) {
                let offset = (a - region.base) as usize;
                region.data[offset] = *byte;
            }
        }
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.poke(addr, &value.to_le_bytes());
    }

    /// 保護属性を無視して読み取る（検証用）
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let state = self.state.read();
        (0..len as u64)
            .map(|i| {
                addr.checked_add(i)
                    .and_then(|a| state.region(a).map(|r| r.data[(a - r.base) as usize]))
                    .unwrap_or(0)
            })
            .collect()
    }

    /// 現在の保護属性でゲストのアクセスが許可されるか
    pub fn permits(&self, addr: u64, operation: MemoryOperation) -> bool {
        self.state.read().protection(addr).is_some_and(|p| match operation {
            MemoryOperation::Read => p.read,
            MemoryOperation::Write => p.write,
            MemoryOperation::Execute => p.execute,
        })
    }

    pub fn protection(&self, addr: u64) -> Option<Protection> {
        self.state.read().protection(addr)
    }
}

impl MemoryAccess for SimMemory {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let state = self.state.read();
        state.check(addr, size, |p| p.read)?;

        // 範囲はすべてマップ済みなので `addr + i` は溢れない
        let mut out = Vec::with_capacity(size);
        for i in 0..size as u64 {
            let a = addr + i;
            let region = state.region(a).ok_or(MemoryError::Unmapped(a))?;
            out.push(region.data[(a - region.base) as usize]);
        }
        Ok(out)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        state.check(addr, data.len(), |p| p.write)?;

        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u64;
            let region = state.region_mut(a).ok_or(MemoryError::Unmapped(a))?;
            let offset = (a - region.base) as usize;
            region.data[offset] = *byte;
        }
        Ok(())
    }

    fn protect(&self, addr: u64, size: usize, protection: Protection) -> Result<()> {
        let mut state = self.state.write();
        let start = addr & !(PAGE_SIZE - 1);
        let end = range_end(addr, size)?;

        // 途中で失敗したときに一部だけ変更しない
        let mut pages = Vec::new();
        let mut page = start;
        while page < end {
            if !state.pages.contains_key(&page) {
                return Err(MemoryError::Unmapped(page).into());
            }
            pages.push(page);
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
        for page in pages {
            state.pages.insert(page, protection);
        }
        Ok(())
    }

    fn find_range(&self, addr: u64) -> Option<MemoryRange> {
        let state = self.state.read();
        let region = state.region(addr)?;
        let protection = state.protection(addr)?;
        Some(MemoryRange {
            base: region.base,
            size: region.data.len() as u64,
            protection,
            file: None,
        })
    }

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }
}

//! メモリアクセスの監視
//!
//! 監視アドレスのページから指定されたアクセス権を外し、保護違反の例外（または
//! アクセスモニタの通知）をブレークポイントと同じようにスレッドの停止につなげます。

use crate::config::WatchBackend;
use crate::engine::Engine;
use crate::event::{Event, Reason};
use crate::suspension::TrapSite;
use crate::Result;
use bitflags::bitflags;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tomare_symbols::DebugSymbol;
use tomare_target::{
    AccessDetails, AccessMonitorHandler, ExceptionAction, ExceptionDetails, ExceptionHandler,
    ExceptionKind, InterceptorHandle, MemoryOperation, MemoryRange, Protection,
    ThreadId, TrapFrame, TrapHandler,
};

bitflags! {
    /// 監視するアクセス
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFlags: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        /// 最初のヒットの後は保護を戻さない
        const SINGLESHOT = 8;
    }
}

impl WatchFlags {
    pub fn matches(&self, operation: MemoryOperation) -> bool {
        match operation {
            MemoryOperation::Read => self.contains(WatchFlags::READ),
            MemoryOperation::Write => self.contains(WatchFlags::WRITE),
            MemoryOperation::Execute => self.contains(WatchFlags::EXECUTE),
        }
    }
}

impl Default for WatchFlags {
    fn default() -> Self {
        WatchFlags::READ | WatchFlags::WRITE
    }
}

/// `original` から `flags` のアクセス権を外した保護
fn strip(original: Protection, flags: WatchFlags) -> Protection {
    Protection {
        read: original.read && !flags.contains(WatchFlags::READ),
        write: original.write && !flags.contains(WatchFlags::WRITE),
        execute: original.execute && !flags.contains(WatchFlags::EXECUTE),
    }
}

/// 監視中のアドレス
#[derive(Debug, Clone)]
pub struct Watcher {
    pub address: u64,
    pub flags: WatchFlags,
    /// 監視前のページ保護（同じページの監視で共通）
    pub original: Protection,
    pub debug_symbol: Option<DebugSymbol>,
    /// ページ保護に反映されているか（一度きりの監視はヒット後に外れる）
    pub armed: bool,
}

impl Watcher {
    /// この監視だけのページ保護（指定されたアクセス権を外す）
    pub fn watched_protection(&self) -> Protection {
        strip(self.original, self.flags)
    }

    pub fn summary(&self) -> Value {
        json!({
            "address": format!("{:#x}", self.address),
            "flags": self.flags.bits(),
            "protection": self.original.to_string(),
            "armed": self.armed,
            "debugSymbol": self.debug_symbol,
        })
    }
}

/// アドレスごとの監視表
#[derive(Default)]
pub struct WatcherTable {
    watchers: Mutex<HashMap<u64, Watcher>>,
    /// 再実行後に保護を戻すページ（スレッドごと）
    rearm: Mutex<HashMap<ThreadId, u64>>,
}

impl WatcherTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u64) -> Option<Watcher> {
        self.watchers.lock().get(&address).cloned()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.watchers.lock().contains_key(&address)
    }

    pub fn snapshot(&self) -> Vec<Watcher> {
        let mut watchers: Vec<Watcher> = self.watchers.lock().values().cloned().collect();
        watchers.sort_by_key(|w| w.address);
        watchers
    }

    fn on_page(&self, page: u64, page_size: u64) -> Vec<Watcher> {
        let mut watchers: Vec<Watcher> = self
            .watchers
            .lock()
            .values()
            .filter(|w| w.address & !(page_size - 1) == page)
            .cloned()
            .collect();
        watchers.sort_by_key(|w| w.address);
        watchers
    }

    fn disarm(&self, address: u64) {
        if let Some(watcher) = self.watchers.lock().get_mut(&address) {
            watcher.armed = false;
        }
    }
}

/// ページ上の監視をすべて反映した保護
///
/// 監視がなければ `None`。ヒット済みの一度きりの監視は含めない。
fn page_protection(on_page: &[Watcher]) -> Option<Protection> {
    let first = on_page.first()?;
    let flags = on_page
        .iter()
        .filter(|w| w.armed)
        .fold(WatchFlags::empty(), |acc, w| acc | w.flags);
    Some(strip(first.original, flags))
}

/// 例外ハンドラとアクセスモニタのハンドラ
pub(crate) struct WatchHandler {
    pub(crate) engine: Weak<Engine>,
}

impl ExceptionHandler for WatchHandler {
    fn on_exception(&self, details: &mut ExceptionDetails<'_>) -> ExceptionAction {
        match self.engine.upgrade() {
            Some(engine) => engine.on_access_violation(details),
            None => ExceptionAction::Unhandled,
        }
    }

    fn after_retry(&self, thread_id: ThreadId, _address: u64) {
        if let Some(engine) = self.engine.upgrade() {
            engine.rearm_watchers(thread_id);
        }
    }
}

impl AccessMonitorHandler for WatchHandler {
    fn on_access(&self, details: &AccessDetails) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_monitored_access(details);
        }
    }
}

/// アクセスした命令に一度だけ張るインターセプタ
struct AccessTrap {
    engine: Weak<Engine>,
    flags: WatchFlags,
    handle: Mutex<Option<InterceptorHandle>>,
}

impl TrapHandler for AccessTrap {
    fn on_trap(&self, frame: &mut TrapFrame<'_>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        let site = TrapSite::new(frame.thread_id, Reason::Watcher).at(frame.address);
        engine.suspend(site, Some(&mut *frame.context), frame.args.clone());

        if !self.flags.contains(WatchFlags::SINGLESHOT) {
            engine.enable_access_monitor();
        }
        if let Some(handle) = self.handle.lock().take() {
            engine.target.interceptor.detach(handle);
            engine.target.interceptor.flush();
        }
    }
}

impl Engine {
    fn watch_backend(&self) -> WatchBackend {
        match self.config.watch_backend_for(self.target.process.platform()) {
            WatchBackend::AccessMonitor if self.target.access_monitor.is_some() => WatchBackend::AccessMonitor,
            _ => WatchBackend::PageProtection,
        }
    }

    fn page_of(&self, address: u64) -> u64 {
        address & !(self.target.memory.page_size() - 1)
    }

    fn protect_page(&self, page: u64, protection: Protection) -> Result<()> {
        let page_size = self.target.memory.page_size();
        self.target.memory.protect(page, page_size as usize, protection)
    }

    /// ページの保護を残っている監視に合わせる（監視がなくなれば `original` に戻す）
    fn sync_page(&self, page: u64, original: Protection) -> Result<()> {
        let on_page = self.watchers.on_page(page, self.target.memory.page_size());
        let protection = page_protection(&on_page).unwrap_or(original);
        tracing::trace!("page {:#x}: {} watcher(s), protection {}", page, on_page.len(), protection);
        self.protect_page(page, protection)
    }

    /// 監視を追加する。アドレスがマップされていなければ `false`
    ///
    /// 既に監視中のアドレスは保護だけをかけ直します。
    pub fn add_watcher(&self, address: u64, flags: WatchFlags) -> Result<bool> {
        let page = self.page_of(address);
        let watcher = match self.watchers.get(address) {
            Some(watcher) => {
                if let Some(w) = self.watchers.watchers.lock().get_mut(&address) {
                    w.armed = true;
                }
                watcher
            }
            None => {
                let Some(range) = self.target.memory.find_range(address) else {
                    tracing::warn!("Failed to add watcher: {:#x} is not mapped", address);
                    return Ok(false);
                };
                // 同じページに監視があれば現在の保護は既に外されている
                let original = self
                    .watchers
                    .on_page(page, self.target.memory.page_size())
                    .first()
                    .map_or(range.protection, |w| w.original);
                let watcher = Watcher {
                    address,
                    flags,
                    original,
                    debug_symbol: self.target.symbols.symbol_for(address),
                    armed: true,
                };
                self.watchers.watchers.lock().insert(address, watcher.clone());
                self.sink.send(Event::WatcherAdded {
                    address,
                    flags: flags.bits(),
                    debug_symbol: watcher.debug_symbol.clone(),
                });
                watcher
            }
        };

        match self.watch_backend() {
            WatchBackend::PageProtection => self.sync_page(page, watcher.original)?,
            WatchBackend::AccessMonitor => self.enable_access_monitor(),
        }
        Ok(true)
    }

    /// 監視を外す
    ///
    /// ページに他の監視が残っていればその分の保護は残し、最後の監視なら元の保護に戻します。
    pub fn remove_watcher(&self, address: u64) -> bool {
        let Some(watcher) = self.watchers.watchers.lock().remove(&address) else {
            return false;
        };

        match self.watch_backend() {
            WatchBackend::PageProtection => {
                if let Err(e) = self.sync_page(self.page_of(address), watcher.original) {
                    tracing::warn!("Failed to restore protection at {:#x}: {}", address, e);
                }
            }
            WatchBackend::AccessMonitor => self.enable_access_monitor(),
        }

        self.sink.send(Event::WatcherRemoved { address });
        true
    }

    pub fn is_address_watched(&self, address: u64) -> bool {
        self.watchers.contains(address)
    }

    /// 全監視アドレスでアクセスモニタを有効にする（監視がなければ無効にする）
    pub(crate) fn enable_access_monitor(&self) {
        let Some(monitor) = &self.target.access_monitor else {
            return;
        };

        let ranges: Vec<MemoryRange> = self
            .watchers
            .snapshot()
            .into_iter()
            .map(|w| MemoryRange {
                base: w.address,
                size: 1,
                protection: w.original,
                file: None,
            })
            .collect();

        if ranges.is_empty() {
            monitor.disable();
            return;
        }
        let handler = Arc::new(WatchHandler {
            engine: self.self_ref.clone(),
        });
        if let Err(e) = monitor.enable(&ranges, handler) {
            tracing::warn!("Failed to enable access monitor: {}", e);
        }
    }

    fn on_access_violation(&self, details: &mut ExceptionDetails<'_>) -> ExceptionAction {
        if details.kind != ExceptionKind::AccessViolation {
            return ExceptionAction::Unhandled;
        }
        let Some((operation, address)) = details.memory else {
            return ExceptionAction::Unhandled;
        };
        let tid = details.thread_id;

        let page = self.page_of(address);
        let on_page = self.watchers.on_page(page, self.target.memory.page_size());
        if on_page.is_empty() {
            return ExceptionAction::Unhandled;
        }

        let hit = on_page
            .iter()
            .find(|w| w.armed && w.address == address && w.flags.matches(operation))
            .cloned();

        // ページの保護を戻して命令を再実行させる
        if let Err(e) = self.protect_page(page, on_page[0].original) {
            tracing::warn!("[{}] Failed to restore protection at {:#x}: {}", tid, page, e);
            return ExceptionAction::Unhandled;
        }

        if let Some(watcher) = hit.as_ref().filter(|w| w.flags.contains(WatchFlags::SINGLESHOT)) {
            tracing::debug!("[{}] single-shot watcher at {:#x} disarmed", tid, watcher.address);
            self.watchers.disarm(watcher.address);
        }
        let spent = |w: &Watcher| {
            w.flags.contains(WatchFlags::SINGLESHOT) && hit.as_ref().is_some_and(|h| h.address == w.address)
        };
        let rearm = on_page.iter().any(|w| w.armed && !spent(w));

        if hit.is_some() {
            tracing::debug!("[{}] watcher hit at {:#x} ({})", tid, address, operation.as_str());
            self.sink.send(Event::Watcher {
                tid,
                address,
                operation,
                from: details.address,
            });
            let site = TrapSite::new(tid, Reason::Watcher).at(details.address);
            self.suspend(site, Some(&mut *details.context), Vec::new());
        }

        if !rearm {
            return ExceptionAction::Resume;
        }
        self.watchers.rearm.lock().insert(tid, page);
        ExceptionAction::ResumeAndNotify
    }

    /// 再実行が終わったスレッドの監視ページに保護をかけ直す
    fn rearm_watchers(&self, thread_id: ThreadId) {
        let Some(page) = self.watchers.rearm.lock().remove(&thread_id) else {
            return;
        };
        let on_page = self.watchers.on_page(page, self.target.memory.page_size());
        let Some(protection) = page_protection(&on_page) else {
            return;
        };
        if let Err(e) = self.protect_page(page, protection) {
            tracing::warn!("[{}] Failed to re-protect {:#x}: {}", thread_id, page, e);
        }
    }

    fn on_monitored_access(&self, details: &AccessDetails) {
        let tid = details.thread_id;
        let Some(watcher) = self
            .watchers
            .get(details.address)
            .filter(|w| w.flags.matches(details.operation))
        else {
            return;
        };

        if let Some(monitor) = &self.target.access_monitor {
            monitor.disable();
        }
        self.sink.send(Event::Watcher {
            tid,
            address: details.address,
            operation: details.operation,
            from: details.from,
        });

        // アクセスした命令に戻ったところで停止する
        let trap = Arc::new(AccessTrap {
            engine: self.self_ref.clone(),
            flags: watcher.flags,
            handle: Mutex::new(None),
        });
        match self.target.interceptor.attach(details.from, trap.clone()) {
            Ok(handle) => {
                *trap.handle.lock() = Some(handle);
                self.target.interceptor.flush();
            }
            Err(e) => tracing::warn!("[{}] Failed to attach at {:#x}: {}", tid, details.from, e),
        }
    }
}

//! 実行制御エンジン
//!
//! フック表、停止表、ステップ実行の状態、監視表をまとめて所有し、
//! トラップしたスレッドから呼ばれるすべての処理の起点になります。

use crate::channel::{Command, RemoteCommand};
use crate::config::EngineConfig;
use crate::event::{ContextInfo, Event, ProcessSummary, Reason};
use crate::hooks::HookOptions;
use crate::onload::OnLoadHandler;
use crate::registry::{HookKey, HookRegistry};
use crate::sink::EventSink;
use crate::stepping::StepSessions;
use crate::suspension::SuspensionTable;
use crate::watcher::{WatchHandler, WatcherTable};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tomare_target::thread::current_thread_id;
use tomare_target::Target;

/// 実行制御エンジン
pub struct Engine {
    pub(crate) target: Target,
    pub(crate) config: EngineConfig,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) hooks: HookRegistry,
    pub(crate) suspensions: SuspensionTable,
    pub(crate) sessions: StepSessions,
    pub(crate) watchers: WatcherTable,
    resumed: AtomicBool,
    initialized: AtomicBool,
    pub(crate) self_ref: Weak<Engine>,
}

impl Engine {
    pub fn new(target: Target, config: EngineConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            target,
            config,
            sink,
            hooks: HookRegistry::new(),
            suspensions: SuspensionTable::new(),
            sessions: StepSessions::new(),
            watchers: WatcherTable::new(),
            resumed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn watchers(&self) -> &WatcherTable {
        &self.watchers
    }

    pub fn sessions(&self) -> &StepSessions {
        &self.sessions
    }

    /// 起動時の初期化
    ///
    /// 例外ハンドラを登録し、モジュールとクラスのロードの監視を始めて、
    /// 初期コンテキスト（プロセスの概要）をコントローラに送ります。2回目以降は何もしません。
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!("engine already initialized");
            return Ok(());
        }

        let watch = Arc::new(WatchHandler {
            engine: self.self_ref.clone(),
        });
        self.target
            .exceptions
            .set_handler(watch)
            .map_err(|e| anyhow::anyhow!("Failed to set exception handler: {}", e))?;

        let onload = Arc::new(OnLoadHandler {
            engine: self.self_ref.clone(),
        });
        if let Err(e) = self.target.process.watch_module_loading(onload.clone()) {
            tracing::warn!("Failed to watch module loading: {}", e);
        }
        if let Some(managed) = self.target.managed.as_ref().filter(|m| m.available()) {
            if let Err(e) = managed.watch_class_loading(onload) {
                tracing::warn!("Failed to watch class loading: {}", e);
            }
        }

        if self.config.break_at_entry && self.config.spawned {
            match self.target.process.entry_point() {
                Some(entry) => {
                    let options = HookOptions {
                        internal: true,
                        one_shot: true,
                        ..HookOptions::default()
                    };
                    if let Err(e) = self.hook_native(entry, options) {
                        tracing::warn!("Failed to hook entry point {:#x}: {}", entry, e);
                    }
                }
                None => tracing::warn!("Entry point not found"),
            }
        }

        let tid = current_thread_id();
        let mut info = ContextInfo::new(tid, Reason::InitialContext);
        info.process = Some(self.process_summary());
        self.sink.send(Event::SetContext(info));
        tracing::debug!("[{}] engine initialized", tid);
        Ok(())
    }

    pub fn process_summary(&self) -> ProcessSummary {
        let process = &self.target.process;
        ProcessSummary {
            arch: process.arch(),
            platform: process.platform(),
            java: self.target.managed.as_ref().is_some_and(|m| m.available()),
            pid: process.pid(),
            pointer_size: process.pointer_size(),
        }
    }

    /// プロセスの再開をコントローラに通知する（最初の1回だけ `true`）
    pub fn resume(&self) -> bool {
        if self.resumed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sink.send(Event::Resume);
        true
    }

    /// すべてのインターセプト、ステップ実行、監視を外す
    ///
    /// 停止中のスレッドには `release` を送りますが、その完了は待ちません。
    pub fn detach(&self) {
        // 退避中のフックを戻してから外す
        for tid in self.sessions.thread_ids() {
            self.stop_step(tid);
        }
        for record in self.hooks.drain_where(|_| true) {
            match &record.key {
                HookKey::Native(_) => {
                    if let Some(handle) = record.handle {
                        self.target.interceptor.detach(handle);
                    }
                }
                HookKey::Managed(class_method) => self.unhook_managed(class_method),
                HookKey::NativeOnLoad(_) | HookKey::ManagedOnLoad(_) => {}
            }
        }
        self.target.interceptor.detach_all();
        self.target.interceptor.flush();

        for watcher in self.watchers.snapshot() {
            self.remove_watcher(watcher.address);
        }
        if let Some(monitor) = &self.target.access_monitor {
            monitor.disable();
        }

        for tid in self.suspensions.thread_ids() {
            if let Some(suspension) = self.suspensions.get(tid) {
                tracing::debug!("[{}] releasing on detach", tid);
                suspension.inbox().push(RemoteCommand::new(Command::Release));
            }
        }

        self.sink.send(Event::Detached);
    }
}

//! シミュレーションのプロセス、例外ポート、アクセスモニタ、マネージドランタイム

use crate::{
    AccessMonitor, AccessMonitorHandler, Arch, ClassLoadHandler, CpuContext, ExceptionHandler,
    ExceptionPort, ManagedArg, ManagedHandle, ManagedHookHandler, ManagedRuntime, MemoryRange,
    ModuleInfo, ModuleLoadHandler, Platform, ProcessInfo, Result, ThreadId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// モジュールを後からロードできるプロセス情報
pub struct SimProcess {
    arch: Arch,
    platform: Platform,
    modules: Mutex<Vec<ModuleInfo>>,
    entry: Mutex<Option<u64>>,
    load_handlers: Mutex<Vec<Arc<dyn ModuleLoadHandler>>>,
}

impl SimProcess {
    pub fn new(arch: Arch, platform: Platform) -> Self {
        Self {
            arch,
            platform,
            modules: Mutex::new(Vec::new()),
            entry: Mutex::new(None),
            load_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_entry_point(&self, entry: u64) {
        *self.entry.lock() = Some(entry);
    }

    /// ロード通知なしでモジュールを追加する
    pub fn add_module(&self, module: ModuleInfo) {
        self.modules.lock().push(module);
    }

    /// モジュールをロードし、ロードしたスレッド上で監視ハンドラを呼ぶ
    pub fn load_module(&self, thread_id: ThreadId, module: ModuleInfo, context: &mut CpuContext) {
        self.modules.lock().push(module.clone());
        let handlers = self.load_handlers.lock().clone();
        for handler in handlers {
            handler.on_module_loading(thread_id, &module, context);
        }
    }
}

impl ProcessInfo for SimProcess {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn pid(&self) -> i32 {
        4242
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        self.modules.lock().clone()
    }

    fn entry_point(&self) -> Option<u64> {
        *self.entry.lock()
    }

    fn watch_module_loading(&self, handler: Arc<dyn ModuleLoadHandler>) -> Result<()> {
        self.load_handlers.lock().push(handler);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimExceptionPort {
    handler: Mutex<Option<Arc<dyn ExceptionHandler>>>,
}

impl SimExceptionPort {
    pub fn handler(&self) -> Option<Arc<dyn ExceptionHandler>> {
        self.handler.lock().clone()
    }
}

impl ExceptionPort for SimExceptionPort {
    fn set_handler(&self, handler: Arc<dyn ExceptionHandler>) -> Result<()> {
        *self.handler.lock() = Some(handler);
        Ok(())
    }
}

#[derive(Default)]
struct MonitorState {
    /// まだ通知していない監視ページ
    pages: HashSet<u64>,
    handler: Option<Arc<dyn AccessMonitorHandler>>,
}

/// ページごとに一度だけ通知するアクセスモニタ
#[derive(Default)]
pub struct SimAccessMonitor {
    state: Mutex<MonitorState>,
}

impl SimAccessMonitor {
    const PAGE_SIZE: u64 = 0x1000;

    /// 監視中のページなら通知を1回分取り出す
    pub fn take_notification(&self, address: u64) -> Option<Arc<dyn AccessMonitorHandler>> {
        let mut state = self.state.lock();
        let page = address & !(Self::PAGE_SIZE - 1);
        if state.pages.remove(&page) {
            state.handler.clone()
        } else {
            None
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().handler.is_some()
    }
}

impl AccessMonitor for SimAccessMonitor {
    fn enable(&self, ranges: &[MemoryRange], handler: Arc<dyn AccessMonitorHandler>) -> Result<()> {
        let mut state = self.state.lock();
        state.pages.clear();
        for range in ranges {
            let mut page = range.base & !(Self::PAGE_SIZE - 1);
            while page < range.end() {
                state.pages.insert(page);
                page += Self::PAGE_SIZE;
            }
        }
        state.handler = Some(handler);
        Ok(())
    }

    fn disable(&self) {
        let mut state = self.state.lock();
        state.pages.clear();
        state.handler = None;
    }
}

#[derive(Default)]
struct ManagedState {
    /// クラス名 -> メソッド名 -> オーバーロード数
    classes: HashMap<String, HashMap<String, usize>>,
    loaded: HashSet<String>,
    hooks: HashMap<(String, String), Arc<dyn ManagedHookHandler>>,
    class_handlers: Vec<Arc<dyn ClassLoadHandler>>,
    stacks: HashMap<ThreadId, Vec<String>>,
}

/// メソッドテーブルを持つマネージドランタイム
#[derive(Default)]
pub struct SimManagedRuntime {
    state: Mutex<ManagedState>,
}

impl SimManagedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_method(&self, class_name: &str, method: &str, overloads: usize) {
        self.state
            .lock()
            .classes
            .entry(class_name.to_string())
            .or_default()
            .insert(method.to_string(), overloads);
    }

    pub fn is_hooked(&self, class_name: &str, method: &str) -> bool {
        self.state
            .lock()
            .hooks
            .contains_key(&(class_name.to_string(), method.to_string()))
    }

    /// メソッドを呼び出す。フックされていればハンドラを呼び、呼んだかどうかを返す
    pub fn invoke(
        &self,
        thread_id: ThreadId,
        class_name: &str,
        method: &str,
        args: &[ManagedArg],
        this: Option<ManagedHandle>,
    ) -> bool {
        let class_method = format!("{}.{}", class_name, method);
        let handler = {
            let mut state = self.state.lock();
            state
                .stacks
                .entry(thread_id)
                .or_default()
                .push(class_method.clone());
            state
                .hooks
                .get(&(class_name.to_string(), method.to_string()))
                .cloned()
        };

        if let Some(handler) = &handler {
            handler.on_call(thread_id, &class_method, args, this);
        }

        if let Some(stack) = self.state.lock().stacks.get_mut(&thread_id) {
            stack.pop();
        }
        handler.is_some()
    }

    /// クラスをロードする。初回ロードのときだけ監視ハンドラを呼ぶ
    pub fn load_class(&self, thread_id: ThreadId, class_name: &str) {
        let handlers = {
            let mut state = self.state.lock();
            if !state.loaded.insert(class_name.to_string()) {
                return;
            }
            state.classes.entry(class_name.to_string()).or_default();
            state.class_handlers.clone()
        };

        for handler in handlers {
            handler.on_class_loading(thread_id, class_name);
        }
    }
}

impl ManagedRuntime for SimManagedRuntime {
    fn available(&self) -> bool {
        true
    }

    fn hook_method(
        &self,
        class_name: &str,
        method: &str,
        handler: Arc<dyn ManagedHookHandler>,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let overloads = state
            .classes
            .get(class_name)
            .ok_or_else(|| anyhow::anyhow!("Class {} not found", class_name))?
            .get(method)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Method {}.{} not found", class_name, method))?;

        state
            .hooks
            .insert((class_name.to_string(), method.to_string()), handler);
        Ok(overloads)
    }

    fn unhook_method(&self, class_name: &str, method: &str) -> Result<()> {
        self.state
            .lock()
            .hooks
            .remove(&(class_name.to_string(), method.to_string()))
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("Method {}.{} is not hooked", class_name, method))
    }

    fn watch_class_loading(&self, handler: Arc<dyn ClassLoadHandler>) -> Result<()> {
        self.state.lock().class_handlers.push(handler);
        Ok(())
    }

    fn backtrace(&self, thread_id: ThreadId) -> Vec<String> {
        self.state
            .lock()
            .stacks
            .get(&thread_id)
            .map(|stack| stack.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

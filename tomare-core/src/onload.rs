//! モジュールとクラスのロード時のフック

use crate::engine::Engine;
use crate::event::{Event, ModuleSummary, Reason};
use crate::registry::HookKey;
use crate::suspension::{ManagedCall, TrapSite};
use std::sync::Weak;
use tomare_target::{ClassLoadHandler, CpuContext, ModuleInfo, ModuleLoadHandler, ThreadId};

/// ロード通知を受けるハンドラ
pub(crate) struct OnLoadHandler {
    pub(crate) engine: Weak<Engine>,
}

impl ModuleLoadHandler for OnLoadHandler {
    fn on_module_loading(&self, thread_id: ThreadId, module: &ModuleInfo, context: &mut CpuContext) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_module_loading(thread_id, module, context);
        }
    }
}

impl ClassLoadHandler for OnLoadHandler {
    fn on_class_loading(&self, thread_id: ThreadId, class_name: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_class_loading(thread_id, class_name);
        }
    }
}

impl Engine {
    /// 名前の一部が一致するonloadフックごとに、ロード中のスレッドを停止する
    fn on_module_loading(&self, thread_id: ThreadId, module: &ModuleInfo, context: &mut CpuContext) {
        let Some(module) = self.target.process.find_module_by_name(&module.name) else {
            tracing::debug!("[{}] loading module {} not found", thread_id, module.name);
            return;
        };

        self.sink.send(Event::NativeOnLoadModuleLoading {
            tid: thread_id,
            module: module.clone(),
        });

        let matching: Vec<HookKey> = self
            .hooks
            .snapshot()
            .into_iter()
            .map(|record| record.key)
            .filter(|key| matches!(key, HookKey::NativeOnLoad(name) if module.name.contains(name.as_str())))
            .collect();

        for key in matching {
            let summary = ModuleSummary {
                module: module.name.clone(),
                module_base: module.base,
                module_entry: module.entry,
            };
            self.hooks.update(&key, |record| record.module = Some(summary.clone()));

            tracing::debug!("[{}] onload hook {} hit by {}", thread_id, key, module.name);
            self.sink.send(Event::NativeOnLoadCallback {
                tid: thread_id,
                module: module.name.clone(),
                module_base: module.base,
                module_entry: module.entry,
            });

            let site = TrapSite::new(thread_id, Reason::NativeOnLoad)
                .at(context.pc())
                .hook(key)
                .module(summary);
            self.suspend(site, Some(&mut *context), Vec::new());
        }
    }

    /// クラスの初回ロードを通知し、onloadフックがあれば停止する
    fn on_class_loading(&self, thread_id: ThreadId, class_name: &str) {
        self.sink.send(Event::ClassLoaderLoadingClass {
            tid: thread_id,
            class_name: class_name.to_string(),
        });

        let key = HookKey::ManagedOnLoad(class_name.to_string());
        if !self.hooks.contains(&key) {
            return;
        }

        self.sink.send(Event::JavaOnLoadCallback {
            tid: thread_id,
            class_name: class_name.to_string(),
        });

        let site = TrapSite::new(thread_id, Reason::Breakpoint)
            .hook(key)
            .managed(ManagedCall {
                class_method: class_name.to_string(),
                args: Vec::new(),
                this: None,
            });
        self.suspend(site, None, Vec::new());
    }
}

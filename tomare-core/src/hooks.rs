//! フックの登録と削除
//!
//! ネイティブアドレスへのインターセプト、マネージドメソッドのフック、
//! モジュールとクラスのロード時のフックを扱います。

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::event::{Event, Reason};
use crate::expr::{Condition, HookLogic};
use crate::parse::{dethumbify, parse_address, to_hex};
use crate::registry::{HookKey, HookRecord};
use crate::suspension::{ManagedCall, TrapSite};
use crate::Result;
use std::sync::{Arc, Weak};
use tomare_target::{ManagedArg, ManagedHandle, ManagedHookHandler, ThreadId, TrapFrame, TrapHandler};

/// フック登録時のオプション
#[derive(Debug, Clone)]
pub struct HookOptions {
    pub condition: Option<Condition>,
    pub logic: Option<HookLogic>,
    /// シンボルとバックトレースを計算する
    pub show_details: bool,
    pub internal: bool,
    pub one_shot: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            condition: None,
            logic: None,
            show_details: true,
            internal: false,
            one_shot: false,
        }
    }
}

impl HookOptions {
    fn into_record(self, key: HookKey) -> HookRecord {
        let mut record = HookRecord::new(key);
        record.condition = self.condition;
        record.logic = self.logic;
        record.show_details = self.show_details;
        record.internal = self.internal;
        record.one_shot = self.one_shot;
        record
    }
}

/// `pkg.Class.method` をクラス名とメソッド名に分ける
pub fn split_class_method(class_method: &str) -> Option<(&str, &str)> {
    let (class_name, method) = class_method.rsplit_once('.')?;
    if class_name.is_empty() || method.is_empty() {
        return None;
    }
    Some((class_name, method))
}

/// ネイティブアドレスのトラップ
struct NativeTrap {
    engine: Weak<Engine>,
    key: HookKey,
}

impl TrapHandler for NativeTrap {
    fn on_trap(&self, frame: &mut TrapFrame<'_>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let site = TrapSite::new(frame.thread_id, Reason::Breakpoint)
            .at(frame.address)
            .hook(self.key.clone());
        engine.suspend(site, Some(&mut *frame.context), frame.args.clone());
    }
}

/// マネージドメソッド呼び出しのトラップ
struct ManagedTrap {
    engine: Weak<Engine>,
    key: HookKey,
}

impl ManagedHookHandler for ManagedTrap {
    fn on_call(&self, thread_id: ThreadId, class_method: &str, args: &[ManagedArg], this: Option<ManagedHandle>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let site = TrapSite::new(thread_id, Reason::Breakpoint)
            .hook(self.key.clone())
            .managed(ManagedCall {
                class_method: class_method.to_string(),
                args: args.to_vec(),
                this,
            });
        engine.suspend(site, None, Vec::new());
    }
}

impl Engine {
    /// 登録済みのネイティブフックにインターセプタを付ける
    pub(crate) fn attach_hook(&self, key: &HookKey) -> Result<()> {
        let HookKey::Native(address) = key else {
            return Ok(());
        };

        if let Some(old) = self.hooks.take_handle(key) {
            self.target.interceptor.detach(old);
        }

        let handler = Arc::new(NativeTrap {
            engine: self.self_ref.clone(),
            key: key.clone(),
        });
        let handle = self
            .target
            .interceptor
            .attach(*address, handler)
            .map_err(|e| anyhow::anyhow!("Failed to attach at {:#x}: {}", address, e))?;
        self.target.interceptor.flush();

        // 付けている間に削除された
        if !self.hooks.set_handle(key, handle) {
            self.target.interceptor.detach(handle);
            self.target.interceptor.flush();
        }
        Ok(())
    }

    /// ネイティブアドレスにフックを登録する（同じアドレスの記録は上書き）
    pub fn hook_native(&self, address: u64, options: HookOptions) -> Result<HookKey> {
        let address = dethumbify(self.target.arch(), address);
        let key = HookKey::Native(address);

        if let Some(handle) = self.hooks.remove(&key).and_then(|old| old.handle) {
            self.target.interceptor.detach(handle);
            self.target.interceptor.flush();
        }

        let size = self.target.pointer_size() * 2;
        let bytes = self
            .target
            .memory
            .read(address, size)
            .map_err(|e| anyhow::anyhow!("Failed to read {} bytes at {:#x}: {}", size, address, e))?;

        let mut record = options.into_record(key.clone());
        record.bytes = Some(to_hex(&bytes));
        record.debug_symbol = self.target.symbols.symbol_for(address);

        let event = Event::HookNativeCallback {
            ptr: address,
            bytes: to_hex(&bytes),
            logic: record.logic.as_ref().map(HookLogic::describe),
            condition: record.condition.as_ref().map(Condition::describe),
            internal: record.internal,
            debug_symbol: record.debug_symbol.clone(),
        };

        self.hooks.insert(record);
        if let Err(e) = self.attach_hook(&key) {
            self.hooks.remove(&key);
            return Err(e);
        }

        tracing::debug!("hooked native {}", key);
        self.sink.send(event);
        Ok(key)
    }

    /// マネージドメソッドのすべてのオーバーロードにフックを登録し、オーバーロード数を返す
    pub fn hook_managed_method(&self, class_method: &str, options: HookOptions) -> Result<usize> {
        let (class_name, method) = split_class_method(class_method)
            .ok_or_else(|| EngineError::invalid_argument("hookJavaMethod", format!("'{}' has no method name", class_method)))?;
        let managed = self
            .target
            .managed
            .as_ref()
            .filter(|m| m.available())
            .ok_or_else(|| anyhow::anyhow!("Managed runtime is not available"))?;

        let key = HookKey::Managed(class_method.to_string());
        if self.hooks.remove(&key).is_some() {
            self.unhook_managed(class_method);
        }

        let handler = Arc::new(ManagedTrap {
            engine: self.self_ref.clone(),
            key: key.clone(),
        });
        let overloads = managed
            .hook_method(class_name, method, handler)
            .map_err(|e| anyhow::anyhow!("Failed to hook {}: {}", class_method, e))?;

        let mut record = options.into_record(key);
        record.overloads = overloads;
        let internal = record.internal;
        self.hooks.insert(record);

        tracing::debug!("hooked {} ({} overloads)", class_method, overloads);
        if !internal {
            self.sink.send(Event::HookJavaCallback {
                class_method: class_method.to_string(),
            });
        }
        Ok(overloads)
    }

    pub(crate) fn unhook_managed(&self, class_method: &str) {
        let (Some(managed), Some((class_name, method))) =
            (self.target.managed.as_ref(), split_class_method(class_method))
        else {
            return;
        };
        if let Err(e) = managed.unhook_method(class_name, method) {
            tracing::warn!("Failed to unhook {}: {}", class_method, e);
        }
    }

    /// モジュールのロード時のフックを登録する。既にあれば `false`
    pub fn hook_native_on_load(&self, module_name: &str, options: HookOptions) -> bool {
        let key = HookKey::NativeOnLoad(module_name.to_string());
        if self.hooks.contains(&key) {
            return false;
        }
        self.hooks.insert(options.into_record(key));
        self.sink.send(Event::HookNativeOnLoadCallback {
            module: module_name.to_string(),
        });
        true
    }

    /// クラスのロード時のフックを登録する。既にあれば `false`
    pub fn hook_managed_on_load(&self, class_name: &str, options: HookOptions) -> bool {
        let key = HookKey::ManagedOnLoad(class_name.to_string());
        if self.hooks.contains(&key) {
            return false;
        }
        self.hooks.insert(options.into_record(key));
        self.sink.send(Event::HookJavaOnLoadCallback {
            class_name: class_name.to_string(),
        });
        true
    }

    /// コントローラから渡された識別子でフックを削除する
    ///
    /// `0x` で始まる文字列か10進数はネイティブアドレス、それ以外は
    /// マネージドメソッド、モジュール名、クラス名の順に探します。
    pub fn delete_hook(&self, key: &str) -> bool {
        let key = key.trim();
        if key.starts_with("0x") || key.starts_with("0X") || (!key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())) {
            return match parse_address(key) {
                Ok(address) => self.delete_hook_key(&HookKey::Native(dethumbify(self.target.arch(), address))),
                Err(e) => {
                    tracing::warn!("Failed to delete hook: {}", e);
                    false
                }
            };
        }

        let candidates = [
            HookKey::Managed(key.to_string()),
            HookKey::NativeOnLoad(key.to_string()),
            HookKey::ManagedOnLoad(key.to_string()),
        ];
        match candidates.iter().find(|k| self.hooks.contains(k)) {
            Some(found) => self.delete_hook_key(found),
            None => {
                tracing::warn!("Failed to delete hook: {}", EngineError::UnknownHook(key.to_string()));
                false
            }
        }
    }

    /// フックを削除し、インターセプトを外す
    pub fn delete_hook_key(&self, key: &HookKey) -> bool {
        let Some(record) = self.hooks.remove(key) else {
            tracing::warn!("Failed to delete hook: {}", EngineError::UnknownHook(key.to_string()));
            return false;
        };

        match key {
            HookKey::Native(_) => {
                if let Some(handle) = record.handle {
                    self.target.interceptor.detach(handle);
                    self.target.interceptor.flush();
                }
            }
            HookKey::Managed(class_method) => self.unhook_managed(class_method),
            HookKey::NativeOnLoad(_) | HookKey::ManagedOnLoad(_) => {}
        }

        tracing::debug!("deleted hook {}", key);
        self.sink.send(Event::HookDeleted {
            category: key.category(),
            key: key.to_string(),
        });
        true
    }

    /// 条件やロジックを書き換えられるフックを探す
    fn editable_hook(&self, key: &str) -> Option<HookKey> {
        if let Ok(address) = parse_address(key) {
            let native = HookKey::Native(dethumbify(self.target.arch(), address));
            if self.hooks.contains(&native) {
                return Some(native);
            }
        }
        let onload = HookKey::NativeOnLoad(key.to_string());
        self.hooks.contains(&onload).then_some(onload)
    }

    /// 条件を置き換える（空文字列なら消す）
    pub fn set_hook_condition(&self, key: &str, source: &str) -> bool {
        let Some(key) = self.editable_hook(key) else {
            tracing::warn!("Failed to set condition: {}", EngineError::UnknownHook(key.to_string()));
            return false;
        };
        let condition = match source.trim() {
            "" => None,
            text => match Condition::parse(text) {
                Ok(condition) => Some(condition),
                Err(e) => {
                    tracing::warn!("Failed to parse condition '{}': {}", text, e);
                    return false;
                }
            },
        };
        self.set_condition(&key, condition)
    }

    /// ロジックを置き換える（空文字列なら消す）
    pub fn set_hook_logic(&self, key: &str, source: &str) -> bool {
        let Some(key) = self.editable_hook(key) else {
            tracing::warn!("Failed to set logic: {}", EngineError::UnknownHook(key.to_string()));
            return false;
        };
        let logic = match source.trim() {
            "" => None,
            text => match HookLogic::parse(text) {
                Ok(logic) => Some(logic),
                Err(e) => {
                    tracing::warn!("Failed to parse logic '{}': {}", text, e);
                    return false;
                }
            },
        };
        self.set_logic(&key, logic)
    }

    pub fn set_condition(&self, key: &HookKey, condition: Option<Condition>) -> bool {
        self.hooks.update(key, |record| record.condition = condition)
    }

    pub fn set_logic(&self, key: &HookKey, logic: Option<HookLogic>) -> bool {
        self.hooks.update(key, |record| record.logic = logic)
    }
}

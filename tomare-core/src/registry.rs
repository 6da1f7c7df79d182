//! フックレジストリ

use crate::event::{HookCategory, ModuleSummary};
use crate::expr::{Condition, HookLogic};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tomare_symbols::DebugSymbol;
use tomare_target::InterceptorHandle;

/// フックの識別子
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookKey {
    /// ネイティブアドレス（ARMではThumbビットを落とした値）
    Native(u64),
    /// `pkg.Class.method`
    Managed(String),
    /// モジュール名
    NativeOnLoad(String),
    /// クラス名
    ManagedOnLoad(String),
}

impl HookKey {
    pub fn category(&self) -> HookCategory {
        match self {
            HookKey::Native(_) => HookCategory::Native,
            HookKey::Managed(_) => HookCategory::Java,
            HookKey::NativeOnLoad(_) => HookCategory::NativeOnLoad,
            HookKey::ManagedOnLoad(_) => HookCategory::JavaOnLoad,
        }
    }
}

impl fmt::Display for HookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKey::Native(addr) => write!(f, "{:#x}", addr),
            HookKey::Managed(name) | HookKey::NativeOnLoad(name) | HookKey::ManagedOnLoad(name) => {
                f.write_str(name)
            }
        }
    }
}

/// インターセプトの記録
#[derive(Debug, Clone)]
pub struct HookRecord {
    pub key: HookKey,
    pub condition: Option<Condition>,
    pub logic: Option<HookLogic>,
    /// エンジン内部で使うフック（コントローラには表示しない）
    pub internal: bool,
    /// シンボルとバックトレースを計算する
    pub show_details: bool,
    /// 最初のヒットで自身を削除する
    pub one_shot: bool,
    /// フック位置の元のバイト列（16進）
    pub bytes: Option<String>,
    pub debug_symbol: Option<DebugSymbol>,
    /// ネイティブonloadでヒットしたモジュール
    pub module: Option<ModuleSummary>,
    /// マネージドメソッドのオーバーロード数
    pub overloads: usize,
    pub(crate) handle: Option<InterceptorHandle>,
}

impl HookRecord {
    pub fn new(key: HookKey) -> Self {
        Self {
            key,
            condition: None,
            logic: None,
            internal: false,
            show_details: true,
            one_shot: false,
            bytes: None,
            debug_symbol: None,
            module: None,
            overloads: 0,
            handle: None,
        }
    }

    /// インターセプタがアタッチされているか
    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// コントローラ向けの表現
    pub fn summary(&self) -> Value {
        json!({
            "key": self.key.to_string(),
            "category": self.key.category(),
            "condition": self.condition.as_ref().map(Condition::describe),
            "logic": self.logic.as_ref().map(HookLogic::describe),
            "internal": self.internal,
            "details": self.show_details,
            "bytes": self.bytes,
            "debugSymbol": self.debug_symbol,
            "module": self.module,
            "overloads": self.overloads,
            "attached": self.is_attached(),
        })
    }
}

/// プロセス全体のフック表
///
/// 識別子ごとに記録は1つだけで、再登録は上書きします。
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HashMap<HookKey, HookRecord>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登録し、上書きされた記録を返す
    pub fn insert(&self, record: HookRecord) -> Option<HookRecord> {
        self.hooks.lock().insert(record.key.clone(), record)
    }

    pub fn get(&self, key: &HookKey) -> Option<HookRecord> {
        self.hooks.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &HookKey) -> bool {
        self.hooks.lock().contains_key(key)
    }

    pub fn remove(&self, key: &HookKey) -> Option<HookRecord> {
        self.hooks.lock().remove(key)
    }

    /// インターセプタのハンドルを取り出す（記録は残る）
    pub fn take_handle(&self, key: &HookKey) -> Option<InterceptorHandle> {
        self.hooks.lock().get_mut(key).and_then(|r| r.handle.take())
    }

    /// ハンドルを設定する。記録がなければ `false`
    pub fn set_handle(&self, key: &HookKey, handle: InterceptorHandle) -> bool {
        match self.hooks.lock().get_mut(key) {
            Some(record) => {
                record.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    /// 記録を書き換える。記録がなければ `false`
    pub fn update(&self, key: &HookKey, f: impl FnOnce(&mut HookRecord)) -> bool {
        match self.hooks.lock().get_mut(key) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<HookRecord> {
        self.hooks.lock().values().cloned().collect()
    }

    /// 条件に合う記録をすべて取り除いて返す
    pub fn drain_where(&self, pred: impl Fn(&HookRecord) -> bool) -> Vec<HookRecord> {
        let mut hooks = self.hooks.lock();
        let keys: Vec<HookKey> = hooks
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| hooks.remove(&k)).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

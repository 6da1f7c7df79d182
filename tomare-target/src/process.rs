//! プロセスとモジュールの情報

use crate::{Arch, CpuContext, Platform, Result, ThreadId};
use serde::{Serialize, Serializer};
use std::sync::Arc;

/// ロードされたモジュール
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    #[serde(serialize_with = "serialize_hex")]
    pub base: u64,
    pub size: u64,
    /// エントリポイント（実行可能ファイルのみ）
    #[serde(serialize_with = "serialize_opt_hex")]
    pub entry: Option<u64>,
}

impl ModuleInfo {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base.saturating_add(self.size)
    }
}

fn serialize_hex<S: Serializer>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:#x}", value))
}

fn serialize_opt_hex<S: Serializer>(
    value: &Option<u64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&format!("{:#x}", v)),
        None => serializer.serialize_none(),
    }
}

/// モジュールのロードを通知するハンドラ
///
/// モジュールがマップされ、初期化コードが実行される前にロードしたスレッド上で呼ばれます。
pub trait ModuleLoadHandler: Send + Sync {
    fn on_module_loading(&self, thread_id: ThreadId, module: &ModuleInfo, context: &mut CpuContext);
}

/// プロセスとモジュールの列挙
pub trait ProcessInfo: Send + Sync {
    fn arch(&self) -> Arch;

    fn platform(&self) -> Platform;

    fn pid(&self) -> i32;

    fn pointer_size(&self) -> usize {
        self.arch().pointer_size()
    }

    fn modules(&self) -> Vec<ModuleInfo>;

    fn find_module_by_name(&self, name: &str) -> Option<ModuleInfo> {
        self.modules().into_iter().find(|m| m.name == name)
    }

    fn module_for_address(&self, addr: u64) -> Option<ModuleInfo> {
        self.modules().into_iter().find(|m| m.contains(addr))
    }

    /// メインの実行可能ファイルのエントリポイント
    fn entry_point(&self) -> Option<u64>;

    /// モジュールのロード監視を開始する
    fn watch_module_loading(&self, handler: Arc<dyn ModuleLoadHandler>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_info_serializes_hex() {
        let module = ModuleInfo {
            name: "libc.so.6".to_string(),
            path: "/lib/libc.so.6".to_string(),
            base: 0x7f00_0000_0000,
            size: 0x1000,
            entry: None,
        };
        let json = serde_json::to_value(&module).unwrap();
        assert_eq!(json["base"], "0x7f0000000000");
        assert!(json["entry"].is_null());
    }
}

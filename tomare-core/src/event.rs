//! コントローラに送るイベント
//!
//! すべてのイベントは `event` フィールドに種別名を持つJSONオブジェクトとして送られます。

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use tomare_symbols::DebugSymbol;
use tomare_target::{Arch, ManagedArg, MemoryOperation, ModuleInfo, Platform, ThreadId};

/// スレッドが停止した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    InitialContext,
    Breakpoint,
    Watcher,
    NativeOnLoad,
    Step,
}

impl Reason {
    /// ワイヤ上の理由コード
    pub fn code(&self) -> i32 {
        match self {
            Reason::InitialContext => -1,
            Reason::Breakpoint => 0,
            Reason::Watcher => 1,
            Reason::NativeOnLoad => 2,
            Reason::Step => 3,
        }
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

pub(crate) fn hex<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:#x}", value))
}

pub(crate) fn opt_hex<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&format!("{:#x}", v)),
        None => serializer.serialize_none(),
    }
}

/// 値の簡易分類
///
/// `[種別コード, 値]` の2要素配列として送られます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telescope {
    /// 読み取り可能な印字可能文字列を指している
    String(String),
    /// 読み取り可能なメモリを指している（値は指す先のワード）
    Pointer(u64),
    /// 読み取り可能だが参照先を読めない
    Value(u64),
    Invalid(u64),
}

impl Telescope {
    pub fn code(&self) -> i32 {
        match self {
            Telescope::String(_) => 0,
            Telescope::Pointer(_) => 1,
            Telescope::Value(_) => 2,
            Telescope::Invalid(_) => -1,
        }
    }
}

impl Serialize for Telescope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.code())?;
        match self {
            Telescope::String(s) => tuple.serialize_element(s)?,
            Telescope::Pointer(v) | Telescope::Value(v) | Telescope::Invalid(v) => {
                tuple.serialize_element(&format!("{:#x}", v))?
            }
        }
        tuple.end()
    }
}

/// pcレジスタに付く命令のメタデータ
#[derive(Debug, Clone, Serialize)]
pub struct InstructionInfo {
    pub size: u32,
    pub groups: Vec<String>,
    pub thumb: bool,
}

/// 1つのレジスタの値と注釈
#[derive(Debug, Clone, Serialize)]
pub struct RegisterInfo {
    pub name: &'static str,
    #[serde(serialize_with = "hex")]
    pub value: u64,
    pub is_valid_pointer: bool,
    pub telescope: Telescope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<DebugSymbol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<InstructionInfo>,
}

/// ネイティブバックトレースの1フレーム
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(serialize_with = "hex")]
    pub address: u64,
    pub symbol: Option<DebugSymbol>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "bt", rename_all = "lowercase")]
pub enum Backtrace {
    Native(Vec<Frame>),
    Java(Vec<String>),
}

/// 初期コンテキストに付くプロセスの情報
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub arch: Arch,
    pub platform: Platform,
    pub java: bool,
    pub pid: i32,
    pub pointer_size: usize,
}

/// ネイティブonloadの停止に付くモジュールの情報
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub module: String,
    #[serde(serialize_with = "hex")]
    pub module_base: u64,
    #[serde(serialize_with = "opt_hex")]
    pub module_entry: Option<u64>,
}

/// 停止したスレッドの状態
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub tid: ThreadId,
    pub reason: Reason,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSummary>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleSummary>,
    #[serde(serialize_with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub ptr: Option<u64>,
    pub is_java: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<RegisterInfo>>,
    /// マネージドトラップの引数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub java_args: Option<Vec<ManagedArg>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Backtrace>,
}

impl ContextInfo {
    pub fn new(tid: ThreadId, reason: Reason) -> Self {
        Self {
            tid,
            reason,
            process: None,
            module: None,
            ptr: None,
            is_java: false,
            context: None,
            java_args: None,
            class_method: None,
            backtrace: None,
        }
    }

    pub fn register(&self, name: &str) -> Option<&RegisterInfo> {
        self.context.as_ref()?.iter().find(|r| r.name == name)
    }
}

/// 削除されたフックの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCategory {
    Native,
    Java,
    NativeOnLoad,
    JavaOnLoad,
}

/// エンジンからコントローラへのイベント
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SetContext(ContextInfo),
    Release {
        tid: ThreadId,
        reason: Reason,
    },
    SetContextValue {
        tid: ThreadId,
        register: String,
        #[serde(serialize_with = "hex")]
        value: u64,
    },
    HookNativeCallback {
        #[serde(serialize_with = "hex")]
        ptr: u64,
        bytes: String,
        logic: Option<String>,
        condition: Option<String>,
        internal: bool,
        debug_symbol: Option<DebugSymbol>,
    },
    HookJavaCallback {
        class_method: String,
    },
    HookNativeOnLoadCallback {
        module: String,
    },
    HookJavaOnLoadCallback {
        class_name: String,
    },
    HookDeleted {
        category: HookCategory,
        key: String,
    },
    WatcherAdded {
        #[serde(serialize_with = "hex")]
        address: u64,
        flags: u8,
        debug_symbol: Option<DebugSymbol>,
    },
    WatcherRemoved {
        #[serde(serialize_with = "hex")]
        address: u64,
    },
    Watcher {
        tid: ThreadId,
        #[serde(serialize_with = "hex")]
        address: u64,
        operation: MemoryOperation,
        #[serde(serialize_with = "hex")]
        from: u64,
    },
    NativeOnLoadModuleLoading {
        tid: ThreadId,
        module: ModuleInfo,
    },
    NativeOnLoadCallback {
        tid: ThreadId,
        module: String,
        #[serde(serialize_with = "hex")]
        module_base: u64,
        #[serde(serialize_with = "opt_hex")]
        module_entry: Option<u64>,
    },
    ClassLoaderLoadingClass {
        tid: ThreadId,
        class_name: String,
    },
    JavaOnLoadCallback {
        tid: ThreadId,
        class_name: String,
    },
    Resume,
    Detached,
}

impl Event {
    /// イベントの種別名
    pub fn name(&self) -> &'static str {
        match self {
            Event::SetContext(_) => "set_context",
            Event::Release { .. } => "release",
            Event::SetContextValue { .. } => "set_context_value",
            Event::HookNativeCallback { .. } => "hook_native_callback",
            Event::HookJavaCallback { .. } => "hook_java_callback",
            Event::HookNativeOnLoadCallback { .. } => "hook_native_on_load_callback",
            Event::HookJavaOnLoadCallback { .. } => "hook_java_on_load_callback",
            Event::HookDeleted { .. } => "hook_deleted",
            Event::WatcherAdded { .. } => "watcher_added",
            Event::WatcherRemoved { .. } => "watcher_removed",
            Event::Watcher { .. } => "watcher",
            Event::NativeOnLoadModuleLoading { .. } => "native_on_load_module_loading",
            Event::NativeOnLoadCallback { .. } => "native_on_load_callback",
            Event::ClassLoaderLoadingClass { .. } => "class_loader_loading_class",
            Event::JavaOnLoadCallback { .. } => "java_on_load_callback",
            Event::Resume => "resume",
            Event::Detached => "detached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reason_codes() {
        assert_eq!(serde_json::to_value(Reason::InitialContext).unwrap(), json!(-1));
        assert_eq!(serde_json::to_value(Reason::Step).unwrap(), json!(3));
    }

    #[test]
    fn test_telescope_is_pair() {
        let ts = Telescope::String("hello".into());
        assert_eq!(serde_json::to_value(&ts).unwrap(), json!([0, "hello"]));
        let ts = Telescope::Invalid(0x10);
        assert_eq!(serde_json::to_value(&ts).unwrap(), json!([-1, "0x10"]));
    }

    #[test]
    fn test_event_tag_matches_name() {
        let events = vec![
            Event::Release { tid: 1, reason: Reason::Breakpoint },
            Event::HookDeleted { category: HookCategory::NativeOnLoad, key: "libc".into() },
            Event::Resume,
            Event::SetContext(ContextInfo::new(1, Reason::Step)),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.name());
        }
    }

    #[test]
    fn test_context_info_flattens_process() {
        let mut info = ContextInfo::new(7, Reason::InitialContext);
        info.process = Some(ProcessSummary {
            arch: Arch::X64,
            platform: Platform::Linux,
            java: false,
            pid: 42,
            pointer_size: 8,
        });
        let value = serde_json::to_value(Event::SetContext(info)).unwrap();
        assert_eq!(value["tid"], 7);
        assert_eq!(value["reason"], -1);
        assert_eq!(value["arch"], "x64");
        assert_eq!(value["pointer_size"], 8);
        assert!(value.get("context").is_none());
    }
}

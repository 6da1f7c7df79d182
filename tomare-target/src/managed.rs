//! マネージドランタイム（VM上の言語）のメソッドフック

use crate::{Result, ThreadId};
use serde::Serialize;
use std::sync::Arc;

/// マネージドメソッド呼び出しの引数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedArg {
    pub class_name: String,
    pub value: String,
}

/// 呼び出し中のオブジェクトへのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagedHandle(pub u64);

/// マネージドメソッドが呼ばれたときのハンドラ
pub trait ManagedHookHandler: Send + Sync {
    fn on_call(
        &self,
        thread_id: ThreadId,
        class_method: &str,
        args: &[ManagedArg],
        this: Option<ManagedHandle>,
    );
}

/// クラスがロードされるときのハンドラ
pub trait ClassLoadHandler: Send + Sync {
    fn on_class_loading(&self, thread_id: ThreadId, class_name: &str);
}

/// マネージドランタイムとのブリッジ
pub trait ManagedRuntime: Send + Sync {
    /// ランタイムが利用可能か
    fn available(&self) -> bool;

    /// `class_name.method` のすべてのオーバーロードをフックし、フックした数を返す
    fn hook_method(
        &self,
        class_name: &str,
        method: &str,
        handler: Arc<dyn ManagedHookHandler>,
    ) -> Result<usize>;

    fn unhook_method(&self, class_name: &str, method: &str) -> Result<()>;

    /// クラスローダーの監視を開始する
    fn watch_class_loading(&self, handler: Arc<dyn ClassLoadHandler>) -> Result<()>;

    /// 呼び出し元スレッドのマネージドバックトレース
    fn backtrace(&self, thread_id: ThreadId) -> Vec<String>;
}

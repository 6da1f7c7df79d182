//! 例外処理とメモリアクセス監視

use crate::{CpuContext, MemoryRange, Result, ThreadId};
use serde::Serialize;
use std::sync::Arc;

/// メモリアクセスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOperation {
    Read,
    Write,
    Execute,
}

impl MemoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryOperation::Read => "read",
            MemoryOperation::Write => "write",
            MemoryOperation::Execute => "execute",
        }
    }
}

/// 例外の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    AccessViolation,
    Breakpoint,
    SingleStep,
    IllegalInstruction,
    Other,
}

/// 例外の詳細
///
/// `address` は例外を起こした命令のアドレスです。
pub struct ExceptionDetails<'a> {
    pub thread_id: ThreadId,
    pub kind: ExceptionKind,
    pub address: u64,
    /// アクセス違反の場合のアクセス先
    pub memory: Option<(MemoryOperation, u64)>,
    pub context: &'a mut CpuContext,
}

/// 例外ハンドラの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    /// 処理しなかった（次のハンドラまたはデフォルト動作へ）
    Unhandled,
    /// 例外を起こした命令を再実行する
    Resume,
    /// 再実行し、再実行が終わったら `after_retry` を呼ぶ
    ResumeAndNotify,
}

/// プロセス全体の例外ハンドラ
pub trait ExceptionHandler: Send + Sync {
    fn on_exception(&self, details: &mut ExceptionDetails<'_>) -> ExceptionAction;

    /// `ResumeAndNotify` で再実行した命令が完了した後に呼ばれる
    fn after_retry(&self, _thread_id: ThreadId, _address: u64) {}
}

/// 例外ハンドラの登録先
pub trait ExceptionPort: Send + Sync {
    fn set_handler(&self, handler: Arc<dyn ExceptionHandler>) -> Result<()>;
}

/// アクセスモニタから通知されるアクセス
#[derive(Debug, Clone)]
pub struct AccessDetails {
    pub thread_id: ThreadId,
    pub operation: MemoryOperation,
    /// アクセスした命令のアドレス
    pub from: u64,
    pub address: u64,
}

pub trait AccessMonitorHandler: Send + Sync {
    fn on_access(&self, details: &AccessDetails);
}

/// ページ単位のアクセスモニタ
///
/// 監視範囲の各ページは最初のアクセスで一度だけ通知され、再度 `enable` するまで通知されません。
pub trait AccessMonitor: Send + Sync {
    fn enable(&self, ranges: &[MemoryRange], handler: Arc<dyn AccessMonitorHandler>) -> Result<()>;
    fn disable(&self);
}

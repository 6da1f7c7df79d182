//! エンジンのエラー型

use tomare_target::{Arch, ThreadId};

/// 呼び出し元が区別する必要のあるエンジンの失敗
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 命令トレーサが対応していないアーキテクチャでのステップ実行
    #[error("stepping is not supported on {0}")]
    UnsupportedArchitecture(Arch),

    /// ネイティブコンテキストを持たないスレッドでのステップ実行
    #[error("thread {0} has no native context")]
    NoNativeContext(ThreadId),

    /// 既に停止中のスレッドでのトラップ
    #[error("thread {0} is already suspended")]
    ThreadAlreadySuspended(ThreadId),

    #[error("unknown hook {0}")]
    UnknownHook(String),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("invalid argument for {command}: {reason}")]
    InvalidArgument { command: String, reason: String },
}

impl EngineError {
    pub fn invalid_argument(command: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

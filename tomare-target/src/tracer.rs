//! 命令レベルのスレッドトレース

use crate::{CpuContext, Result, ThreadId};
use serde::Serialize;
use std::sync::Arc;

/// デコードされた命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    #[serde(skip)]
    pub address: u64,
    pub size: u32,
    pub mnemonic: String,
    pub op_str: String,
    /// 逆アセンブラの命令グループ名（"jump", "call", "ret" など）
    pub groups: Vec<String>,
}

/// ステップ実行の判定に使う命令の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    Plain,
    Jump,
    Call,
    Return,
}

impl Instruction {
    fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }

    /// 命令を分類する
    pub fn kind(&self) -> InstructionKind {
        if self.in_group("call") {
            InstructionKind::Call
        } else if self.in_group("ret") || self.in_group("iret") || self.mnemonic == "ret" {
            InstructionKind::Return
        } else if self.in_group("jump") {
            InstructionKind::Jump
        } else {
            InstructionKind::Plain
        }
    }

    /// Thumb命令かどうか
    pub fn thumb(&self) -> bool {
        self.in_group("thumb") || self.in_group("thumb2")
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.op_str.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.op_str)
        }
    }
}

/// アドレスの命令をデコードする
pub trait InstructionDecoder: Send + Sync {
    fn decode(&self, address: u64) -> Result<Instruction>;
}

/// 再生成中のベーシックブロック
///
/// `next` で次の命令を受け取り、`keep` で再生成に含め、`put_callout` で
/// その命令の実行直前（pcがその命令のアドレスの状態）にコールアウトを挿入します。
pub trait BlockWriter {
    fn next(&mut self) -> Option<Instruction>;
    fn keep(&mut self);
    fn put_callout(&mut self);
}

/// トレーサから呼ばれるコールバック
pub trait StepHooks: Send + Sync {
    /// ブロックを再生成するときに呼ばれる
    fn transform(&self, thread_id: ThreadId, writer: &mut dyn BlockWriter);

    /// 挿入したコールアウトに到達したときに、トレース中のスレッド上で呼ばれる
    fn callout(&self, thread_id: ThreadId, context: &mut CpuContext);
}

/// 動的再コンパイルによるスレッドのトレース
pub trait ThreadTracer: Send + Sync {
    /// スレッドの追跡を開始する
    fn follow(&self, thread_id: ThreadId, hooks: Arc<dyn StepHooks>) -> Result<()>;

    /// スレッドの追跡を停止する
    fn unfollow(&self, thread_id: ThreadId);

    /// 保留中の追跡変更を確定する
    fn flush(&self);

    /// 不要になった再生成コードを回収する
    fn garbage_collect(&self);
}

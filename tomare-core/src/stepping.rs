//! 命令レベルのステップ実行
//!
//! スレッドトレーサが再生成する命令ストリームにコールアウトを挿入し、
//! 命令・ベーシックブロック・呼び出しの単位で合成的な停止を起こします。
//!
//! トレーサは実ターゲットに到達する前に自身のブートストラップコードを実行し、
//! さらに最初のブロックをスクラッチ領域にコピーして実行します。
//! そのためセッションは次の状態を順に進みます。
//!
//! ```text
//! Bootstrapping(returns, blocks) -> EntryCopied -> Active
//! ```
//!
//! `Bootstrapping` では `StepConfig::bootstrap_returns` 個を超えるリターン命令が現れるまで
//! コールアウトを付けず、ブロックを丸ごとコピーするアーキテクチャではさらに
//! `split_block_extra_blocks` ブロックを読み飛ばします。これらの値はトレーサの内部動作から
//! 経験的に決めたもので、トレーサを替えたときは再確認が必要です。

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::event::Reason;
use crate::parse::dethumbify;
use crate::registry::{HookKey, HookRecord};
use crate::suspension::TrapSite;
use crate::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tomare_target::{
    BlockWriter, CpuContext, Instruction, InstructionKind, StepHooks, ThreadId,
};

pub type StepCallback = dyn Fn(&mut StepScope<'_>) + Send + Sync;

/// ステップ実行の粒度
#[derive(Clone)]
pub enum StepMode {
    /// 命令ごとに停止する
    Instruction,
    /// ジャンプの直後に停止する
    Block,
    /// 呼び出しの直後に停止する
    Call,
    /// 停止するかどうかをコールバックに任せる
    Custom(Arc<StepCallback>),
}

impl StepMode {
    pub fn custom(f: impl Fn(&mut StepScope<'_>) + Send + Sync + 'static) -> Self {
        StepMode::Custom(Arc::new(f))
    }

    /// コマンド引数から粒度を読む（省略時は命令単位）
    pub fn from_arg(arg: Option<&Value>) -> Result<Self> {
        match arg {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(StepMode::Instruction),
            Some(Value::String(s)) => match s.as_str() {
                "" | "instruction" => Ok(StepMode::Instruction),
                "block" => Ok(StepMode::Block),
                "call" => Ok(StepMode::Call),
                other => Err(EngineError::invalid_argument("step", format!("unknown mode '{}'", other)).into()),
            },
            Some(other) => Err(EngineError::invalid_argument("step", format!("unexpected mode {}", other)).into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepMode::Instruction => "instruction",
            StepMode::Block => "block",
            StepMode::Call => "call",
            StepMode::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepMode({})", self.as_str())
    }
}

/// カスタムモードのコールバックに渡される状態
pub struct StepScope<'a> {
    pub context: &'a mut CpuContext,
    pub instruction: &'a Instruction,
    stop: bool,
    suspend: bool,
}

impl StepScope<'_> {
    /// ステップ実行を終了する
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// この命令で停止する
    pub fn suspend(&mut self) {
        self.suspend = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Bootstrapping { returns_seen: u32, blocks_seen: u32 },
    /// 次の命令はスクラッチ領域にコピーされた開始命令
    EntryCopied,
    Active,
}

/// スレッドごとのステップ実行の状態
pub struct SteppingSession {
    pub thread_id: ThreadId,
    pub mode: StepMode,
    pub phase: TracePhase,
    /// 開始時のpc
    pub initial_pc: u64,
    /// 最初の分岐までの間、生のpcの代わりに報告するアドレス
    pub expected_pc: u64,
    /// 生のpcを信頼してよい
    pub diverged: bool,
    pub last_context_address: Option<u64>,
    /// 開始位置にあったフック
    pub hook_backup: Option<HookRecord>,
    pub terminated: bool,
    pub last_plain: Option<u64>,
    pub last_branch: Option<(u64, InstructionKind)>,
    /// 直前にコールアウトが実行された命令の分類
    pub previous: Option<InstructionKind>,
}

impl SteppingSession {
    fn new(thread_id: ThreadId, mode: StepMode, pc: u64, hook_backup: Option<HookRecord>) -> Self {
        Self {
            thread_id,
            mode,
            phase: TracePhase::Bootstrapping {
                returns_seen: 0,
                blocks_seen: 0,
            },
            initial_pc: pc,
            expected_pc: pc,
            diverged: false,
            last_context_address: None,
            hook_backup,
            terminated: false,
            last_plain: None,
            last_branch: None,
            previous: None,
        }
    }

    pub fn summary(&self) -> Value {
        json!({
            "tid": self.thread_id,
            "mode": self.mode.as_str(),
            "phase": format!("{:?}", self.phase),
            "initialPc": format!("{:#x}", self.initial_pc),
            "expectedPc": format!("{:#x}", self.expected_pc),
            "diverged": self.diverged,
            "lastContextAddress": self.last_context_address.map(|a| format!("{:#x}", a)),
            "hookBackup": self.hook_backup.as_ref().map(|h| h.key.to_string()),
            "terminated": self.terminated,
            "lastPlain": self.last_plain.map(|a| format!("{:#x}", a)),
            "lastBranch": self.last_branch.map(|(a, kind)| json!({"address": format!("{:#x}", a), "kind": kind})),
        })
    }
}

/// コールアウトで報告するアドレスを決める
///
/// 分岐するまではトレーサがスクラッチ領域で開始ブロックを実行している可能性があるため、
/// 期待アドレスを返します。生のpcが期待アドレスと一致するか、直前の命令が分岐だった時点で
/// 以後は生のpcを信頼します。戻り値は `(報告するpc, 分岐済みか)` です。
pub fn resolve_pc(expected: u64, live: u64, previous: Option<InstructionKind>, diverged: bool) -> (u64, bool) {
    if diverged || live == expected || previous.is_some_and(|k| k != InstructionKind::Plain) {
        (live, true)
    } else {
        (expected, false)
    }
}

/// ステップ実行中のスレッド表
#[derive(Default)]
pub struct StepSessions {
    sessions: Mutex<HashMap<ThreadId, SteppingSession>>,
}

impl StepSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, thread_id: ThreadId) -> bool {
        self.sessions.lock().contains_key(&thread_id)
    }

    pub fn summary(&self, thread_id: ThreadId) -> Option<Value> {
        self.sessions.lock().get(&thread_id).map(SteppingSession::summary)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.sessions.lock().keys().copied().collect()
    }
}

/// トレーサから呼ばれるコールバック
struct StepDriver {
    engine: Weak<Engine>,
}

impl StepHooks for StepDriver {
    fn transform(&self, thread_id: ThreadId, writer: &mut dyn BlockWriter) {
        match self.engine.upgrade() {
            Some(engine) => engine.transform_block(thread_id, writer),
            None => {
                while writer.next().is_some() {
                    writer.keep();
                }
            }
        }
    }

    fn callout(&self, thread_id: ThreadId, context: &mut CpuContext) {
        if let Some(engine) = self.engine.upgrade() {
            engine.step_callout(thread_id, context);
        }
    }
}

impl Engine {
    /// ステップ実行を開始する。既にセッションがあればモードだけを切り替える
    pub fn start_step(&self, thread_id: ThreadId, mode: StepMode, pc: Option<u64>) -> Result<()> {
        let arch = self.target.arch();
        if !arch.supports_stepping() {
            return Err(EngineError::UnsupportedArchitecture(arch).into());
        }

        if let Some(session) = self.sessions.sessions.lock().get_mut(&thread_id) {
            tracing::debug!("[{}] step: switching mode to {:?}", thread_id, mode);
            session.mode = mode;
            session.terminated = false;
            return Ok(());
        }

        let pc = pc.ok_or(EngineError::NoNativeContext(thread_id))?;

        // 開始位置のフックは二重に発火しないよう退避する
        let key = HookKey::Native(dethumbify(arch, pc));
        let backup = self.hooks.remove(&key).map(|mut record| {
            if let Some(handle) = record.handle.take() {
                self.target.interceptor.detach(handle);
                self.target.interceptor.flush();
            }
            record
        });

        tracing::debug!("[{}] step: following from {:#x} ({:?})", thread_id, pc, mode);
        self.sessions
            .sessions
            .lock()
            .insert(thread_id, SteppingSession::new(thread_id, mode, pc, backup));

        let driver = Arc::new(StepDriver {
            engine: self.self_ref.clone(),
        });
        if let Err(e) = self.target.tracer.follow(thread_id, driver) {
            let session = self.sessions.sessions.lock().remove(&thread_id);
            if let Some(record) = session.and_then(|s| s.hook_backup) {
                self.restore_hook(record);
            }
            return Err(anyhow::anyhow!("Failed to follow thread {}: {}", thread_id, e));
        }
        Ok(())
    }

    /// ステップ実行を終了する。セッションがなければ `false`
    pub fn stop_step(&self, thread_id: ThreadId) -> bool {
        let Some(session) = self.sessions.sessions.lock().remove(&thread_id) else {
            return false;
        };

        if let Some(record) = session.hook_backup {
            tracing::debug!("[{}] step: re-attaching hook backup at {}", thread_id, record.key);
            self.restore_hook(record);
        }

        tracing::debug!("[{}] step: unfollowing", thread_id);
        self.target.tracer.flush();
        self.target.tracer.unfollow(thread_id);
        self.target.tracer.garbage_collect();
        true
    }

    fn restore_hook(&self, record: HookRecord) {
        let key = record.key.clone();
        self.hooks.insert(record);
        if let Err(e) = self.attach_hook(&key) {
            tracing::warn!("Failed to re-attach hook {}: {}", key, e);
        }
    }

    /// 次の機会にステップ実行を終了させる
    pub(crate) fn mark_step_terminated(&self, thread_id: ThreadId) {
        if let Some(session) = self.sessions.sessions.lock().get_mut(&thread_id) {
            session.terminated = true;
        }
    }

    pub(crate) fn step_info(&self, thread_id: ThreadId) -> Option<Value> {
        self.sessions.summary(thread_id)
    }

    fn transform_block(&self, thread_id: ThreadId, writer: &mut dyn BlockWriter) {
        let step = &self.config.step;
        let copies_block = self.target.arch().copies_block_before_execution();

        let terminated = {
            let mut sessions = self.sessions.sessions.lock();
            let Some(session) = sessions.get_mut(&thread_id) else {
                drop(sessions);
                while writer.next().is_some() {
                    writer.keep();
                }
                return;
            };

            while let Some(insn) = writer.next() {
                writer.keep();

                let kind = insn.kind();
                match kind {
                    InstructionKind::Plain => session.last_plain = Some(insn.address),
                    _ => session.last_branch = Some((insn.address, kind)),
                }

                match session.phase {
                    TracePhase::Bootstrapping {
                        returns_seen,
                        blocks_seen,
                    } => {
                        if returns_seen > step.bootstrap_returns {
                            if copies_block && blocks_seen < step.split_block_extra_blocks {
                                continue;
                            }
                            tracing::debug!(
                                "[{}] step: executing first instruction {:#x} {}",
                                thread_id,
                                insn.address,
                                insn
                            );
                            session.expected_pc = session.initial_pc.wrapping_add(insn.size as u64);
                            session.phase = TracePhase::EntryCopied;
                            continue;
                        }
                        if kind == InstructionKind::Return {
                            session.phase = TracePhase::Bootstrapping {
                                returns_seen: returns_seen + 1,
                                blocks_seen,
                            };
                        }
                    }
                    TracePhase::EntryCopied => {
                        session.phase = TracePhase::Active;
                        writer.put_callout();
                    }
                    TracePhase::Active => writer.put_callout(),
                }
            }

            if let TracePhase::Bootstrapping {
                returns_seen,
                blocks_seen,
            } = session.phase
            {
                if returns_seen > step.bootstrap_returns && copies_block {
                    session.phase = TracePhase::Bootstrapping {
                        returns_seen,
                        blocks_seen: blocks_seen + 1,
                    };
                }
            }
            session.terminated
        };

        if terminated {
            self.stop_step(thread_id);
        }
    }

    fn step_callout(&self, thread_id: ThreadId, context: &mut CpuContext) {
        let (pc, insn, mode, decision) = {
            let mut sessions = self.sessions.sessions.lock();
            let Some(session) = sessions.get_mut(&thread_id) else {
                return;
            };
            if session.terminated {
                return;
            }

            let (pc, diverged) = resolve_pc(session.expected_pc, context.pc(), session.previous, session.diverged);
            session.diverged = diverged;

            let insn = match self.target.decoder.decode(pc) {
                Ok(insn) => insn,
                Err(e) => {
                    tracing::warn!("[{}] step: {}", thread_id, e);
                    return;
                }
            };
            tracing::debug!("[{}] step: callout at {:#x} {}", thread_id, pc, insn);

            if !diverged {
                session.expected_pc = session.expected_pc.wrapping_add(insn.size as u64);
            }

            let previous = session.previous.replace(insn.kind());
            let decision = match &session.mode {
                StepMode::Instruction => Some(true),
                StepMode::Block => Some(previous == Some(InstructionKind::Jump)),
                StepMode::Call => Some(previous == Some(InstructionKind::Call)),
                StepMode::Custom(_) => None,
            };
            (pc, insn, session.mode.clone(), decision)
        };

        let should_suspend = match (decision, mode) {
            (Some(decision), _) => decision,
            (None, StepMode::Custom(callback)) => {
                let mut scope = StepScope {
                    context: &mut *context,
                    instruction: &insn,
                    stop: false,
                    suspend: false,
                };
                callback(&mut scope);
                if scope.stop {
                    self.mark_step_terminated(thread_id);
                }
                scope.suspend
            }
            (None, _) => false,
        };

        if should_suspend {
            if let Some(session) = self.sessions.sessions.lock().get_mut(&thread_id) {
                session.last_context_address = Some(pc);
            }
            let site = TrapSite::new(thread_id, Reason::Step).at(pc).details(false);
            self.suspend(site, Some(context), Vec::new());
        }

        let terminated = self
            .sessions
            .sessions
            .lock()
            .get(&thread_id)
            .is_some_and(|s| s.terminated);
        if terminated {
            self.stop_step(thread_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_pc_before_divergence() {
        // スクラッチ領域で実行中は期待アドレスを報告する
        assert_eq!(resolve_pc(0x4001, 0x7f00_0001, None, false), (0x4001, false));
        assert_eq!(
            resolve_pc(0x4004, 0x7f00_0004, Some(InstructionKind::Plain), false),
            (0x4004, false)
        );
    }

    #[test]
    fn test_resolve_pc_diverges() {
        assert_eq!(resolve_pc(0x4001, 0x4001, None, false), (0x4001, true));
        assert_eq!(
            resolve_pc(0x4006, 0x5000, Some(InstructionKind::Call), false),
            (0x5000, true)
        );
        assert_eq!(
            resolve_pc(0x4006, 0x9999, Some(InstructionKind::Plain), true),
            (0x9999, true)
        );
    }

    #[test]
    fn test_step_mode_from_arg() {
        assert!(matches!(StepMode::from_arg(None).unwrap(), StepMode::Instruction));
        assert!(matches!(StepMode::from_arg(Some(&json!(null))).unwrap(), StepMode::Instruction));
        assert!(matches!(StepMode::from_arg(Some(&json!("block"))).unwrap(), StepMode::Block));
        assert!(matches!(StepMode::from_arg(Some(&json!("call"))).unwrap(), StepMode::Call));
        assert!(StepMode::from_arg(Some(&json!("over"))).is_err());
        assert!(StepMode::from_arg(Some(&json!(3))).is_err());
    }

    #[test]
    fn test_session_summary() {
        let session = SteppingSession::new(5, StepMode::Call, 0x4000, None);
        let summary = session.summary();
        assert_eq!(summary["mode"], "call");
        assert_eq!(summary["initialPc"], "0x4000");
        assert_eq!(summary["terminated"], false);
    }
}

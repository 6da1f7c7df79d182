//! トラップ時のコンテキストプロキシ

use crate::event::Event;
use crate::expr::{ExprError, ExprScope};
use crate::sink::EventSink;
use crate::stepping::StepMode;
use crate::Result;
use tomare_target::{CpuContext, ManagedArg, ThreadId};

/// トラップしたスレッドの状態への読み書きアクセサ
///
/// 書き込みは、まずコントローラに `set_context_value` を送り、その後でスナップショットに反映します。
/// コントローラの表示が実際に再開される値より遅れることはありません。
pub struct ContextProxy<'a> {
    thread_id: ThreadId,
    context: Option<&'a mut CpuContext>,
    args: Vec<u64>,
    managed_args: Vec<ManagedArg>,
    sink: &'a dyn EventSink,
    step_request: Option<StepMode>,
}

impl<'a> ContextProxy<'a> {
    pub fn new(
        thread_id: ThreadId,
        context: Option<&'a mut CpuContext>,
        args: Vec<u64>,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            thread_id,
            context,
            args,
            managed_args: Vec::new(),
            sink,
            step_request: None,
        }
    }

    /// ネイティブコンテキストを持たないマネージドトラップ
    pub fn managed(thread_id: ThreadId, args: Vec<ManagedArg>, sink: &'a dyn EventSink) -> Self {
        Self {
            managed_args: args,
            ..Self::new(thread_id, None, Vec::new(), sink)
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn has_native_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn context(&self) -> Option<&CpuContext> {
        self.context.as_deref()
    }

    pub fn get(&self, register: &str) -> Option<u64> {
        self.context.as_ref()?.get(register)
    }

    pub fn pc(&self) -> Option<u64> {
        self.context.as_ref().map(|c| c.pc())
    }

    /// レジスタを書き換える
    pub fn set(&mut self, register: &str, value: u64) -> Result<()> {
        let context = self
            .context
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("Thread {} has no native context", self.thread_id))?;

        if context.get(register).is_none() {
            return Err(anyhow::anyhow!("Unknown register {} for {}", register, context.arch()));
        }

        self.sink.send(Event::SetContextValue {
            tid: self.thread_id,
            register: register.to_string(),
            value,
        });
        context.set(register, value)
    }

    pub fn args(&self) -> &[u64] {
        &self.args
    }

    pub fn managed_args(&self) -> &[ManagedArg] {
        &self.managed_args
    }

    /// ロジックからステップ実行を要求する（このトラップでは停止しなくなる）
    pub fn request_step(&mut self, mode: StepMode) {
        self.step_request = Some(mode);
    }

    pub(crate) fn take_step_request(&mut self) -> Option<StepMode> {
        self.step_request.take()
    }
}

impl ExprScope for ContextProxy<'_> {
    fn register(&self, name: &str) -> Option<u64> {
        self.get(name)
    }

    fn set_register(&mut self, name: &str, value: u64) -> std::result::Result<(), ExprError> {
        self.set(name, value).map_err(|e| ExprError::WriteFailed {
            register: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn arg(&self, index: usize) -> Option<u64> {
        self.args.get(index).copied()
    }
}

//! スレッドの停止とコマンドの処理
//!
//! トラップしたスレッドはここで条件とロジックを評価し、必要なら状態をコントローラに送って
//! 受信箱のコマンドを処理し続けます。`release` か `step` を受け取るまでスレッドは戻りません。
//!
//! ```text
//! ANNOUNCING -> CONDITION_CHECK -> (SKIPPED | LOGIC_RUN) -> (CONTINUED | FROZEN) -> DRAINING -> TERMINATED
//! ```

use crate::channel::{Command, CommandInbox, RemoteCommand};
use crate::context::ContextProxy;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::event::{Event, ModuleSummary, Reason};
use crate::expr::LogicOutcome;
use crate::registry::{HookKey, HookRecord};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tomare_target::{CpuContext, ManagedArg, ManagedHandle, ThreadId};

/// 停止中のスレッド
pub struct ThreadSuspension {
    thread_id: ThreadId,
    reason: Reason,
    inbox: CommandInbox,
    suppress: AtomicBool,
}

impl ThreadSuspension {
    fn new(thread_id: ThreadId, reason: Reason) -> Self {
        Self {
            thread_id,
            reason,
            inbox: CommandInbox::new(),
            suppress: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn inbox(&self) -> &CommandInbox {
        &self.inbox
    }

    /// このトラップでは停止しない
    pub fn suppress(&self) {
        self.suppress.store(true, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress.load(Ordering::SeqCst)
    }
}

/// スレッドIDごとの停止表（1スレッドにつき1つまで）
#[derive(Default)]
pub struct SuspensionTable {
    threads: Mutex<HashMap<ThreadId, Arc<ThreadSuspension>>>,
}

impl SuspensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_insert(&self, thread_id: ThreadId, reason: Reason) -> Result<Arc<ThreadSuspension>, EngineError> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&thread_id) {
            return Err(EngineError::ThreadAlreadySuspended(thread_id));
        }
        let suspension = Arc::new(ThreadSuspension::new(thread_id, reason));
        threads.insert(thread_id, suspension.clone());
        Ok(suspension)
    }

    pub fn get(&self, thread_id: ThreadId) -> Option<Arc<ThreadSuspension>> {
        self.threads.lock().get(&thread_id).cloned()
    }

    fn remove(&self, thread_id: ThreadId) -> Option<Arc<ThreadSuspension>> {
        self.threads.lock().remove(&thread_id)
    }

    pub fn contains(&self, thread_id: ThreadId) -> bool {
        self.threads.lock().contains_key(&thread_id)
    }

    /// 停止中のスレッドID（昇順）
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self.threads.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 停止の後始末
///
/// 受信箱を閉じて停止表から外し、一時的に外したインターセプタを（フックが残っていれば）付け直す。
struct SuspensionGuard<'a> {
    engine: &'a Engine,
    suspension: Arc<ThreadSuspension>,
    /// 一時的に外したフック
    key: Option<HookKey>,
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        let tid = self.suspension.thread_id();
        if std::thread::panicking() {
            tracing::warn!("[{}] unwinding out of a suspension", tid);
        }
        self.suspension.inbox().abandon();
        self.engine.suspensions.remove(tid);

        if let Some(key) = self.key.as_ref().filter(|key| self.engine.hooks.contains(key)) {
            tracing::debug!("[{}] attaching back hook at {}", tid, key);
            if let Err(e) = self.engine.attach_hook(key) {
                tracing::warn!("[{}] Failed to re-attach hook {}: {}", tid, key, e);
            }
        }
    }
}

/// マネージドメソッド呼び出しのトラップ
#[derive(Debug, Clone)]
pub struct ManagedCall {
    pub class_method: String,
    pub args: Vec<ManagedArg>,
    pub this: Option<ManagedHandle>,
}

/// トラップの発生場所と付随情報
#[derive(Debug, Clone)]
pub struct TrapSite {
    pub thread_id: ThreadId,
    pub reason: Reason,
    pub address: Option<u64>,
    /// トラップを起こしたフック
    pub key: Option<HookKey>,
    pub managed: Option<ManagedCall>,
    pub module: Option<ModuleSummary>,
    /// フックの記録がない場合の詳細レベル
    pub show_details: bool,
}

impl TrapSite {
    pub fn new(thread_id: ThreadId, reason: Reason) -> Self {
        Self {
            thread_id,
            reason,
            address: None,
            key: None,
            managed: None,
            module: None,
            show_details: true,
        }
    }

    pub fn at(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn hook(mut self, key: HookKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn managed(mut self, call: ManagedCall) -> Self {
        self.managed = Some(call);
        self
    }

    pub fn module(mut self, module: ModuleSummary) -> Self {
        self.module = Some(module);
        self
    }

    pub fn details(mut self, show: bool) -> Self {
        self.show_details = show;
        self
    }
}

/// トラップ処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// 既に停止中のスレッドだった
    Rejected,
    /// 条件が成立しなかった
    Skipped,
    /// ロジックが停止しないことを選んだ
    Continued,
    /// 停止し、`release` で解除された
    Released,
    /// 停止し、`step` でステップ実行に制御を渡した
    Stepping,
}

impl Engine {
    /// トラップしたスレッドを停止する
    ///
    /// 戻るとき、トラップ位置から一時的に外したインターセプタは（フックが残っていれば）付け直されています。
    pub fn suspend(&self, site: TrapSite, context: Option<&mut CpuContext>, args: Vec<u64>) -> TrapOutcome {
        let tid = site.thread_id;
        let suspension = match self.suspensions.try_insert(tid, site.reason) {
            Ok(suspension) => suspension,
            Err(e) => {
                tracing::warn!("[{}] trap at {:?} refused: {}", tid, site.address, e);
                return TrapOutcome::Rejected;
            }
        };

        let record = site.key.as_ref().and_then(|key| self.hooks.get(key));
        let detached = site.key.as_ref().is_some_and(|key| self.detach_live(key));
        if let Some(record) = record.as_ref().filter(|r| r.one_shot) {
            tracing::debug!("[{}] removing one-shot hook {}", tid, record.key);
            self.hooks.remove(&record.key);
        }

        // パニックで巻き戻っても停止表とインターセプタを元に戻す
        let _guard = SuspensionGuard {
            engine: self,
            suspension: suspension.clone(),
            key: site.key.clone().filter(|_| detached),
        };
        self.hold(&suspension, record.as_ref(), &site, context, args)
    }

    /// トラップ位置のインターセプタを外す
    fn detach_live(&self, key: &HookKey) -> bool {
        if !matches!(key, HookKey::Native(_)) {
            return false;
        }
        match self.hooks.take_handle(key) {
            Some(handle) => {
                self.target.interceptor.detach(handle);
                self.target.interceptor.flush();
                true
            }
            None => false,
        }
    }

    fn hold(
        &self,
        suspension: &ThreadSuspension,
        record: Option<&HookRecord>,
        site: &TrapSite,
        context: Option<&mut CpuContext>,
        args: Vec<u64>,
    ) -> TrapOutcome {
        let tid = site.thread_id;
        let mut proxy = match &site.managed {
            Some(call) => ContextProxy::managed(tid, call.args.clone(), self.sink.as_ref()),
            None => ContextProxy::new(tid, context, args, self.sink.as_ref()),
        };

        if let Some(condition) = record.and_then(|r| r.condition.as_ref()) {
            match condition.evaluate(&mut proxy) {
                Ok(false) => {
                    tracing::debug!("[{}] condition '{}' not met", tid, condition.describe());
                    return TrapOutcome::Skipped;
                }
                Ok(true) => {}
                Err(e) => tracing::warn!(
                    "[{}] Failed to evaluate condition '{}': {}",
                    tid,
                    condition.describe(),
                    e
                ),
            }
        }

        let mut should_sleep = true;
        if let Some(logic) = record.and_then(|r| r.logic.as_ref()) {
            match logic.run(&mut proxy) {
                Ok(LogicOutcome::Continue) => should_sleep = false,
                Ok(LogicOutcome::Suspend) => {}
                Err(e) => tracing::warn!("[{}] Failed to run logic '{}': {}", tid, logic.describe(), e),
            }
        }

        if let Some(mode) = proxy.take_step_request() {
            match self.start_step(tid, mode, proxy.pc()) {
                Ok(()) => suspension.suppress(),
                Err(e) => tracing::warn!("[{}] Failed to start stepping: {}", tid, e),
            }
        }

        tracing::debug!(
            "[{}] break {:?} - pre-sleep: {} suppressed: {}",
            tid,
            site.address,
            should_sleep,
            suspension.is_suppressed()
        );
        if suspension.is_suppressed() || !should_sleep {
            return TrapOutcome::Continued;
        }

        let show_details = record.map_or(site.show_details, |r| r.show_details);
        let info = self.context_info(site, &proxy, show_details);
        self.sink.send(Event::SetContext(info));

        tracing::debug!("[{}] suspended", tid);
        let outcome = self.drain(suspension, &mut proxy);
        tracing::debug!("[{}] released", tid);

        self.sink.send(Event::Release {
            tid,
            reason: site.reason,
        });
        outcome
    }

    /// 終了コマンドが来るまで受信箱のコマンドを順に実行する
    fn drain(&self, suspension: &ThreadSuspension, proxy: &mut ContextProxy<'_>) -> TrapOutcome {
        let tid = suspension.thread_id();
        let poll = self.config.poll_interval();

        loop {
            let Some(command) = suspension.inbox().pop_wait(poll) else {
                continue;
            };
            tracing::debug!("[{}] executing {}", tid, command.command().name());

            match command.command() {
                Command::Release => {
                    suspension.inbox().abandon();
                    self.mark_step_terminated(tid);
                    command.complete(Value::Bool(true));
                    return TrapOutcome::Released;
                }
                Command::Step(mode) => {
                    let started = match self.start_step(tid, mode.clone(), proxy.pc()) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!("[{}] Failed to start stepping: {}", tid, e);
                            false
                        }
                    };
                    suspension.inbox().abandon();
                    command.complete(Value::Bool(started));
                    return if started {
                        TrapOutcome::Stepping
                    } else {
                        TrapOutcome::Released
                    };
                }
                Command::Call { name, args } => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.execute(tid, name, args, Some(&mut *proxy))
                    }))
                    .unwrap_or_else(|_| {
                        tracing::warn!("[{}] {} panicked", tid, name);
                        Value::Null
                    });
                    command.complete(result);
                }
            }
        }
    }

    /// コマンドを発行する
    ///
    /// スレッドが停止中なら受信箱に入れて結果を待ち（タイムアウトなら `null`）、
    /// そうでなければ呼び出し元のスレッドで直ちに実行します。
    pub fn command(&self, thread_id: ThreadId, command: Command) -> Value {
        if let Some(suspension) = self.suspensions.get(thread_id) {
            let remote = RemoteCommand::new(command);
            if !suspension.inbox().push(remote.clone()) {
                tracing::debug!("[{}] {} dropped, thread is resuming", thread_id, remote.command().name());
                return Value::Null;
            }
            return remote.wait(self.config.command_timeout()).unwrap_or_else(|| {
                tracing::warn!(
                    "[{}] {} timed out",
                    thread_id,
                    remote.command().name()
                );
                Value::Null
            });
        }

        match command {
            Command::Release => Value::Bool(false),
            Command::Step(mode) => match self.start_step(thread_id, mode, None) {
                Ok(()) => Value::Bool(true),
                Err(e) => {
                    tracing::warn!("[{}] Failed to start stepping: {}", thread_id, e);
                    Value::Null
                }
            },
            Command::Call { name, args } => self.execute(thread_id, &name, &args, None),
        }
    }

    /// 停止中のスレッドを解除する
    pub fn release(&self, thread_id: ThreadId) -> Value {
        self.command(thread_id, Command::Release)
    }

    pub fn is_suspended(&self, thread_id: ThreadId) -> bool {
        self.suspensions.contains(thread_id)
    }

    /// 停止中のスレッドID
    pub fn suspended_threads(&self) -> Vec<ThreadId> {
        self.suspensions.thread_ids()
    }
}

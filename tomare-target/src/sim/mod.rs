//! 決定的なシミュレーションターゲット
//!
//! 実際のコードパッチや動的再コンパイルの代わりに、テストやコンソールから
//! 「スレッドがアドレスを実行した」「メモリにアクセスした」「モジュールをロードした」
//! といった出来事を明示的に発生させます。ハンドラは呼び出し元のスレッド上で同期的に実行されるため、
//! そのスレッドがトラップされたターゲットスレッドの役割を果たします。

mod interceptor;
mod memory;
mod runtime;
mod tracer;

pub use interceptor::SimInterceptor;
pub use memory::SimMemory;
pub use runtime::{SimAccessMonitor, SimExceptionPort, SimManagedRuntime, SimProcess};
pub use tracer::{SimDecoder, SimTracer};

use crate::{
    AccessDetails, Arch, CpuContext, ExceptionAction, ExceptionDetails, ExceptionKind,
    MemoryOperation, Platform, Result, Target, ThreadId,
};
use std::sync::Arc;
use tomare_symbols::SymbolTable;

/// メモリアクセスの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Completed,
    /// 例外が処理されなかった（実プロセスならクラッシュ）
    Faulted,
}

/// シミュレーションターゲット
pub struct SimTarget {
    pub memory: Arc<SimMemory>,
    pub interceptor: Arc<SimInterceptor>,
    pub decoder: Arc<SimDecoder>,
    pub tracer: Arc<SimTracer>,
    pub process: Arc<SimProcess>,
    pub exceptions: Arc<SimExceptionPort>,
    pub access_monitor: Arc<SimAccessMonitor>,
    pub managed: Arc<SimManagedRuntime>,
    symbols: Arc<SymbolTable>,
}

impl SimTarget {
    pub fn new(arch: Arch) -> Self {
        Self::with_symbols(arch, Platform::Linux, SymbolTable::new())
    }

    pub fn with_symbols(arch: Arch, platform: Platform, symbols: SymbolTable) -> Self {
        let decoder = Arc::new(SimDecoder::new());
        Self {
            memory: Arc::new(SimMemory::new()),
            interceptor: Arc::new(SimInterceptor::new()),
            tracer: Arc::new(SimTracer::new(decoder.clone())),
            decoder,
            process: Arc::new(SimProcess::new(arch, platform)),
            exceptions: Arc::new(SimExceptionPort::default()),
            access_monitor: Arc::new(SimAccessMonitor::default()),
            managed: Arc::new(SimManagedRuntime::new()),
            symbols: Arc::new(symbols),
        }
    }

    pub fn arch(&self) -> Arch {
        crate::ProcessInfo::arch(self.process.as_ref())
    }

    /// エンジンに渡すコンポーネント一式
    pub fn target(&self) -> Target {
        Target {
            process: self.process.clone(),
            memory: self.memory.clone(),
            interceptor: self.interceptor.clone(),
            tracer: self.tracer.clone(),
            decoder: self.decoder.clone(),
            exceptions: self.exceptions.clone(),
            access_monitor: Some(self.access_monitor.clone()),
            managed: Some(self.managed.clone()),
            symbols: self.symbols.clone(),
        }
    }

    /// pcを設定したコンテキストを作成する
    pub fn context_at(&self, pc: u64) -> CpuContext {
        let mut context = CpuContext::new(self.arch());
        context.set_pc(pc);
        context
    }

    /// スレッドがアドレスの命令を実行する（インターセプタがあればトラップする）
    pub fn call(&self, thread_id: ThreadId, address: u64, context: &mut CpuContext, args: Vec<u64>) -> bool {
        self.interceptor.execute(thread_id, address, context, args)
    }

    /// トレーサの下で命令列を実行する
    pub fn run_traced(&self, thread_id: ThreadId, context: &mut CpuContext, path: &[u64]) -> Result<()> {
        self.tracer.run(thread_id, context, path)
    }

    /// `from` の命令が `address` にアクセスする
    ///
    /// アクセスモニタの通知、ページ保護違反の例外、例外ハンドラによる再実行を順に再現します。
    pub fn access(&self, thread_id: ThreadId, from: u64, address: u64, operation: MemoryOperation) -> AccessOutcome {
        if let Some(handler) = self.access_monitor.take_notification(address) {
            handler.on_access(&AccessDetails {
                thread_id,
                operation,
                from,
                address,
            });
        }

        if self.memory.permits(address, operation) {
            return AccessOutcome::Completed;
        }

        let Some(handler) = self.exceptions.handler() else {
            return AccessOutcome::Faulted;
        };

        let mut context = self.context_at(from);
        let mut details = ExceptionDetails {
            thread_id,
            kind: ExceptionKind::AccessViolation,
            address: from,
            memory: Some((operation, address)),
            context: &mut context,
        };

        match handler.on_exception(&mut details) {
            ExceptionAction::Unhandled => AccessOutcome::Faulted,
            _ if !self.memory.permits(address, operation) => AccessOutcome::Faulted,
            ExceptionAction::ResumeAndNotify => {
                handler.after_retry(thread_id, from);
                AccessOutcome::Completed
            }
            ExceptionAction::Resume => AccessOutcome::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Interceptor, Protection, ThreadTracer, TrapFrame, TrapHandler};
    use crate::{BlockWriter, StepHooks};
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<(ThreadId, u64, Vec<u64>)>>);

    impl TrapHandler for Recorder {
        fn on_trap(&self, frame: &mut TrapFrame<'_>) {
            self.0.lock().push((frame.thread_id, frame.address, frame.args.clone()));
            frame.context.set("rax", 99).unwrap();
        }
    }

    #[test]
    fn test_call_triggers_attached_handler() {
        let sim = SimTarget::new(Arch::X64);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let handle = sim.interceptor.attach(0x1000, recorder.clone()).unwrap();

        let mut ctx = sim.context_at(0);
        assert!(sim.call(7, 0x1000, &mut ctx, vec![1, 2]));
        assert_eq!(ctx.get("rax"), Some(99));
        assert_eq!(recorder.0.lock().as_slice(), &[(7, 0x1000, vec![1, 2])]);

        sim.interceptor.detach(handle);
        assert!(!sim.call(7, 0x1000, &mut ctx, vec![]));
    }

    #[test]
    fn test_access_without_handler_faults() {
        let sim = SimTarget::new(Arch::X64);
        sim.memory.map(0x2000, 0x1000, Protection::NONE);
        assert_eq!(sim.access(1, 0x400, 0x2000, MemoryOperation::Read), AccessOutcome::Faulted);
        sim.memory.map(0x3000, 0x1000, Protection::READ_WRITE);
        assert_eq!(sim.access(1, 0x400, 0x3000, MemoryOperation::Write), AccessOutcome::Completed);
    }

    struct CalloutEverything(Mutex<Vec<u64>>);

    impl StepHooks for CalloutEverything {
        fn transform(&self, _thread_id: ThreadId, writer: &mut dyn BlockWriter) {
            while writer.next().is_some() {
                writer.keep();
                writer.put_callout();
            }
        }

        fn callout(&self, _thread_id: ThreadId, context: &mut CpuContext) {
            self.0.lock().push(context.pc());
        }
    }

    #[test]
    fn test_tracer_runs_callouts_in_order() {
        let sim = SimTarget::new(Arch::X64);
        sim.decoder.define(0x10, 1, "push", "rbp", &[]);
        sim.decoder.define(0x11, 2, "jmp", "0x20", &["jump"]);
        sim.decoder.define(0x20, 1, "ret", "", &["ret"]);

        let hooks = Arc::new(CalloutEverything(Mutex::new(Vec::new())));
        sim.tracer.follow(3, hooks.clone()).unwrap();

        let mut ctx = sim.context_at(0x10);
        sim.run_traced(3, &mut ctx, &[0x10, 0x11, 0x20]).unwrap();
        assert_eq!(hooks.0.lock().as_slice(), &[0x10, 0x11, 0x20]);

        sim.tracer.unfollow(3);
        sim.run_traced(3, &mut ctx, &[0x10, 0x11]).unwrap();
        assert_eq!(hooks.0.lock().len(), 3);
    }
}

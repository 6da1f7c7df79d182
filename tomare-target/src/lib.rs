//! Tomare ターゲット抽象化
//!
//! このクレートは、実行制御エンジンが利用する外部コンポーネントの契約をトレイトとして定義します。
//! コードパッチによるインターセプト、命令レベルのスレッドトレース、メモリアクセスとページ保護、
//! 例外処理、マネージドランタイムのブリッジ、プロセスとモジュールの列挙が含まれます。
//!
//! テストとコンソールで使う決定的なシミュレーションターゲット（`sim`）も提供します。

pub mod arch;
pub mod context;
pub mod thread;
pub mod memory;
pub mod interceptor;
pub mod tracer;
pub mod exception;
pub mod managed;
pub mod process;
pub mod backtrace;
pub mod sim;

pub use arch::{Arch, Platform};
pub use context::CpuContext;
pub use thread::ThreadId;
pub use memory::{MemoryAccess, MemoryError, MemoryRange, Protection};
pub use interceptor::{Interceptor, InterceptorHandle, TrapFrame, TrapHandler};
pub use tracer::{
    BlockWriter, Instruction, InstructionDecoder, InstructionKind, StepHooks, ThreadTracer,
};
pub use exception::{
    AccessDetails, AccessMonitor, AccessMonitorHandler, ExceptionAction, ExceptionDetails,
    ExceptionHandler, ExceptionKind, ExceptionPort, MemoryOperation,
};
pub use managed::{ClassLoadHandler, ManagedArg, ManagedHandle, ManagedHookHandler, ManagedRuntime};
pub use process::{ModuleInfo, ModuleLoadHandler, ProcessInfo};

use std::sync::Arc;
use tomare_symbols::SymbolLookup;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;

/// エンジンに渡す外部コンポーネント一式
#[derive(Clone)]
pub struct Target {
    pub process: Arc<dyn ProcessInfo>,
    pub memory: Arc<dyn MemoryAccess>,
    pub interceptor: Arc<dyn Interceptor>,
    pub tracer: Arc<dyn ThreadTracer>,
    pub decoder: Arc<dyn InstructionDecoder>,
    pub exceptions: Arc<dyn ExceptionPort>,
    /// ハードウェア例外の代わりにアクセスモニタを使うプラットフォーム向け
    pub access_monitor: Option<Arc<dyn AccessMonitor>>,
    pub managed: Option<Arc<dyn ManagedRuntime>>,
    pub symbols: Arc<dyn SymbolLookup>,
}

impl Target {
    pub fn arch(&self) -> Arch {
        self.process.arch()
    }

    pub fn pointer_size(&self) -> usize {
        self.process.pointer_size()
    }
}

//! Tomare 実行制御エンジンのコア機能
//!
//! このクレートは、実行中のプロセスの任意のスレッドを命令単位やマネージドメソッドの境界で停止させ、
//! 外部のコントローラからレジスタとメモリを調べて書き換え、命令、ブロック、呼び出しの単位で
//! ステップ実行させるためのエンジンを提供します。
//!
//! 停止したスレッドはコマンドの受信箱を処理し続け、`release` か `step` を受け取るまで戻りません。
//! 他のスレッドは停止させられない限り実行を続けます。

pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod disasm;
pub mod engine;
pub mod errors;
pub mod event;
pub mod expr;
pub mod hooks;
pub mod inspect;
pub mod onload;
pub mod parse;
pub mod registry;
pub mod sink;
pub mod stepping;
pub mod suspension;
pub mod watcher;

pub use api::API_VERSION;
pub use channel::{Command, CommandInbox, RemoteCommand};
pub use config::{EngineConfig, StepConfig, WatchBackend};
pub use context::ContextProxy;
pub use disasm::CapstoneDecoder;
pub use engine::Engine;
pub use errors::EngineError;
pub use event::{ContextInfo, Event, HookCategory, Reason, Telescope};
pub use expr::{Condition, ExprError, ExprScope, HookLogic, LogicOutcome};
pub use hooks::HookOptions;
pub use registry::{HookKey, HookRecord, HookRegistry};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, NullSink};
pub use stepping::{StepMode, StepScope};
pub use suspension::{TrapOutcome, TrapSite};
pub use watcher::{WatchFlags, Watcher};

// 他のクレートから使用するために再エクスポート
pub use tomare_symbols::DebugSymbol;
pub use tomare_target::{Target, ThreadId};

/// エンジンの結果型
pub type Result<T> = anyhow::Result<T>;

//! シミュレーションターゲット上でエンジンを動かすテストハーネス
//!
//! トラップされるターゲットスレッドは実際のOSスレッドで再現し、
//! テストのスレッドがコントローラの役割を担います。

#![allow(dead_code)]

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tomare_core::event::ContextInfo;
use tomare_core::{ChannelSink, Engine, EngineConfig, Event};
use tomare_target::sim::SimTarget;
use tomare_target::{Arch, CpuContext, Protection, ThreadId};

/// イベントやスレッドの停止を待つ上限
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub sim: Arc<SimTarget>,
    pub engine: Arc<Engine>,
    pub events: Receiver<Event>,
}

/// テスト向けの短い間隔の設定
pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 10,
        command_timeout_ms: 2000,
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new(arch: Arch) -> Self {
        Self::with_config(arch, test_config())
    }

    pub fn with_config(arch: Arch, config: EngineConfig) -> Self {
        let sim = Arc::new(SimTarget::new(arch));
        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(sim.target(), config, Arc::new(sink));
        Self { sim, engine, events }
    }

    /// コード用のページをマップする
    pub fn map_code(&self, base: u64) {
        self.sim.memory.map(base, 0x1000, Protection::READ_EXECUTE);
    }

    /// 指定した種別のイベントが届くまで待つ（途中のイベントは捨てる）
    pub fn wait_for(&self, name: &str) -> Event {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if event.name() == name => return event,
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for {} event", name),
                Err(RecvTimeoutError::Disconnected) => panic!("event channel closed while waiting for {}", name),
            }
        }
    }

    /// 停止時の状態が届くまで待つ
    pub fn wait_context(&self) -> ContextInfo {
        match self.wait_for("set_context") {
            Event::SetContext(info) => info,
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// 既に届いているイベントの種別名
    pub fn pending_event_names(&self) -> Vec<&'static str> {
        self.events.try_iter().map(|e| e.name()).collect()
    }

    /// スレッドが停止するまで待つ
    pub fn wait_suspended(&self, thread_id: ThreadId) {
        let deadline = Instant::now() + WAIT;
        while !self.engine.is_suspended(thread_id) {
            assert!(Instant::now() < deadline, "thread {} was not suspended", thread_id);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// 別スレッドでアドレスを実行し、再開後のコンテキストを返す
    pub fn spawn_call(&self, thread_id: ThreadId, address: u64) -> JoinHandle<CpuContext> {
        self.spawn_call_with(thread_id, address, Vec::new())
    }

    pub fn spawn_call_with(&self, thread_id: ThreadId, address: u64, args: Vec<u64>) -> JoinHandle<CpuContext> {
        let sim = self.sim.clone();
        thread::spawn(move || {
            let mut context = sim.context_at(address);
            sim.call(thread_id, address, &mut context, args);
            context
        })
    }
}

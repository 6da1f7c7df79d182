//! 停止中のスレッドへのコマンドチャネル

use crate::stepping::StepMode;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 停止中のスレッドが実行する操作
#[derive(Debug, Clone)]
pub enum Command {
    /// 停止を解除する
    Release,
    /// ステップ実行に制御を渡して停止を解除する
    Step(StepMode),
    /// 名前付きAPIの呼び出し
    Call { name: String, args: Vec<Value> },
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Release => "release",
            Command::Step(_) => "step",
            Command::Call { name, .. } => name,
        }
    }
}

/// コントローラが発行したコマンド
///
/// 停止中のスレッドで一度だけ実行され、結果は確定後に変わりません。
pub struct RemoteCommand {
    command: Command,
    result: Mutex<Option<Value>>,
    done: Condvar,
}

impl RemoteCommand {
    pub fn new(command: Command) -> Arc<Self> {
        Arc::new(Self {
            command,
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// 結果を確定する。既に確定していれば何もせず `false`
    pub fn complete(&self, value: Value) -> bool {
        let mut result = self.result.lock();
        if result.is_some() {
            return false;
        }
        *result = Some(value);
        self.done.notify_all();
        true
    }

    pub fn is_consumed(&self) -> bool {
        self.result.lock().is_some()
    }

    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    /// 結果を待つ。タイムアウトしたら `None`
    pub fn wait(&self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock();
        while result.is_none() {
            if self.done.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        result.clone()
    }
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<Arc<RemoteCommand>>,
    /// スレッドが停止を抜けた後は受け付けない
    closed: bool,
}

/// スレッドごとのFIFOの受信箱
#[derive(Default)]
pub struct CommandInbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl CommandInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// コマンドを積む
    ///
    /// 閉じた受信箱には積まずに空の結果で完了させ、`false` を返す。
    pub fn push(&self, command: Arc<RemoteCommand>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            command.complete(Value::Null);
            return false;
        }
        state.queue.push_back(command);
        self.ready.notify_one();
        true
    }

    /// 先頭のコマンドを取り出す。空なら最大 `poll` だけ待つ
    pub fn pop_wait(&self, poll: Duration) -> Option<Arc<RemoteCommand>> {
        let mut state = self.state.lock();
        if state.queue.is_empty() && !state.closed {
            self.ready.wait_for(&mut state, poll);
        }
        state.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 受信箱を閉じ、残っているコマンドを空の結果で完了させる
    pub fn abandon(&self) {
        let pending: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        for command in pending {
            command.complete(Value::Null);
        }
    }
}

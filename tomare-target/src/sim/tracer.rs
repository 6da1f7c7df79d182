//! シミュレーションのデコーダとスレッドトレーサ

use crate::{
    BlockWriter, CpuContext, Instruction, InstructionDecoder, InstructionKind, Result, StepHooks,
    ThreadId, ThreadTracer,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// 命令テーブルによるデコーダ
#[derive(Default)]
pub struct SimDecoder {
    instructions: Mutex<HashMap<u64, Instruction>>,
}

impl SimDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 命令を定義する
    pub fn define(&self, address: u64, size: u32, mnemonic: &str, op_str: &str, groups: &[&str]) {
        self.instructions.lock().insert(
            address,
            Instruction {
                address,
                size,
                mnemonic: mnemonic.to_string(),
                op_str: op_str.to_string(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
            },
        );
    }
}

impl InstructionDecoder for SimDecoder {
    fn decode(&self, address: u64) -> Result<Instruction> {
        self.instructions
            .lock()
            .get(&address)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Failed to decode instruction at {:#x}", address))
    }
}

struct SimBlockWriter {
    instructions: Vec<Instruction>,
    cursor: usize,
    /// (命令, コールアウトの有無)
    kept: Vec<(Instruction, bool)>,
}

impl BlockWriter for SimBlockWriter {
    fn next(&mut self) -> Option<Instruction> {
        let insn = self.instructions.get(self.cursor).cloned();
        self.cursor += 1;
        insn
    }

    fn keep(&mut self) {
        if let Some(insn) = self.cursor.checked_sub(1).and_then(|i| self.instructions.get(i)) {
            self.kept.push((insn.clone(), false));
        }
    }

    fn put_callout(&mut self) {
        if let Some(last) = self.kept.last_mut() {
            last.1 = true;
        }
    }
}

#[derive(Default)]
struct FollowState {
    hooks: HashMap<ThreadId, Arc<dyn StepHooks>>,
    /// スレッドごとの再生成済みブロック（先頭アドレス -> 命令列）
    blocks: HashMap<ThreadId, HashMap<u64, Vec<(Instruction, bool)>>>,
}

/// 実行パスを与えてスレッドのトレースを再現するトレーサ
///
/// ブロックは分岐・呼び出し・リターン命令で区切られ、最初に実行されるときだけ再生成されます。
pub struct SimTracer {
    decoder: Arc<SimDecoder>,
    state: Mutex<FollowState>,
}

impl SimTracer {
    pub fn new(decoder: Arc<SimDecoder>) -> Self {
        Self {
            decoder,
            state: Mutex::new(FollowState::default()),
        }
    }

    pub fn is_following(&self, thread_id: ThreadId) -> bool {
        self.state.lock().hooks.contains_key(&thread_id)
    }

    fn hooks(&self, thread_id: ThreadId) -> Option<Arc<dyn StepHooks>> {
        self.state.lock().hooks.get(&thread_id).cloned()
    }

    /// 命令アドレスの列を順に実行する
    ///
    /// 追跡されていない間はコールアウトなしで進み、最後のpcを `context` に設定します。
    pub fn run(&self, thread_id: ThreadId, context: &mut CpuContext, path: &[u64]) -> Result<()> {
        let mut blocks: Vec<Vec<Instruction>> = Vec::new();
        let mut current = Vec::new();
        for &address in path {
            let insn = self.decoder.decode(address)?;
            let ends_block = insn.kind() != InstructionKind::Plain;
            current.push(insn);
            if ends_block {
                blocks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        for block in blocks {
            let start = block[0].address;
            let Some(hooks) = self.hooks(thread_id) else {
                context.set_pc(start);
                continue;
            };

            let cached = self
                .state
                .lock()
                .blocks
                .get(&thread_id)
                .and_then(|b| b.get(&start).cloned());

            let compiled = match cached {
                Some(compiled) => compiled,
                None => {
                    let mut writer = SimBlockWriter {
                        instructions: block,
                        cursor: 0,
                        kept: Vec::new(),
                    };
                    hooks.transform(thread_id, &mut writer);

                    let mut state = self.state.lock();
                    if let Some(blocks) = state.blocks.get_mut(&thread_id) {
                        blocks.insert(start, writer.kept.clone());
                    }
                    writer.kept
                }
            };

            for (insn, callout) in compiled {
                context.set_pc(insn.address);
                if callout {
                    if !self.is_following(thread_id) {
                        break;
                    }
                    hooks.callout(thread_id, context);
                }
            }
        }
        Ok(())
    }
}

impl ThreadTracer for SimTracer {
    fn follow(&self, thread_id: ThreadId, hooks: Arc<dyn StepHooks>) -> Result<()> {
        let mut state = self.state.lock();
        if state.hooks.contains_key(&thread_id) {
            return Err(anyhow::anyhow!("Thread {} is already followed", thread_id));
        }
        state.hooks.insert(thread_id, hooks);
        state.blocks.insert(thread_id, HashMap::new());
        Ok(())
    }

    fn unfollow(&self, thread_id: ThreadId) {
        self.state.lock().hooks.remove(&thread_id);
    }

    fn flush(&self) {}

    fn garbage_collect(&self) {
        let mut state = self.state.lock();
        let FollowState { hooks, blocks } = &mut *state;
        blocks.retain(|tid, _| hooks.contains_key(tid));
    }
}

//! シミュレーションのインターセプタ

use crate::{CpuContext, Interceptor, InterceptorHandle, Result, ThreadId, TrapFrame, TrapHandler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Attachment {
    handle: InterceptorHandle,
    handler: Arc<dyn TrapHandler>,
}

/// アドレスごとにハンドラを保持するインターセプタ
#[derive(Default)]
pub struct SimInterceptor {
    attachments: Mutex<HashMap<u64, Attachment>>,
    next_handle: AtomicU64,
    flushes: AtomicU64,
}

impl SimInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// アドレスにインターセプタがアタッチされているか
    pub fn attached(&self, address: u64) -> bool {
        self.attachments.lock().contains_key(&address)
    }

    pub fn attached_count(&self) -> usize {
        self.attachments.lock().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// スレッドがアドレスを実行したときの動作
    ///
    /// インターセプタがあればハンドラを呼び出し、呼び出したかどうかを返します。
    pub fn execute(&self, thread_id: ThreadId, address: u64, context: &mut CpuContext, args: Vec<u64>) -> bool {
        // ハンドラ内でデタッチ・アタッチされるため、ロックを保持せずに呼び出す
        let handler = match self.attachments.lock().get(&address) {
            Some(attachment) => attachment.handler.clone(),
            None => return false,
        };

        context.set_pc(address);
        let mut frame = TrapFrame {
            thread_id,
            address,
            context,
            args,
        };
        handler.on_trap(&mut frame);
        true
    }
}

impl Interceptor for SimInterceptor {
    fn attach(&self, address: u64, handler: Arc<dyn TrapHandler>) -> Result<InterceptorHandle> {
        let mut attachments = self.attachments.lock();
        if attachments.contains_key(&address) {
            return Err(anyhow::anyhow!("Address {:#x} is already intercepted", address));
        }

        let handle = InterceptorHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        attachments.insert(address, Attachment { handle, handler });
        Ok(handle)
    }

    fn detach(&self, handle: InterceptorHandle) {
        self.attachments.lock().retain(|_, a| a.handle != handle);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn detach_all(&self) {
        self.attachments.lock().clear();
    }
}

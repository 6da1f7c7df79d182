//! ネイティブコードのインターセプト

use crate::{CpuContext, Result, ThreadId};
use std::sync::Arc;

/// アタッチされたインターセプタの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorHandle(pub u64);

/// インターセプトされた位置でのスレッドの状態
pub struct TrapFrame<'a> {
    pub thread_id: ThreadId,
    /// インターセプトされたアドレス
    pub address: u64,
    /// 書き込みは再開後のスレッドに反映される
    pub context: &'a mut CpuContext,
    /// 呼び出し規約に従って取得された引数
    pub args: Vec<u64>,
}

/// インターセプトされた位置で呼ばれるハンドラ
///
/// トラップしたスレッド上で同期的に呼ばれ、戻るまでそのスレッドは停止したままです。
pub trait TrapHandler: Send + Sync {
    fn on_trap(&self, frame: &mut TrapFrame<'_>);
}

/// コードパッチによるインターセプトのプリミティブ
pub trait Interceptor: Send + Sync {
    /// アドレスにハンドラをアタッチする
    fn attach(&self, address: u64, handler: Arc<dyn TrapHandler>) -> Result<InterceptorHandle>;

    /// インターセプタをデタッチし、元の命令バイトを戻す
    fn detach(&self, handle: InterceptorHandle);

    /// 保留中のパッチ変更を確定する
    fn flush(&self);

    /// すべてのインターセプタをデタッチする
    fn detach_all(&self);
}

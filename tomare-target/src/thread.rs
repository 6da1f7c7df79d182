//! スレッド識別

/// スレッドID
pub type ThreadId = i32;

/// 呼び出し元スレッドのOSスレッドIDを取得する
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_id() -> ThreadId {
    nix::unistd::gettid().as_raw()
}

/// 呼び出し元スレッドのOSスレッドIDを取得する
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn current_thread_id() -> ThreadId {
    nix::unistd::getpid().as_raw()
}

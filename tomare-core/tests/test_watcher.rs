//! メモリ監視のテスト

mod common;

use common::{test_config, Harness};
use serde_json::json;
use std::thread::{self, JoinHandle};
use tomare_core::{EngineConfig, Event, Reason, WatchBackend, WatchFlags};
use tomare_target::sim::AccessOutcome;
use tomare_target::{Arch, MemoryOperation, Protection, ThreadId};

const DATA: u64 = 0x20000;
const WATCHED: u64 = 0x20010;
/// 同じページの別の監視アドレス
const NEIGHBOR: u64 = 0x20800;
const FROM: u64 = 0x1234;

fn setup() -> Harness {
    let h = Harness::new(Arch::X64);
    h.sim.memory.map(DATA, 0x1000, Protection::READ_WRITE);
    h.engine.init().expect("Failed to init engine");
    assert_eq!(h.wait_context().reason, Reason::InitialContext);
    h
}

fn protection(text: &str) -> Protection {
    text.parse().expect("Failed to parse protection")
}

fn spawn_access(h: &Harness, thread_id: ThreadId, watched: u64, operation: MemoryOperation) -> JoinHandle<AccessOutcome> {
    let sim = h.sim.clone();
    thread::spawn(move || sim.access(thread_id, FROM, watched, operation))
}

/// 監視のヒットから停止、解除までを確認する
fn hit_and_release(h: &Harness, thread_id: ThreadId, operation: MemoryOperation) {
    hit_at_and_release(h, thread_id, WATCHED, operation);
}

fn hit_at_and_release(h: &Harness, thread_id: ThreadId, watched: u64, operation: MemoryOperation) {
    let worker = spawn_access(h, thread_id, watched, operation);

    match h.wait_for("watcher") {
        Event::Watcher { tid, address, operation: op, from } => {
            assert_eq!(tid, thread_id);
            assert_eq!(address, watched);
            assert_eq!(op, operation);
            assert_eq!(from, FROM);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let info = h.wait_context();
    assert_eq!(info.reason, Reason::Watcher);
    assert_eq!(info.ptr, Some(FROM));

    assert_eq!(h.engine.api(thread_id, "release", &[]), json!(true));
    let outcome = worker.join().expect("accessing thread panicked");
    assert_eq!(outcome, AccessOutcome::Completed);
}

#[test]
fn test_read_and_write_hits_suspend() {
    let h = setup();
    assert_eq!(h.engine.api(0, "addWatcher", &[json!("0x20010")]), json!(true));
    match h.wait_for("watcher_added") {
        Event::WatcherAdded { address, flags, .. } => {
            assert_eq!(address, WATCHED);
            assert_eq!(flags, 3);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));

    hit_and_release(&h, 41, MemoryOperation::Read);
    // 再実行の後で保護がかけ直される
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
    hit_and_release(&h, 41, MemoryOperation::Write);
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
    assert!(h.engine.is_address_watched(WATCHED));
}

#[test]
fn test_same_page_access_passes_through() {
    let h = setup();
    h.engine
        .add_watcher(WATCHED, WatchFlags::default())
        .expect("Failed to add watcher");
    h.wait_for("watcher_added");

    let outcome = h.sim.access(42, FROM, DATA + 0x100, MemoryOperation::Read);
    assert_eq!(outcome, AccessOutcome::Completed);
    assert!(h.pending_event_names().is_empty());
    assert!(!h.engine.is_suspended(42));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
}

#[test]
fn test_unwatched_operation_is_not_reported() {
    let h = setup();
    assert_eq!(
        h.engine.api(0, "addWatcher", &[json!(WATCHED), json!(WatchFlags::WRITE.bits())]),
        json!(true)
    );
    h.wait_for("watcher_added");
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("r--")));

    // 読み取りはページ保護に引っかからない
    assert_eq!(
        h.sim.access(43, FROM, WATCHED, MemoryOperation::Read),
        AccessOutcome::Completed
    );
    assert!(h.pending_event_names().is_empty());

    hit_and_release(&h, 43, MemoryOperation::Write);
}

#[test]
fn test_single_shot_watcher_is_not_rearmed() {
    let h = setup();
    assert_eq!(h.engine.api(0, "addWatcher", &[json!(WATCHED), json!(11)]), json!(true));
    h.wait_for("watcher_added");

    hit_and_release(&h, 44, MemoryOperation::Write);
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));

    // 監視表には残るが、2回目のアクセスでは止まらない
    assert!(h.engine.is_address_watched(WATCHED));
    assert_eq!(
        h.sim.access(44, FROM, WATCHED, MemoryOperation::Write),
        AccessOutcome::Completed
    );
    assert!(h.pending_event_names().iter().all(|name| *name != "watcher"));

    // 追加し直すと保護がかけ直される
    assert_eq!(h.engine.api(0, "addWatcher", &[json!(WATCHED), json!(11)]), json!(true));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
}

#[test]
fn test_remove_watcher_restores_protection() {
    let h = setup();
    h.engine
        .add_watcher(WATCHED, WatchFlags::READ)
        .expect("Failed to add watcher");
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("-w-")));

    let listed = h.engine.api(0, "watchers", &[]);
    assert_eq!(listed[0]["address"], json!("0x20010"));
    assert_eq!(listed[0]["flags"], json!(1));

    assert_eq!(h.engine.api(0, "removeWatcher", &[json!("0x20010")]), json!(true));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));
    assert_eq!(h.engine.api(0, "isAddressWatched", &[json!("0x20010")]), json!(false));
    h.wait_for("watcher_removed");

    assert_eq!(h.engine.api(0, "removeWatcher", &[json!("0x20010")]), json!(false));
    assert_eq!(
        h.sim.access(45, FROM, WATCHED, MemoryOperation::Read),
        AccessOutcome::Completed
    );
}

#[test]
fn test_unmapped_address_is_rejected() {
    let h = setup();
    assert_eq!(h.engine.api(0, "addWatcher", &[json!("0x70000")]), json!(false));
    assert!(h.engine.watchers().snapshot().is_empty());
}

#[test]
fn test_access_outside_watched_pages_is_unhandled() {
    let h = setup();
    h.sim.memory.map(0x30000, 0x1000, Protection::NONE);
    h.engine
        .add_watcher(WATCHED, WatchFlags::default())
        .expect("Failed to add watcher");

    assert_eq!(
        h.sim.access(46, FROM, 0x30000, MemoryOperation::Read),
        AccessOutcome::Faulted
    );
}

#[test]
fn test_access_monitor_backend_suspends_at_accessing_instruction() {
    let config = EngineConfig {
        watch_backend: Some(WatchBackend::AccessMonitor),
        ..test_config()
    };
    let h = Harness::with_config(Arch::X64, config);
    h.sim.memory.map(DATA, 0x1000, Protection::READ_WRITE);

    assert!(h
        .engine
        .add_watcher(WATCHED, WatchFlags::default())
        .expect("Failed to add watcher"));
    // ページ保護は変えずにモニタで監視する
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));
    assert!(h.sim.access_monitor.is_enabled());

    let sim = h.sim.clone();
    let worker = thread::spawn(move || {
        let outcome = sim.access(47, FROM, WATCHED, MemoryOperation::Read);
        // アクセスした命令に戻ってくる
        let mut context = sim.context_at(FROM);
        sim.call(47, FROM, &mut context, Vec::new());
        outcome
    });

    match h.wait_for("watcher") {
        Event::Watcher { tid, from, .. } => {
            assert_eq!(tid, 47);
            assert_eq!(from, FROM);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let info = h.wait_context();
    assert_eq!(info.reason, Reason::Watcher);
    assert_eq!(info.ptr, Some(FROM));
    assert!(!h.sim.access_monitor.is_enabled());

    h.engine.release(47);
    assert_eq!(worker.join().expect("accessing thread panicked"), AccessOutcome::Completed);

    // 一度だけのインターセプタは外れ、モニタは再び有効になる
    assert!(!h.sim.interceptor.attached(FROM));
    assert!(h.sim.access_monitor.is_enabled());

    assert!(h.engine.remove_watcher(WATCHED));
    assert!(!h.sim.access_monitor.is_enabled());
}

#[test]
fn test_watchers_on_one_page_keep_each_other_armed() {
    let h = setup();
    assert!(h.engine.add_watcher(WATCHED, WatchFlags::READ).expect("Failed to add watcher"));
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("-w-")));

    // 2つ目の監視は1つ目の分も残したまま保護を外す
    assert!(h.engine.add_watcher(NEIGHBOR, WatchFlags::WRITE).expect("Failed to add watcher"));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
    let listed = h.engine.api(0, "watchers", &[]);
    assert_eq!(listed[0]["protection"], json!("rw-"));
    assert_eq!(listed[1]["protection"], json!("rw-"));

    hit_at_and_release(&h, 48, WATCHED, MemoryOperation::Read);
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));
    hit_at_and_release(&h, 48, NEIGHBOR, MemoryOperation::Write);
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));

    // 1つを外しても残りの監視は有効なまま
    assert!(h.engine.remove_watcher(WATCHED));
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("r--")));
    let _ = h.pending_event_names();
    assert_eq!(
        h.sim.access(48, FROM, WATCHED, MemoryOperation::Read),
        AccessOutcome::Completed
    );
    assert!(h.pending_event_names().is_empty());
    hit_at_and_release(&h, 48, NEIGHBOR, MemoryOperation::Write);

    // 最後の監視を外すと元の保護に戻る
    assert!(h.engine.remove_watcher(NEIGHBOR));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));
}

#[test]
fn test_single_shot_watcher_beside_persistent_watcher() {
    let h = setup();
    let single_shot = WatchFlags::WRITE | WatchFlags::SINGLESHOT;
    assert!(h.engine.add_watcher(WATCHED, single_shot).expect("Failed to add watcher"));
    assert!(h.engine.add_watcher(NEIGHBOR, WatchFlags::READ).expect("Failed to add watcher"));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::NONE));

    hit_at_and_release(&h, 49, WATCHED, MemoryOperation::Write);
    // 一度きりの監視の分だけ保護が戻る
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("-w-")));
    let listed = h.engine.api(0, "watchers", &[]);
    assert_eq!(listed[0]["armed"], json!(false));
    assert_eq!(listed[1]["armed"], json!(true));

    let _ = h.pending_event_names();
    assert_eq!(
        h.sim.access(49, FROM, WATCHED, MemoryOperation::Write),
        AccessOutcome::Completed
    );
    assert!(h.pending_event_names().is_empty());
    hit_at_and_release(&h, 49, NEIGHBOR, MemoryOperation::Read);
    assert_eq!(h.sim.memory.protection(DATA), Some(protection("-w-")));

    // 持続する監視を外すと、ヒット済みの監視しか残らないので元の保護になる
    assert!(h.engine.remove_watcher(NEIGHBOR));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));
    assert!(h.engine.is_address_watched(WATCHED));
    assert!(h.engine.remove_watcher(WATCHED));
    assert_eq!(h.sim.memory.protection(DATA), Some(Protection::READ_WRITE));
}

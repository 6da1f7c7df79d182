//! ステップ実行のテスト
//!
//! トレーサはブートストラップのリターン命令を実行してから対象のコードに入るため、
//! 実行パスの先頭にリターン命令を並べて再現します。

mod common;

use common::Harness;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tomare_core::{HookKey, HookLogic, HookOptions, LogicOutcome, Reason, StepMode};
use tomare_target::sim::SimTarget;
use tomare_target::{Arch, CpuContext, InstructionKind, ThreadId};

const X64_PATH: &[u64] = &[
    0x9000, 0x9010, 0x9020, 0x9030, 0x9040, // ブートストラップ
    0x4000, 0x4001, 0x4004, 0x4010, 0x4013, 0x5000, 0x5001,
];

const ARM64_PATH: &[u64] = &[
    0x9000, 0x9010, 0x9020, 0x9030, 0x9040, // ブートストラップ
    0x9100, 0x9104, // ブロックのコピー
    0x4000, 0x4004, 0x4008, 0x4010, 0x4014, 0x5000, 0x5004,
];

fn define_x64_program(sim: &SimTarget) {
    for address in [0x9000, 0x9010, 0x9020, 0x9030, 0x9040] {
        sim.decoder.define(address, 1, "ret", "", &["ret"]);
    }
    sim.decoder.define(0x4000, 1, "push", "rbp", &[]);
    sim.decoder.define(0x4001, 3, "mov", "rbp, rsp", &[]);
    sim.decoder.define(0x4004, 2, "jmp", "0x4010", &["jump"]);
    sim.decoder.define(0x4010, 3, "mov", "rax, rdi", &[]);
    sim.decoder.define(0x4013, 5, "call", "0x5000", &["call"]);
    sim.decoder.define(0x5000, 1, "push", "rbp", &[]);
    sim.decoder.define(0x5001, 1, "ret", "", &["ret"]);
}

fn define_arm64_program(sim: &SimTarget) {
    for address in [0x9000, 0x9010, 0x9020, 0x9030, 0x9040] {
        sim.decoder.define(address, 4, "ret", "", &["ret"]);
    }
    sim.decoder.define(0x9100, 4, "mov", "x16, x0", &[]);
    sim.decoder.define(0x9104, 4, "b", "0x4000", &["jump"]);
    sim.decoder.define(0x4000, 4, "stp", "x29, x30, [sp, #-16]!", &[]);
    sim.decoder.define(0x4004, 4, "mov", "x29, sp", &[]);
    sim.decoder.define(0x4008, 4, "b", "0x4010", &["jump"]);
    sim.decoder.define(0x4010, 4, "mov", "x0, x1", &[]);
    sim.decoder.define(0x4014, 4, "bl", "0x5000", &["call"]);
    sim.decoder.define(0x5000, 4, "stp", "x29, x30, [sp, #-16]!", &[]);
    sim.decoder.define(0x5004, 4, "ret", "", &["ret"]);
}

fn setup(arch: Arch) -> Harness {
    let h = Harness::new(arch);
    h.map_code(0x4000);
    h.map_code(0x5000);
    match arch {
        Arch::Arm64 => define_arm64_program(&h.sim),
        _ => define_x64_program(&h.sim),
    }
    h
}

/// 0x4000を呼び出し、トラップから戻った後は実行パスをトレーサの下で進める
fn spawn_traced(h: &Harness, thread_id: ThreadId, path: &'static [u64]) -> JoinHandle<CpuContext> {
    let sim: Arc<SimTarget> = h.sim.clone();
    thread::spawn(move || {
        let mut context = sim.context_at(0x4000);
        sim.call(thread_id, 0x4000, &mut context, Vec::new());
        sim.run_traced(thread_id, &mut context, path)
            .expect("Failed to run traced path");
        context
    })
}

/// ブレークポイントで停止させてからステップ実行を始める
fn break_and_step(h: &Harness, thread_id: ThreadId, path: &'static [u64], mode: Value) -> JoinHandle<CpuContext> {
    h.engine.hook_native(0x4000, HookOptions::default()).expect("Failed to hook");
    let worker = spawn_traced(h, thread_id, path);

    let info = h.wait_context();
    assert_eq!(info.reason, Reason::Breakpoint);
    assert_eq!(info.ptr, Some(0x4000));
    assert_eq!(h.engine.api(thread_id, "step", &[mode]), json!(true));
    worker
}

fn expect_step_stop(h: &Harness, thread_id: ThreadId, address: u64) {
    let info = h.wait_context();
    assert_eq!(info.tid, thread_id);
    assert_eq!(info.reason, Reason::Step);
    assert_eq!(info.ptr, Some(address));
    // ステップ中の停止ではバックトレースを計算しない
    assert!(info.backtrace.is_none());
}

fn assert_hook_restored(h: &Harness, thread_id: ThreadId) {
    assert!(!h.engine.sessions().contains(thread_id));
    assert!(h.engine.hooks().contains(&HookKey::Native(0x4000)));
    assert!(h.sim.interceptor.attached(0x4000));
    assert!(!h.sim.tracer.is_following(thread_id));
}

#[test]
fn test_instruction_step_stops_at_every_instruction() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 21, X64_PATH, Value::Null);

    let stops = [0x4001, 0x4004, 0x4010, 0x4013, 0x5000, 0x5001];
    for (i, &address) in stops.iter().enumerate() {
        expect_step_stop(&h, 21, address);
        if i + 1 < stops.len() {
            assert_eq!(h.engine.api(21, "step", &[]), json!(true));
        } else {
            assert_eq!(h.engine.api(21, "release", &[]), json!(true));
        }
    }

    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 21);
}

#[test]
fn test_step_info_reports_hook_backup() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 22, X64_PATH, Value::Null);
    expect_step_stop(&h, 22, 0x4001);

    // 開始位置のフックはステップ実行中は外れている
    assert!(!h.engine.hooks().contains(&HookKey::Native(0x4000)));
    assert!(!h.sim.interceptor.attached(0x4000));

    let info = h.engine.api(22, "stepInfo", &[]);
    assert_eq!(info["mode"], json!("instruction"));
    assert_eq!(info["initialPc"], json!("0x4000"));
    assert_eq!(info["hookBackup"], json!("0x4000"));
    assert_eq!(info["lastContextAddress"], json!("0x4001"));
    assert_eq!(info["diverged"], json!(true));

    assert_eq!(h.engine.api(22, "release", &[]), json!(true));
    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 22);
    assert_eq!(h.engine.api(22, "stepInfo", &[]), Value::Null);
}

#[test]
fn test_block_step_stops_after_jump() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 23, X64_PATH, json!("block"));

    expect_step_stop(&h, 23, 0x4010);
    assert_eq!(h.engine.api(23, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert!(h.pending_event_names().iter().all(|name| *name != "set_context"));
    assert_hook_restored(&h, 23);
}

#[test]
fn test_call_step_stops_in_callee() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 24, X64_PATH, json!("call"));

    expect_step_stop(&h, 24, 0x5000);
    assert_eq!(h.engine.api(24, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 24);
}

#[test]
fn test_step_mode_can_change_while_stepping() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 25, X64_PATH, Value::Null);

    expect_step_stop(&h, 25, 0x4001);
    // 次はジャンプの直後で止まる
    assert_eq!(h.engine.api(25, "step", &[json!("block")]), json!(true));
    expect_step_stop(&h, 25, 0x4010);
    assert_eq!(h.engine.api(25, "step", &[json!("call")]), json!(true));
    expect_step_stop(&h, 25, 0x5000);
    assert_eq!(h.engine.api(25, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 25);
}

#[test]
fn test_stop_step_while_suspended() {
    let h = setup(Arch::X64);
    let worker = break_and_step(&h, 26, X64_PATH, Value::Null);
    expect_step_stop(&h, 26, 0x4001);

    assert_eq!(h.engine.api(26, "stopStep", &[]), json!(true));
    assert_hook_restored(&h, 26);
    assert_eq!(h.engine.api(26, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert!(h.pending_event_names().iter().all(|name| *name != "set_context"));
    assert_eq!(h.engine.api(26, "stopStep", &[]), json!(false));
}

#[test]
fn test_logic_requests_custom_step() {
    let h = setup(Arch::X64);
    let options = HookOptions {
        logic: Some(HookLogic::callback(|proxy| {
            proxy.request_step(StepMode::custom(|scope| {
                if scope.instruction.kind() == InstructionKind::Call {
                    scope.suspend();
                }
            }));
            LogicOutcome::Suspend
        })),
        ..HookOptions::default()
    };
    h.engine.hook_native(0x4000, options).expect("Failed to hook");

    let worker = spawn_traced(&h, 27, X64_PATH);

    // ブレークポイントでは停止せず、呼び出し命令で止まる
    let info = h.wait_context();
    assert_eq!(info.reason, Reason::Step);
    assert_eq!(info.ptr, Some(0x4013));
    assert_eq!(h.engine.api(27, "stepInfo", &[])["mode"], json!("custom"));

    assert_eq!(h.engine.api(27, "release", &[]), json!(true));
    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 27);
}

#[test]
fn test_custom_step_can_stop_itself() {
    let h = setup(Arch::X64);
    let options = HookOptions {
        logic: Some(HookLogic::callback(|proxy| {
            proxy.request_step(StepMode::custom(|scope| {
                if scope.instruction.address == 0x4010 {
                    scope.stop();
                }
            }));
            LogicOutcome::Suspend
        })),
        ..HookOptions::default()
    };
    h.engine.hook_native(0x4000, options).expect("Failed to hook");

    let worker = spawn_traced(&h, 28, X64_PATH);
    worker.join().expect("stepping thread panicked");

    assert!(h.pending_event_names().iter().all(|name| *name != "set_context"));
    assert_hook_restored(&h, 28);
}

#[test]
fn test_arm64_skips_copied_block() {
    let h = setup(Arch::Arm64);
    let worker = break_and_step(&h, 29, ARM64_PATH, json!("block"));

    expect_step_stop(&h, 29, 0x4010);
    assert_eq!(h.engine.api(29, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 29);
}

#[test]
fn test_arm64_instruction_step_starts_after_entry() {
    let h = setup(Arch::Arm64);
    let worker = break_and_step(&h, 30, ARM64_PATH, Value::Null);

    expect_step_stop(&h, 30, 0x4004);
    let info = h.engine.api(30, "stepInfo", &[]);
    assert_eq!(info["expectedPc"], json!("0x4004"));
    assert_eq!(h.engine.api(30, "release", &[]), json!(true));

    worker.join().expect("stepping thread panicked");
    assert_hook_restored(&h, 30);
}

#[test]
fn test_step_on_unsupported_architecture_releases() {
    let h = Harness::new(Arch::Ia32);
    h.map_code(0x4000);
    h.engine.hook_native(0x4000, HookOptions::default()).expect("Failed to hook");

    let worker = h.spawn_call(31, 0x4000);
    h.wait_context();
    assert_eq!(h.engine.api(31, "step", &[]), json!(false));
    worker.join().expect("trapped thread panicked");

    assert!(!h.engine.is_suspended(31));
    assert!(!h.engine.sessions().contains(31));
    // 実行中のスレッドへのステップ要求は失敗すると null
    assert_eq!(h.engine.api(31, "step", &[]), Value::Null);
}

#[test]
fn test_step_on_running_thread_without_context_fails() {
    let h = setup(Arch::X64);
    assert_eq!(h.engine.api(32, "step", &[]), Value::Null);
    assert_eq!(h.engine.api(32, "step", &[json!("sideways")]), Value::Null);
    assert!(!h.engine.sessions().contains(32));
}

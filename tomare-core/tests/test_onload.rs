//! モジュールとクラスのロード時のフック、マネージドメソッドのフックのテスト

mod common;

use common::Harness;
use serde_json::{json, Value};
use std::thread;
use tomare_core::event::Backtrace;
use tomare_core::{Event, HookKey, Reason};
use tomare_target::{Arch, ManagedArg, ManagedHandle, ModuleInfo};

fn setup() -> Harness {
    let h = Harness::new(Arch::X64);
    h.engine.init().expect("Failed to init engine");
    assert_eq!(h.wait_context().reason, Reason::InitialContext);
    h
}

fn module(name: &str, base: u64) -> ModuleInfo {
    ModuleInfo {
        name: name.to_string(),
        path: format!("/system/lib64/{}", name),
        base,
        size: 0x10000,
        entry: Some(base + 0x100),
    }
}

#[test]
fn test_native_onload_suspends_loading_thread() {
    let h = setup();
    assert_eq!(h.engine.api(0, "hookNativeOnLoad", &[json!("libfoo")]), json!(true));
    assert_eq!(h.engine.api(0, "hookNativeOnLoad", &[json!("libfoo")]), json!(false));
    assert_eq!(h.pending_event_names(), vec!["hook_native_on_load_callback"]);

    let sim = h.sim.clone();
    let worker = thread::spawn(move || {
        let mut context = sim.context_at(0x1500);
        sim.process.load_module(51, module("libfoo.so", 0x7000_0000), &mut context);
    });

    match h.wait_for("native_on_load_module_loading") {
        Event::NativeOnLoadModuleLoading { tid, module } => {
            assert_eq!(tid, 51);
            assert_eq!(module.name, "libfoo.so");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match h.wait_for("native_on_load_callback") {
        Event::NativeOnLoadCallback {
            module,
            module_base,
            module_entry,
            ..
        } => {
            assert_eq!(module, "libfoo.so");
            assert_eq!(module_base, 0x7000_0000);
            assert_eq!(module_entry, Some(0x7000_0100));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let info = h.wait_context();
    assert_eq!(info.reason, Reason::NativeOnLoad);
    assert_eq!(info.ptr, Some(0x1500));
    let loaded = info.module.expect("onload context without module");
    assert_eq!(loaded.module, "libfoo.so");
    assert_eq!(loaded.module_base, 0x7000_0000);

    assert_eq!(h.engine.api(51, "release", &[]), json!(true));
    worker.join().expect("loading thread panicked");

    // フックは残り、ロードしたモジュールが記録される
    let record = h
        .engine
        .hooks()
        .get(&HookKey::NativeOnLoad("libfoo".to_string()))
        .expect("onload hook removed");
    assert_eq!(record.module.map(|m| m.module), Some("libfoo.so".to_string()));
    assert_eq!(h.engine.api(0, "nativeOnLoads", &[])[0]["key"], json!("libfoo"));
}

#[test]
fn test_unmatched_module_is_only_reported() {
    let h = setup();
    h.engine.api(0, "hookNativeOnLoad", &[json!("libfoo")]);

    let mut context = h.sim.context_at(0x1500);
    h.sim
        .process
        .load_module(52, module("libbar.so", 0x7100_0000), &mut context);

    let names = h.pending_event_names();
    assert!(names.contains(&"native_on_load_module_loading"));
    assert!(!names.contains(&"set_context"));
    assert!(!h.engine.is_suspended(52));
}

#[test]
fn test_onload_logic_can_skip_suspension() {
    let h = setup();
    assert_eq!(
        h.engine.api(0, "hookNativeOnLoad", &[json!("libfoo"), json!("rax = 1; -1")]),
        json!(true)
    );

    let mut context = h.sim.context_at(0x1500);
    h.sim
        .process
        .load_module(53, module("libfoo.so", 0x7000_0000), &mut context);

    assert_eq!(context.get("rax"), Some(1));
    let names = h.pending_event_names();
    assert!(names.contains(&"native_on_load_callback"));
    assert!(!names.contains(&"set_context"));
}

#[test]
fn test_java_onload_suspends_on_first_load() {
    let h = setup();
    assert_eq!(h.engine.api(0, "hookJavaOnLoad", &[json!("com.example.Foo")]), json!(true));
    assert_eq!(h.engine.api(0, "hookJavaOnLoad", &[json!("com.example.Foo")]), json!(false));
    h.wait_for("hook_java_on_load_callback");

    let sim = h.sim.clone();
    let worker = thread::spawn(move || sim.managed.load_class(54, "com.example.Foo"));

    h.wait_for("class_loader_loading_class");
    match h.wait_for("java_on_load_callback") {
        Event::JavaOnLoadCallback { tid, class_name } => {
            assert_eq!(tid, 54);
            assert_eq!(class_name, "com.example.Foo");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let info = h.wait_context();
    assert!(info.is_java);
    assert_eq!(info.class_method.as_deref(), Some("com.example.Foo"));
    assert!(info.context.is_none());

    h.engine.release(54);
    worker.join().expect("loading thread panicked");

    // 2回目以降のロードは通知されない
    h.sim.managed.load_class(54, "com.example.Foo");
    assert!(h.pending_event_names().iter().all(|name| *name != "set_context"));

    assert_eq!(h.engine.api(0, "deleteHook", &[json!("com.example.Foo")]), json!(true));
    assert_eq!(h.engine.api(0, "javaOnLoads", &[]), json!([]));
}

#[test]
fn test_managed_method_hook() {
    let h = setup();
    h.sim.managed.define_method("com.example.Foo", "bar", 2);

    assert_eq!(h.engine.api(0, "hookJavaMethod", &[json!("com.example.Foo.bar")]), json!(true));
    match h.wait_for("hook_java_callback") {
        Event::HookJavaCallback { class_method } => assert_eq!(class_method, "com.example.Foo.bar"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.engine.hooks().get(&HookKey::Managed("com.example.Foo.bar".to_string())).map(|r| r.overloads), Some(2));
    assert!(h.sim.managed.is_hooked("com.example.Foo", "bar"));

    let sim = h.sim.clone();
    let worker = thread::spawn(move || {
        let args = [ManagedArg {
            class_name: "int".to_string(),
            value: "7".to_string(),
        }];
        sim.managed
            .invoke(55, "com.example.Foo", "bar", &args, Some(ManagedHandle(1)))
    });

    let info = h.wait_context();
    assert_eq!(info.reason, Reason::Breakpoint);
    assert!(info.is_java);
    assert_eq!(info.class_method.as_deref(), Some("com.example.Foo.bar"));
    assert_eq!(info.java_args.as_ref().map(Vec::len), Some(1));
    match &info.backtrace {
        Some(Backtrace::Java(frames)) => assert_eq!(frames, &vec!["com.example.Foo.bar".to_string()]),
        other => panic!("unexpected backtrace {:?}", other),
    }

    // マネージドの停止ではレジスタの代わりに引数を返す
    let context = h.engine.api(55, "getContext", &[]);
    assert_eq!(context[0]["value"], json!("7"));
    assert_eq!(h.engine.api(55, "setContextValue", &[json!("rax"), json!(1)]), Value::Null);

    assert_eq!(h.engine.api(55, "release", &[]), json!(true));
    assert!(worker.join().expect("invoking thread panicked"));

    assert_eq!(h.engine.api(0, "deleteHook", &[json!("com.example.Foo.bar")]), json!(true));
    assert!(!h.sim.managed.is_hooked("com.example.Foo", "bar"));
    assert!(!h.sim.managed.invoke(55, "com.example.Foo", "bar", &[], None));
}

#[test]
fn test_hook_unknown_managed_method_fails() {
    let h = setup();
    assert_eq!(h.engine.api(0, "hookJavaMethod", &[json!("com.example.Foo.missing")]), Value::Null);
    assert_eq!(h.engine.api(0, "hookJavaMethod", &[json!("nomethod")]), Value::Null);
    assert!(h.engine.hooks().is_empty());
}

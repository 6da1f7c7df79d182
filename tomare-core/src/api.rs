//! コントローラから名前で呼び出すAPI
//!
//! 停止中のスレッドでは受信箱経由でそのスレッド上で、それ以外では呼び出し元のスレッドで実行されます。
//! 失敗したコマンドはログに残して `null` を返し、エラーをコントローラに伝播しません。

use crate::channel::Command;
use crate::context::ContextProxy;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::event::HookCategory;
use crate::expr::{Condition, HookLogic};
use crate::hooks::HookOptions;
use crate::parse::{from_hex, parse_address, to_hex};
use crate::registry::HookRecord;
use crate::stepping::StepMode;
use crate::watcher::WatchFlags;
use crate::Result;
use serde_json::{json, Value};
use tomare_symbols::DebugSymbol;
use tomare_target::ThreadId;

/// APIのバージョン
pub const API_VERSION: u32 = 1;

/// 1回の読み書きで扱うバイト数の上限
pub const MAX_TRANSFER: usize = 0x100_0000;

/// 1回のAPI呼び出し
struct ApiCall<'a, 'p> {
    thread_id: ThreadId,
    name: &'a str,
    args: &'a [Value],
    proxy: Option<&'a mut ContextProxy<'p>>,
}

impl<'a, 'p> ApiCall<'a, 'p> {
    fn invalid(&self, reason: impl Into<String>) -> anyhow::Error {
        EngineError::invalid_argument(self.name, reason).into()
    }

    fn arg(&self, index: usize) -> Option<&'a Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    /// 数値か16進/10進文字列のアドレス
    fn address(&self, index: usize) -> Result<u64> {
        match self.arg(index) {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| self.invalid(format!("argument {} is not an address: {}", index, n))),
            Some(Value::String(s)) => parse_address(s),
            Some(other) => Err(self.invalid(format!("argument {} is not an address: {}", index, other))),
            None => Err(self.invalid(format!("missing argument {}", index))),
        }
    }

    fn string(&self, index: usize) -> Result<&'a str> {
        self.arg(index)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(format!("argument {} must be a string", index)))
    }

    fn opt_string(&self, index: usize) -> Option<&'a str> {
        self.arg(index).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
    }

    fn size(&self, index: usize) -> Result<usize> {
        let size = self
            .arg(index)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.invalid(format!("argument {} must be a size", index)))?;
        usize::try_from(size)
            .ok()
            .filter(|&n| n <= MAX_TRANSFER)
            .ok_or_else(|| self.invalid(format!("size {:#x} exceeds {:#x} bytes", size, MAX_TRANSFER)))
    }

    /// フックの識別子（数値はネイティブアドレス）
    fn hook_key(&self, index: usize) -> Result<String> {
        match self.arg(index) {
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|addr| format!("{:#x}", addr))
                .ok_or_else(|| self.invalid(format!("argument {} is not a hook key: {}", index, n))),
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.invalid(format!("argument {} must be a hook key", index))),
        }
    }

    fn logic(&self, index: usize) -> Result<Option<HookLogic>> {
        self.opt_string(index)
            .map(|text| HookLogic::parse(text).map_err(|e| self.invalid(format!("logic: {}", e))))
            .transpose()
    }

    /// `{"details": bool, "internal": bool, "condition": str}`
    fn options(&self, index: usize) -> Result<HookOptions> {
        let mut options = HookOptions::default();
        let Some(object) = self.arg(index).and_then(Value::as_object) else {
            return Ok(options);
        };
        if let Some(details) = object.get("details").and_then(Value::as_bool) {
            options.show_details = details;
        }
        if let Some(internal) = object.get("internal").and_then(Value::as_bool) {
            options.internal = internal;
        }
        if let Some(text) = object.get("condition").and_then(Value::as_str) {
            let condition = Condition::parse(text).map_err(|e| self.invalid(format!("condition: {}", e)))?;
            options.condition = Some(condition);
        }
        Ok(options)
    }

    fn proxy(&mut self) -> Result<&mut ContextProxy<'p>> {
        let thread_id = self.thread_id;
        self.proxy
            .as_deref_mut()
            .ok_or_else(|| EngineError::NoNativeContext(thread_id).into())
    }
}

fn hex(value: u64) -> Value {
    Value::String(format!("{:#x}", value))
}

fn summaries<'r>(records: impl Iterator<Item = &'r HookRecord>) -> Value {
    Value::Array(records.map(HookRecord::summary).collect())
}

impl Engine {
    /// コントローラからのAPI呼び出し
    ///
    /// `release` と `step` はスレッドの停止を終わらせるコマンドとして扱います。
    pub fn api(&self, thread_id: ThreadId, name: &str, args: &[Value]) -> Value {
        let command = match name {
            "release" => Command::Release,
            "step" => match StepMode::from_arg(args.first()) {
                Ok(mode) => Command::Step(mode),
                Err(e) => {
                    tracing::warn!("[{}] step: {}", thread_id, e);
                    return Value::Null;
                }
            },
            _ => Command::Call {
                name: name.to_string(),
                args: args.to_vec(),
            },
        };
        self.command(thread_id, command)
    }

    /// 名前付きのAPIを実行する
    pub(crate) fn execute(
        &self,
        thread_id: ThreadId,
        name: &str,
        args: &[Value],
        proxy: Option<&mut ContextProxy<'_>>,
    ) -> Value {
        let mut call = ApiCall {
            thread_id,
            name,
            args,
            proxy,
        };
        match self.dispatch(&mut call) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("[{}] {} failed: {}", thread_id, name, e);
                Value::Null
            }
        }
    }

    fn dispatch(&self, call: &mut ApiCall<'_, '_>) -> Result<Value> {
        let memory = &self.target.memory;
        let value = match call.name {
            "apiVersion" => json!(API_VERSION),

            "getContext" => {
                let proxy = call.proxy()?;
                match proxy.context() {
                    Some(context) => serde_json::to_value(self.register_infos(context, true))?,
                    None => serde_json::to_value(proxy.managed_args())?,
                }
            }
            "setContextValue" => {
                let register = call.string(0)?;
                let value = call.address(1)?;
                call.proxy()?.set(register, value)?;
                json!(true)
            }

            "readBytes" => {
                let address = call.address(0)?;
                let bytes = memory.read(address, call.size(1)?)?;
                json!(to_hex(&bytes))
            }
            "writeBytes" => {
                let address = call.address(0)?;
                let bytes = from_hex(call.string(1)?)?;
                if bytes.len() > MAX_TRANSFER {
                    return Err(call.invalid(format!("{} bytes exceed {:#x}", bytes.len(), MAX_TRANSFER)));
                }
                match memory.write(address, &bytes) {
                    Ok(()) => json!(true),
                    Err(e) => {
                        tracing::warn!("[{}] Failed to write {:#x}: {}", call.thread_id, address, e);
                        json!(false)
                    }
                }
            }
            "readPointer" => {
                let address = call.address(0)?;
                hex(memory.read_pointer(address, self.target.pointer_size()).unwrap_or(0))
            }
            "readString" => {
                let address = call.address(0)?;
                let max_len = call.arg(1).map(|_| call.size(1)).transpose()?;
                json!(self.read_string(address, max_len)?)
            }
            "getAddressTs" => serde_json::to_value(self.telescope(call.address(0)?))?,
            "isValidPointer" => json!(self.is_valid_pointer(call.address(0)?)),
            "getRange" => {
                let address = call.address(0)?;
                match memory.find_range(address).filter(|_| address != 0) {
                    Some(range) => json!({
                        "base": hex(range.base),
                        "size": range.size,
                        "protection": range.protection.to_string(),
                        "file": range.file,
                    }),
                    None => json!([]),
                }
            }

            "getSymbolByAddress" => {
                let address = call.address(0)?;
                let symbol = self
                    .target
                    .symbols
                    .symbol_for(address)
                    .unwrap_or_else(|| DebugSymbol::unknown(address));
                serde_json::to_value(symbol)?
            }
            "getDebugSymbols" => {
                let addresses = call
                    .arg(0)
                    .and_then(Value::as_array)
                    .ok_or_else(|| call.invalid("argument 0 must be a list of addresses"))?;
                let symbols: Vec<DebugSymbol> = addresses
                    .iter()
                    .filter_map(|v| match v {
                        Value::Number(n) => n.as_u64(),
                        Value::String(s) => parse_address(s).ok(),
                        _ => None,
                    })
                    .map(|address| {
                        self.target
                            .symbols
                            .symbol_for(address)
                            .unwrap_or_else(|| DebugSymbol::unknown(address))
                    })
                    .collect();
                serde_json::to_value(symbols)?
            }
            "findSymbol" => serde_json::to_value(self.target.symbols.find_matching(call.string(0)?))?,
            "getInstruction" => {
                let address = call.address(0)?;
                let insn = self.target.decoder.decode(address)?;
                json!({
                    "address": hex(address),
                    "string": insn.to_string(),
                    "mnemonic": insn.mnemonic,
                    "opStr": insn.op_str,
                    "size": insn.size,
                    "groups": insn.groups,
                    "thumb": insn.thumb(),
                    "kind": insn.kind(),
                })
            }
            "nativeBacktrace" => {
                let thread_id = call.thread_id;
                let context = call
                    .proxy()?
                    .context()
                    .ok_or(EngineError::NoNativeContext(thread_id))?;
                serde_json::to_value(self.native_backtrace(context))?
            }

            "hookNative" => {
                let address = call.address(0)?;
                let mut options = call.options(2)?;
                options.logic = call.logic(1)?;
                self.hook_native(address, options)?;
                json!(true)
            }
            "hookJavaMethod" => {
                let mut options = call.options(2)?;
                options.logic = call.logic(1)?;
                self.hook_managed_method(call.string(0)?, options)?;
                json!(true)
            }
            "hookNativeOnLoad" => {
                let options = HookOptions {
                    logic: call.logic(1)?,
                    ..HookOptions::default()
                };
                json!(self.hook_native_on_load(call.string(0)?, options))
            }
            "hookJavaOnLoad" => {
                let options = HookOptions {
                    logic: call.logic(1)?,
                    ..HookOptions::default()
                };
                json!(self.hook_managed_on_load(call.string(0)?, options))
            }
            "deleteHook" => json!(self.delete_hook(&call.hook_key(0)?)),
            "setHookCondition" => {
                let text = call.arg(1).and_then(Value::as_str).unwrap_or("");
                json!(self.set_hook_condition(&call.hook_key(0)?, text))
            }
            "setHookLogic" => {
                let text = call.arg(1).and_then(Value::as_str).unwrap_or("");
                json!(self.set_hook_logic(&call.hook_key(0)?, text))
            }

            "addWatcher" => {
                let address = call.address(0)?;
                let flags = call
                    .arg(1)
                    .and_then(Value::as_u64)
                    .map(|bits| WatchFlags::from_bits_truncate(bits as u8))
                    .unwrap_or_default();
                json!(self.add_watcher(address, flags)?)
            }
            "removeWatcher" => json!(self.remove_watcher(call.address(0)?)),
            "isAddressWatched" => json!(self.is_address_watched(call.address(0)?)),

            "hooks" | "nativeOnLoads" | "javaOnLoads" => {
                let categories: &[HookCategory] = match call.name {
                    "hooks" => &[HookCategory::Native, HookCategory::Java],
                    "nativeOnLoads" => &[HookCategory::NativeOnLoad],
                    _ => &[HookCategory::JavaOnLoad],
                };
                let mut records: Vec<HookRecord> = self
                    .hooks
                    .snapshot()
                    .into_iter()
                    .filter(|r| !r.internal && categories.contains(&r.key.category()))
                    .collect();
                records.sort_by_key(|r| r.key.to_string());
                summaries(records.iter())
            }
            "watchers" => Value::Array(self.watchers.snapshot().iter().map(|w| w.summary()).collect()),

            "stepInfo" => self.step_info(call.thread_id).unwrap_or(Value::Null),
            "stopStep" => json!(self.stop_step(call.thread_id)),

            "resume" => json!(self.resume()),
            "detach" => {
                self.detach();
                json!(true)
            }

            other => return Err(EngineError::UnknownCommand(other.to_string()).into()),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sink::ChannelSink;
    use std::sync::Arc;
    use tomare_target::sim::SimTarget;
    use tomare_target::{Arch, Protection};

    fn setup() -> (SimTarget, Arc<Engine>, std::sync::mpsc::Receiver<crate::event::Event>) {
        let sim = SimTarget::new(Arch::X64);
        sim.memory.map(0x10000, 0x1000, Protection::READ_WRITE);
        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(sim.target(), EngineConfig::default(), Arc::new(sink));
        (sim, engine, events)
    }

    #[test]
    fn test_api_version() {
        let (_sim, engine, _events) = setup();
        assert_eq!(engine.api(1, "apiVersion", &[]), json!(1));
    }

    #[test]
    fn test_unknown_command_is_null() {
        let (_sim, engine, _events) = setup();
        assert_eq!(engine.api(1, "noSuchCommand", &[]), Value::Null);
    }

    #[test]
    fn test_read_and_write_bytes() {
        let (sim, engine, _events) = setup();
        assert_eq!(engine.api(1, "writeBytes", &[json!("0x10010"), json!("c0ffee")]), json!(true));
        assert_eq!(sim.memory.peek(0x10010, 3), vec![0xc0, 0xff, 0xee]);
        assert_eq!(engine.api(1, "readBytes", &[json!(0x10010), json!(3)]), json!("c0ffee"));
        assert_eq!(engine.api(1, "writeBytes", &[json!("0x90000"), json!("00")]), json!(false));
        assert_eq!(engine.api(1, "readBytes", &[json!("0x90000"), json!(1)]), Value::Null);
    }

    #[test]
    fn test_transfer_bounds() {
        let (_sim, engine, _events) = setup();
        let huge = json!(u64::MAX);
        assert_eq!(engine.api(1, "readBytes", &[json!("0x10000"), huge.clone()]), Value::Null);
        assert_eq!(engine.api(1, "readBytes", &[json!("0x10000"), json!(MAX_TRANSFER + 1)]), Value::Null);
        assert_eq!(engine.api(1, "readString", &[json!("0x10000"), huge]), Value::Null);
        // 0x10000 から 0x11000 までしかマップされていない
        assert_eq!(engine.api(1, "readBytes", &[json!("0x10000"), json!(MAX_TRANSFER)]), Value::Null);
    }

    #[test]
    fn test_read_pointer_defaults_to_zero() {
        let (sim, engine, _events) = setup();
        sim.memory.write_u64(0x10020, 0x12345678);
        assert_eq!(engine.api(1, "readPointer", &[json!("0x10020")]), json!("0x12345678"));
        assert_eq!(engine.api(1, "readPointer", &[json!("0x90000")]), json!("0x0"));
    }

    #[test]
    fn test_get_range() {
        let (_sim, engine, _events) = setup();
        let range = engine.api(1, "getRange", &[json!("0x10010")]);
        assert_eq!(range["base"], json!("0x10000"));
        assert_eq!(range["protection"], json!("rw-"));
        assert_eq!(engine.api(1, "getRange", &[json!(0)]), json!([]));
        assert_eq!(engine.api(1, "getRange", &[json!("0x90000")]), json!([]));
    }

    #[test]
    fn test_context_commands_need_suspended_thread() {
        let (_sim, engine, _events) = setup();
        assert_eq!(engine.api(1, "getContext", &[]), Value::Null);
        assert_eq!(engine.api(1, "setContextValue", &[json!("rax"), json!(1)]), Value::Null);
    }

    #[test]
    fn test_release_on_running_thread_is_false() {
        let (_sim, engine, _events) = setup();
        assert_eq!(engine.api(1, "release", &[]), json!(false));
    }

    #[test]
    fn test_resume_only_once() {
        let (_sim, engine, events) = setup();
        assert_eq!(engine.api(1, "resume", &[]), json!(true));
        assert_eq!(engine.api(1, "resume", &[]), json!(false));
        let names: Vec<&str> = events.try_iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["resume"]);
    }

    #[test]
    fn test_hook_listing_hides_internal_hooks() {
        let (sim, engine, _events) = setup();
        sim.memory.map(0x4000, 0x1000, Protection::READ_EXECUTE);
        assert_eq!(engine.api(1, "hookNative", &[json!("0x4000")]), json!(true));
        assert_eq!(
            engine.api(1, "hookNative", &[json!("0x4010"), Value::Null, json!({"internal": true})]),
            json!(true)
        );
        assert_eq!(engine.api(1, "hookNativeOnLoad", &[json!("libfoo")]), json!(true));

        let hooks = engine.api(1, "hooks", &[]);
        assert_eq!(hooks.as_array().unwrap().len(), 1);
        assert_eq!(hooks[0]["key"], json!("0x4000"));
        assert_eq!(engine.api(1, "nativeOnLoads", &[])[0]["key"], json!("libfoo"));
        assert_eq!(engine.api(1, "javaOnLoads", &[]), json!([]));
    }

    #[test]
    fn test_bad_logic_rejects_hook() {
        let (sim, engine, _events) = setup();
        sim.memory.map(0x4000, 0x1000, Protection::READ_EXECUTE);
        assert_eq!(engine.api(1, "hookNative", &[json!("0x4000"), json!("rax +")]), Value::Null);
        assert!(engine.hooks().is_empty());
    }
}

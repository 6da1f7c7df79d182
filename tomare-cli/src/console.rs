//! コントローラのコンソール
//!
//! イベントは専用のスレッドで1行1イベントのJSONとして表示します。
//! `call` と `access` はシミュレーションのターゲットスレッドを別のOSスレッドで動かすため、
//! トラップされたスレッドが停止している間もコンソールからコマンドを送れます。

use crate::command::Command;
use anyhow::Result;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use tomare_core::parse::parse_address;
use tomare_core::{
    ChannelSink, Condition, Engine, EngineConfig, Event, EventSink, HookOptions, JsonLinesSink, Reason,
    ThreadId, WatchFlags,
};
use tomare_symbols::SymbolTable;
use tomare_target::sim::SimTarget;
use tomare_target::{Arch, ModuleInfo, Platform, Protection};
use tracing::debug;

/// 起動時にマップするコード領域
const CODE_BASE: u64 = 0x40_0000;
/// 起動時にマップするデータ領域
const DATA_BASE: u64 = 0x60_0000;
const REGION_SIZE: u64 = 0x1_0000;

pub struct Console {
    sim: Arc<SimTarget>,
    engine: Arc<Engine>,
    /// 最後に停止したスレッド
    current: Arc<Mutex<Option<ThreadId>>>,
    /// スレッドが最後に実行したアドレス（`access` の命令アドレスに使う）
    last_pc: HashMap<ThreadId, u64>,
}

impl Console {
    /// `symbols` のELFはコード領域にロードされたものとしてシンボルを解決する
    pub fn new(arch: Arch, config: EngineConfig, entry: Option<u64>, symbols: Option<&Path>) -> Result<Self> {
        let mut table = SymbolTable::new();
        let module = symbols.map(|path| load_symbols(&mut table, path)).transpose()?;

        let sim = Arc::new(SimTarget::with_symbols(arch, Platform::Linux, table));
        if let Some(module) = module {
            println!("Symbols: {} at {:#x}", module.path, module.base);
            sim.process.add_module(module);
        }
        sim.memory.map(CODE_BASE, REGION_SIZE, Protection::READ_EXECUTE);
        sim.memory.map(DATA_BASE, REGION_SIZE, Protection::READ_WRITE);
        if let Some(entry) = entry {
            sim.process.set_entry_point(entry);
        }

        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(sim.target(), config, Arc::new(sink));
        let current = Arc::new(Mutex::new(None));
        spawn_printer(events, current.clone());

        engine.init()?;
        println!("Simulated {} process", arch);
        println!("  code: {:#x}-{:#x} r-x", CODE_BASE, CODE_BASE + REGION_SIZE);
        println!("  data: {:#x}-{:#x} rw-", DATA_BASE, DATA_BASE + REGION_SIZE);
        println!();

        Ok(Self {
            sim,
            engine,
            current,
            last_pc: HashMap::new(),
        })
    }

    /// REPLループを実行する
    pub fn run(&mut self) -> Result<()> {
        println!("Type 'help' for available commands, 'quit' to exit.");
        println!();

        let mut rl = DefaultEditor::new()?;

        loop {
            let readline = rl.readline("(tomare) ");
            match readline {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line)?;

                    match Command::parse(line) {
                        Some(Command::Quit) => break,
                        Some(command) => {
                            if let Err(e) = self.handle_command(command) {
                                eprintln!("Error: {}", e);
                            }
                        }
                        None => {
                            println!("Unknown command: {}", line);
                            println!("Type 'help' for available commands.");
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    break;
                }
            }
        }

        // 停止中のスレッドを残さない
        self.engine.detach();
        println!("Goodbye!");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<()> {
        debug!("console command: {:?}", command);
        match command {
            Command::Hook { address, condition } => self.handle_hook(&address, condition)?,
            Command::Unhook(key) => print_result("unhook", self.engine.delete_hook(&key)),
            Command::Cond { key, source } => {
                print_result("cond", self.engine.set_hook_condition(&key, &source))
            }
            Command::Logic { key, source } => {
                print_result("logic", self.engine.set_hook_logic(&key, &source))
            }
            Command::Watch { address, flags } => {
                let address = parse_address(&address)?;
                let flags = flags.map(WatchFlags::from_bits_truncate).unwrap_or_default();
                print_result("watch", self.engine.add_watcher(address, flags)?);
            }
            Command::Unwatch(address) => {
                print_result("unwatch", self.engine.remove_watcher(parse_address(&address)?))
            }
            Command::Map {
                address,
                size,
                protection,
            } => {
                let address = parse_address(&address)?;
                let size = parse_address(&size)?;
                self.sim.memory.map(address, size, protection);
                println!("Mapped {:#x}-{:#x} {}", address, address.saturating_add(size), protection);
            }
            Command::Call { tid, address } => self.handle_call(tid, &address)?,
            Command::Access {
                tid,
                address,
                operation,
            } => {
                let address = parse_address(&address)?;
                let from = self.last_pc.get(&tid).copied().unwrap_or(CODE_BASE);
                let sim = self.sim.clone();
                thread::spawn(move || {
                    let outcome = sim.access(tid, from, address, operation);
                    println!("[{}] {} {:#x}: {:?}", tid, operation.as_str(), address, outcome);
                });
            }
            Command::Api { tid, name, args } => print_value(&self.engine.api(tid, &name, &args)),
            Command::Release(tid) => {
                let tid = self.thread(tid)?;
                print_value(&self.engine.release(tid));
            }
            Command::Step { tid, mode } => {
                let tid = self.thread(tid)?;
                let args: Vec<Value> = mode.into_iter().map(Value::String).collect();
                print_value(&self.engine.api(tid, "step", &args));
            }
            Command::Stop(tid) => {
                let tid = self.thread(tid)?;
                print_value(&self.engine.api(tid, "stopStep", &[]));
            }
            Command::Hooks => {
                print_value(&json!({
                    "hooks": self.engine.api(0, "hooks", &[]),
                    "nativeOnLoads": self.engine.api(0, "nativeOnLoads", &[]),
                    "javaOnLoads": self.engine.api(0, "javaOnLoads", &[]),
                    "watchers": self.engine.api(0, "watchers", &[]),
                }));
            }
            Command::Threads => {
                let threads = self.engine.suspended_threads();
                if threads.is_empty() {
                    println!("No suspended threads");
                }
                let current = *self.current.lock();
                for tid in threads {
                    let marker = if current == Some(tid) { "*" } else { " " };
                    println!("{} {}", marker, tid);
                }
            }
            Command::Detach => {
                self.engine.detach();
                println!("Detached");
            }
            Command::Help => print_help(),
            Command::Quit => {}
        }
        Ok(())
    }

    fn handle_hook(&self, address: &str, condition: Option<String>) -> Result<()> {
        let address = parse_address(address)?;
        let condition = condition
            .map(|source| {
                Condition::parse(&source)
                    .map_err(|e| anyhow::anyhow!("Failed to parse condition '{}': {}", source, e))
            })
            .transpose()?;
        let options = HookOptions {
            condition,
            ..HookOptions::default()
        };
        let key = self.engine.hook_native(address, options)?;
        println!("Hook set at {}", key);
        Ok(())
    }

    /// ターゲットスレッドにアドレスを実行させる（停止しても戻るまで待たない）
    fn handle_call(&mut self, tid: ThreadId, address: &str) -> Result<()> {
        let address = parse_address(address)?;
        self.last_pc.insert(tid, address);

        let sim = self.sim.clone();
        thread::spawn(move || {
            let mut context = sim.context_at(address);
            let trapped = sim.call(tid, address, &mut context, Vec::new());
            if trapped {
                println!("[{}] returned from {:#x}", tid, address);
            } else {
                println!("[{}] executed {:#x} (not intercepted)", tid, address);
            }
        });
        Ok(())
    }

    /// 省略されたら最後に停止したスレッド
    fn thread(&self, tid: Option<ThreadId>) -> Result<ThreadId> {
        tid.or(*self.current.lock())
            .ok_or_else(|| anyhow::anyhow!("No suspended thread; pass a thread id"))
    }
}

fn load_symbols(table: &mut SymbolTable, path: &Path) -> Result<ModuleInfo> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("Not a file: {:?}", path))?;
    table.add_module(&name, path, CODE_BASE, REGION_SIZE)?;
    Ok(ModuleInfo {
        name,
        path: path.display().to_string(),
        base: CODE_BASE,
        size: REGION_SIZE,
        entry: None,
    })
}

/// イベントを表示し、最後に停止したスレッドを記録する
fn spawn_printer(events: Receiver<Event>, current: Arc<Mutex<Option<ThreadId>>>) {
    let printer = JsonLinesSink::new(std::io::stdout());
    thread::spawn(move || {
        for event in events {
            match &event {
                Event::SetContext(info) if info.reason != Reason::InitialContext => {
                    *current.lock() = Some(info.tid);
                }
                Event::Release { tid, .. } => {
                    let mut current = current.lock();
                    if *current == Some(*tid) {
                        *current = None;
                    }
                }
                _ => {}
            }
            printer.send(event);
        }
    });
}

fn print_result(what: &str, ok: bool) {
    if ok {
        println!("{}: ok", what);
    } else {
        println!("{}: failed", what);
    }
}

fn print_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                      - Show this help message");
    println!("  quit/exit/q               - Detach and exit");
    println!();
    println!("Hooks:");
    println!("  hook <addr> [condition]   - Hook a native address");
    println!("  unhook <key>              - Delete a hook (address, Class.method, module or class)");
    println!("  cond <key> [expr]         - Replace the condition (empty clears it)");
    println!("  logic <key> [stmts]       - Replace the logic (empty clears it, '-1' continues)");
    println!("  hooks                     - List hooks, onload hooks and watchers");
    println!();
    println!("Memory:");
    println!("  map <addr> <size> [rwx]   - Map memory in the simulated process");
    println!("  watch <addr> [flags]      - Watch an address (1=r 2=w 4=x 8=single shot)");
    println!("  unwatch <addr>            - Stop watching an address");
    println!();
    println!("Threads:");
    println!("  call <tid> <addr>         - Run an address on a target thread");
    println!("  access <tid> <addr> r|w|x - Access memory from a target thread");
    println!("  threads                   - List suspended threads (* = current)");
    println!("  release [tid]             - Resume a suspended thread");
    println!("  step [tid] [block|call]   - Step a suspended thread");
    println!("  stop [tid]                - Stop stepping");
    println!("  api <tid> <name> [json]   - Run a named command on a thread");
    println!("  detach                    - Remove every hook, watcher and step session");
    println!();
    println!("Examples:");
    println!("  hook 0x400000 rdi == 3");
    println!("  call 7 0x400000");
    println!("  api 7 setContextValue [\"rax\", \"0x10\"]");
    println!("  release");
}

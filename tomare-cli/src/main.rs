//! Tomare CLI - コマンドラインインターフェース
//!
//! シミュレーションターゲットに結び付けたエンジンを操作するコントローラのコンソール

mod command;
mod console;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::Console;
use std::path::PathBuf;
use tomare_core::{EngineConfig, WatchBackend};
use tomare_target::Arch;
use tracing_subscriber::EnvFilter;

/// Tomare - In-process execution control engine
#[derive(Parser)]
#[command(name = "tomare")]
#[command(version = "0.1.0")]
#[command(about = "Suspend, inspect and step threads of a running process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArchArg {
    Ia32,
    X64,
    Arm,
    Arm64,
}

impl From<ArchArg> for Arch {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::Ia32 => Arch::Ia32,
            ArchArg::X64 => Arch::X64,
            ArchArg::Arm => Arch::Arm,
            ArchArg::Arm64 => Arch::Arm64,
        }
    }
}

#[derive(Subcommand)]
enum ConsoleCommand {
    /// Drive an engine bound to the simulated target
    Sim {
        /// Architecture of the simulated process
        #[arg(long, value_enum, default_value = "x64")]
        arch: ArchArg,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,

        /// Milliseconds to wait for a suspended thread to answer a command
        #[arg(long, default_value_t = 3000)]
        command_timeout: u64,

        /// Upper bound in milliseconds between inbox checks of a suspended thread
        #[arg(long, default_value_t = 200)]
        poll_interval: u64,

        /// Watch memory with the access monitor instead of page protection
        #[arg(long)]
        access_monitor: bool,

        /// Break at this entry point (as if the process was spawned)
        #[arg(long)]
        entry: Option<String>,

        /// ELF file whose symbols describe the code region
        #[arg(long)]
        symbols: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        ConsoleCommand::Sim {
            arch,
            debug,
            command_timeout,
            poll_interval,
            access_monitor,
            entry,
            symbols,
        } => {
            init_logging(debug);

            let entry = entry
                .as_deref()
                .map(tomare_core::parse::parse_address)
                .transpose()?;
            let config = EngineConfig {
                command_timeout_ms: command_timeout,
                poll_interval_ms: poll_interval,
                watch_backend: access_monitor.then_some(WatchBackend::AccessMonitor),
                break_at_entry: entry.is_some(),
                spawned: entry.is_some(),
                debug,
                ..EngineConfig::default()
            };

            println!("Tomare - In-process execution control engine");
            println!("Version 0.1.0");
            println!();

            let mut console = Console::new(arch.into(), config, entry, symbols.as_deref())?;
            console.run()?;
        }
    }

    Ok(())
}

/// ログ出力を初期化する（`RUST_LOG` が優先）
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

//! 停止したスレッドの状態の収集

use crate::context::ContextProxy;
use crate::engine::Engine;
use crate::event::{Backtrace, ContextInfo, Frame, InstructionInfo, RegisterInfo, Telescope};
use crate::suspension::TrapSite;
use tomare_target::backtrace::{capture_backtrace, MAX_FRAMES};
use tomare_target::CpuContext;

/// 文字列として読む最大バイト数
const MAX_STRING_LEN: usize = 256;

/// 印字可能なASCII文字か
fn is_printable(byte: u8) -> bool {
    byte > 31 && byte < 127
}

impl Engine {
    /// 値を分類する
    pub fn telescope(&self, value: u64) -> Telescope {
        let memory = &self.target.memory;
        if !memory.is_readable(value) {
            return Telescope::Invalid(value);
        }

        if let Ok(bytes) = memory.read_c_string(value, MAX_STRING_LEN) {
            if !bytes.is_empty() && bytes.iter().all(|&b| is_printable(b)) {
                return Telescope::String(String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        match memory.read_pointer(value, self.target.pointer_size()) {
            Ok(pointee) => Telescope::Pointer(pointee),
            Err(_) => Telescope::Value(value),
        }
    }

    /// 読み取り可能でポインタを読み出せるアドレスか
    pub fn is_valid_pointer(&self, address: u64) -> bool {
        let memory = &self.target.memory;
        memory.is_readable(address)
            && memory.read_pointer(address, self.target.pointer_size()).is_ok()
    }

    /// NUL終端文字列を読む
    pub fn read_string(&self, address: u64, max_len: Option<usize>) -> crate::Result<String> {
        let bytes = self
            .target
            .memory
            .read_c_string(address, max_len.unwrap_or(MAX_STRING_LEN))
            .map_err(|e| anyhow::anyhow!("Failed to read string at {:#x}: {}", address, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// フレームポインタをたどったバックトレース
    pub fn native_backtrace(&self, context: &CpuContext) -> Vec<Frame> {
        capture_backtrace(context, self.target.memory.as_ref(), MAX_FRAMES)
            .into_iter()
            .map(|address| Frame {
                address,
                symbol: self.target.symbols.symbol_for(address),
            })
            .collect()
    }

    /// レジスタごとの値と注釈
    ///
    /// pcには命令のメタデータを付け、詳細表示ならシンボルも付けます。
    pub fn register_infos(&self, context: &CpuContext, show_details: bool) -> Vec<RegisterInfo> {
        let pc_register = context.arch().pc_register();
        context
            .registers()
            .map(|(name, value)| {
                let telescope = self.telescope(value);
                let mut info = RegisterInfo {
                    name,
                    value,
                    is_valid_pointer: telescope.code() > 0,
                    telescope,
                    symbol: None,
                    instruction: None,
                };

                if name == pc_register {
                    if show_details {
                        info.symbol = self.target.symbols.symbol_for(value);
                    }
                    match self.target.decoder.decode(value) {
                        Ok(insn) => {
                            info.instruction = Some(InstructionInfo {
                                size: insn.size,
                                thumb: insn.thumb(),
                                groups: insn.groups,
                            })
                        }
                        Err(e) => tracing::debug!("no instruction info at {:#x}: {}", value, e),
                    }
                }
                info
            })
            .collect()
    }

    /// コントローラに送る停止時の状態
    pub(crate) fn context_info(&self, site: &TrapSite, proxy: &ContextProxy<'_>, show_details: bool) -> ContextInfo {
        let mut info = ContextInfo::new(site.thread_id, site.reason);
        info.ptr = site.address;
        info.module = site.module.clone();

        if let Some(call) = &site.managed {
            info.is_java = true;
            info.java_args = Some(call.args.clone());
            info.class_method = Some(call.class_method.clone());
            if let Some(managed) = &self.target.managed {
                info.backtrace = Some(Backtrace::Java(managed.backtrace(site.thread_id)));
            }
        }

        if let Some(context) = proxy.context() {
            info.context = Some(self.register_infos(context, show_details));
            if show_details {
                info.backtrace = Some(Backtrace::Native(self.native_backtrace(context)));
            }
        }
        info
    }
}

//! 停止中スレッドの最上位フレーム

use crate::registers::dwarf_register;
use crate::{Memory, Result};
use conbreak_core::{Address, Frame, ThreadId};
use conbreak_dwarf::{FrameAccess, LineInfo, VariableLocator};
use nix::libc::user_regs_struct;
use std::sync::Arc;

/// 停止時点のレジスタを保持したフレーム
pub struct PtraceFrame {
    tid: ThreadId,
    regs: user_regs_struct,
    load_bias: u64,
    line: Option<LineInfo>,
    memory: Memory,
    locator: Arc<VariableLocator>,
}

impl PtraceFrame {
    pub fn new(
        pid: i32,
        tid: ThreadId,
        regs: user_regs_struct,
        load_bias: u64,
        line: Option<LineInfo>,
        locator: Arc<VariableLocator>,
    ) -> Self {
        Self {
            tid,
            regs,
            load_bias,
            line,
            memory: Memory::new(pid),
            locator,
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

impl Frame for PtraceFrame {
    fn file(&self) -> Option<&str> {
        self.line.as_ref().map(|info| info.file.as_str())
    }

    fn line(&self) -> Option<u32> {
        self.line.as_ref().map(|info| info.line)
    }

    fn resolve_variable(&self, path: &str) -> Option<Address> {
        match self.locator.resolve(self, path) {
            Ok(addr) => addr.map(Address),
            Err(e) => {
                tracing::debug!("[{}] failed to resolve {}: {:#}", self.tid, path, e);
                None
            }
        }
    }
}

impl FrameAccess for PtraceFrame {
    fn pc(&self) -> u64 {
        self.regs.rip
    }

    fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn register(&self, reg: u16) -> Result<u64> {
        dwarf_register(&self.regs, reg).ok_or_else(|| anyhow::anyhow!("Unsupported DWARF register {}", reg))
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.memory.read(addr, size)
    }
}

//! ptrace によるデバッガ基盤
//!
//! [`Process`] のスレッド制御と DWARF 情報を組み合わせて、
//! スケジューラが必要とする [`Substrate`] を実装します。

use crate::frame::PtraceFrame;
use crate::process::{Process, WaitEvent};
use crate::{Registers, Result};
use conbreak_core::{
    AccessKind, BreakpointHandle, EventSink, RaceLocation, SchedulerEvent, StopReason, Substrate, ThreadId,
};
use conbreak_dwarf::{DwarfLoader, LineInfoProvider, LineTable, VariableLocator};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ptrace で制御するデバッグ対象
pub struct PtraceSubstrate {
    process: Process,
    binary: PathBuf,
    load_bias: u64,
    lines: LineTable,
    line_info: LineInfoProvider,
    locator: Arc<VariableLocator>,
}

impl PtraceSubstrate {
    /// 実行可能ファイルを起動する（execve 直後で停止した状態）
    pub fn launch(binary: &Path, args: &[String]) -> Result<Self> {
        let process = Process::spawn(binary, args)?;
        Self::with_process(binary, process)
    }

    /// 実行中のプロセスにアタッチする
    pub fn attach(binary: &Path, pid: i32) -> Result<Self> {
        let process = Process::attach(pid)?;
        Self::with_process(binary, process)
    }

    fn with_process(binary: &Path, process: Process) -> Result<Self> {
        let loader = Arc::new(DwarfLoader::load(binary)?);
        let load_bias = if loader.is_pie() {
            process.memory().load_bias(binary)?
        } else {
            0
        };
        tracing::debug!("load bias of {:?} is 0x{:x}", binary, load_bias);

        let lines = LineTable::new(&loader)?;
        let line_info = LineInfoProvider::new(&loader)?;
        let locator = Arc::new(VariableLocator::new(loader)?);

        Ok(Self {
            process,
            binary: binary.to_path_buf(),
            load_bias,
            lines,
            line_info,
            locator,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn process(&self) -> &Process {
        &self.process
    }
}

impl Substrate for PtraceSubstrate {
    type Frame = PtraceFrame;

    fn arm_breakpoint(&mut self, kind: AccessKind, location: &RaceLocation) -> anyhow::Result<BreakpointHandle> {
        let addresses: Vec<u64> = self
            .lines
            .breakpoint_addresses(&location.file, location.line)
            .into_iter()
            .map(|addr| addr.wrapping_add(self.load_bias))
            .collect();
        if addresses.is_empty() {
            return Err(anyhow::anyhow!("No code found for {} in {:?}", location, self.binary));
        }

        let (id, sites) = self.process.insert_breakpoints(kind, &addresses)?;
        tracing::info!("{} breakpoint at {} -> {} site(s)", kind, location, sites);
        Ok(BreakpointHandle { id, kind, sites })
    }

    fn is_valid(&self) -> bool {
        self.process.is_alive()
    }

    fn is_stopped(&self) -> bool {
        self.process.is_stopped()
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.process.stop_all()
    }

    fn continue_execution(&mut self) -> anyhow::Result<()> {
        if !self.process.is_alive() {
            return Err(anyhow::anyhow!("process {} has exited", self.process.pid()));
        }
        self.process.continue_all()
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.process.thread_ids()
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> bool {
        self.process.set_suspended(thread, true)
    }

    fn resume_thread(&mut self, thread: ThreadId) -> bool {
        self.process.set_suspended(thread, false)
    }

    fn is_suspended(&self, thread: ThreadId) -> bool {
        self.process.thread(thread).is_some_and(|t| t.suspended)
    }

    fn stop_reason(&self, thread: ThreadId) -> StopReason {
        self.process
            .thread(thread)
            .map(|t| t.reason)
            .unwrap_or(StopReason::None)
    }

    fn top_frame(&self, thread: ThreadId) -> Option<PtraceFrame> {
        if self.process.thread(thread).map_or(true, |t| t.running) {
            return None;
        }
        let regs = match Registers::new(thread).read() {
            Ok(regs) => regs,
            Err(e) => {
                tracing::debug!("failed to read registers of {}: {}", thread, e);
                return None;
            }
        };

        let file_pc = regs.rip.wrapping_sub(self.load_bias);
        let line = self.line_info.lookup(file_pc).ok().flatten();
        Some(PtraceFrame::new(
            self.process.pid(),
            thread,
            regs,
            self.load_bias,
            line,
            Arc::clone(&self.locator),
        ))
    }

    fn source_line_text(&self, file: &str, line: u32) -> Option<String> {
        let path = self.lines.find_file(file)?;
        let text = std::fs::read_to_string(path).ok()?;
        text.lines()
            .nth(line.checked_sub(1)? as usize)
            .map(|l| l.trim().to_string())
    }

    fn pump(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        for event in self.process.drain()? {
            let message = match event {
                WaitEvent::Breakpoint { tid, address } => match self.process.breakpoints().kind_at(address) {
                    Some(kind) => SchedulerEvent::BreakpointHit { thread: tid, kind },
                    None => continue,
                },
                WaitEvent::Exited(code) => SchedulerEvent::TargetExited { code },
                other => {
                    tracing::trace!("{:?}", other);
                    continue;
                }
            };
            sink.send(message)
                .map_err(|e| anyhow::anyhow!("event channel closed: {}", e))?;
        }
        Ok(())
    }
}

//! テスト用のスクリプト化されたデバッガ基盤
//!
//! ブレークポイントヒットでプロセス全体が停止し、サスペンドされたスレッドは
//! 継続時も停止したまま、という all-stop デバッガの意味論を模倣します。
#![allow(dead_code)]

use anyhow::bail;
use conbreak_core::{
    AccessKind, Address, BreakpointHandle, EventSink, Frame, RaceDescriptor, RaceLocation, Scheduler,
    SchedulerConfig, SchedulerEvent, SessionLog, StopReason, Substrate, ThreadId,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FakeThread {
    pub running: bool,
    pub suspended: bool,
    pub reason: StopReason,
    pub at: Option<(String, u32)>,
    pub vars: HashMap<String, u64>,
}

pub struct FakeFrame {
    file: String,
    line: u32,
    vars: HashMap<String, u64>,
}

impl Frame for FakeFrame {
    fn file(&self) -> Option<&str> {
        Some(&self.file)
    }

    fn line(&self) -> Option<u32> {
        Some(self.line)
    }

    fn resolve_variable(&self, path: &str) -> Option<Address> {
        self.vars.get(path).copied().map(Address)
    }
}

#[derive(Default)]
pub struct FakeSubstrate {
    pub threads: BTreeMap<ThreadId, FakeThread>,
    pub valid: bool,
    pub armed: Vec<(AccessKind, RaceLocation)>,
    pub stop_failures: u32,
    pub continue_failures: u32,
    pub suspend_failures: u32,
    pub pending: Vec<SchedulerEvent>,
    pub continues: usize,
}

impl FakeSubstrate {
    /// 全スレッドが実行中の状態で作成する
    pub fn new(tids: &[ThreadId]) -> Self {
        let threads = tids
            .iter()
            .map(|tid| {
                (
                    *tid,
                    FakeThread {
                        running: true,
                        suspended: false,
                        reason: StopReason::None,
                        at: None,
                        vars: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            threads,
            valid: true,
            ..Default::default()
        }
    }

    pub fn set_var(&mut self, tid: ThreadId, name: &str, addr: u64) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.vars.insert(name.to_string(), addr);
        }
    }

    /// スレッドがブレークポイントに到達したことにする（プロセス全体が停止する）
    pub fn hit(&mut self, tid: ThreadId, file: &str, line: u32) -> SchedulerEvent {
        for (id, t) in self.threads.iter_mut() {
            if *id == tid {
                t.running = false;
                t.reason = StopReason::Breakpoint;
                t.at = Some((file.to_string(), line));
            } else if t.running {
                t.running = false;
                t.reason = StopReason::None;
            }
        }
        SchedulerEvent::BreakpointHit {
            thread: tid,
            kind: AccessKind::Write,
        }
    }

    /// 基盤の不具合でスレッドが勝手に再開したことにする
    pub fn force_resume(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.suspended = false;
            t.running = true;
            t.reason = StopReason::None;
            t.at = None;
        }
    }

    pub fn running_threads(&self) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|(_, t)| t.running)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Substrate for FakeSubstrate {
    type Frame = FakeFrame;

    fn arm_breakpoint(&mut self, kind: AccessKind, location: &RaceLocation) -> anyhow::Result<BreakpointHandle> {
        self.armed.push((kind, location.clone()));
        Ok(BreakpointHandle {
            id: self.armed.len(),
            kind,
            sites: 1,
        })
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn is_stopped(&self) -> bool {
        self.threads.values().all(|t| !t.running)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.stop_failures > 0 {
            self.stop_failures -= 1;
            bail!("process is transitioning");
        }
        for t in self.threads.values_mut().filter(|t| t.running) {
            t.running = false;
            t.reason = StopReason::Interrupt;
        }
        Ok(())
    }

    fn continue_execution(&mut self) -> anyhow::Result<()> {
        if self.continue_failures > 0 {
            self.continue_failures -= 1;
            bail!("process is transitioning");
        }
        self.continues += 1;
        for t in self.threads.values_mut().filter(|t| !t.suspended && !t.running) {
            t.running = true;
            t.reason = StopReason::None;
            t.at = None;
        }
        Ok(())
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> bool {
        if self.suspend_failures > 0 {
            self.suspend_failures -= 1;
            return false;
        }
        match self.threads.get_mut(&thread) {
            Some(t) => {
                t.suspended = true;
                true
            }
            None => false,
        }
    }

    fn resume_thread(&mut self, thread: ThreadId) -> bool {
        match self.threads.get_mut(&thread) {
            Some(t) => {
                t.suspended = false;
                true
            }
            None => false,
        }
    }

    fn is_suspended(&self, thread: ThreadId) -> bool {
        self.threads.get(&thread).is_some_and(|t| t.suspended)
    }

    fn stop_reason(&self, thread: ThreadId) -> StopReason {
        match self.threads.get(&thread) {
            Some(t) if !t.running => t.reason,
            _ => StopReason::None,
        }
    }

    fn top_frame(&self, thread: ThreadId) -> Option<FakeFrame> {
        let t = self.threads.get(&thread)?;
        let (file, line) = t.at.clone()?;
        Some(FakeFrame {
            file,
            line,
            vars: t.vars.clone(),
        })
    }

    fn pump(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        for event in self.pending.drain(..) {
            sink.send(event)?;
        }
        Ok(())
    }
}

/// `file1.c:10` 書き込み、`file2.c:20` 読み込みのレース
pub fn cross_race() -> RaceDescriptor {
    RaceDescriptor::new(
        RaceLocation::new("file1.c", 10, "counter++;"),
        RaceLocation::new("file2.c", 20, "x = counter;"),
    )
}

/// テスト用の高速な設定
pub fn quick_config() -> SchedulerConfig {
    SchedulerConfig {
        retry_attempts: 3,
        retry_backoff_ms: 1,
        seed: Some(7),
        ..SchedulerConfig::default()
    }
}

/// セッションログ付きのスケジューラ
pub struct Session {
    pub scheduler: Scheduler<FakeSubstrate>,
    pub log_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Session {
    pub fn new(substrate: FakeSubstrate, race: RaceDescriptor, config: SchedulerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("conbreak_out.txt");
        let log = Arc::new(SessionLog::create(&log_path, false).unwrap());
        Self {
            scheduler: Scheduler::new(substrate, race, config, log),
            log_path,
            _dir: dir,
        }
    }

    pub fn armed(substrate: FakeSubstrate, race: RaceDescriptor, config: SchedulerConfig) -> Self {
        let mut session = Self::new(substrate, race, config);
        session.scheduler.arm().unwrap();
        session
    }

    /// スレッドをブレークポイントに到達させ、そのイベントを処理する
    pub fn hit(&mut self, tid: ThreadId, file: &str, line: u32) {
        let event = self.scheduler.substrate_mut().hit(tid, file, line);
        self.scheduler.handle_event(event);
    }

    pub fn log_text(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap()
    }
}

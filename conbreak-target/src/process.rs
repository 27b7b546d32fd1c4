//! プロセス制御機能
//!
//! マルチスレッドのデバッグ対象を ptrace で制御します。
//! スレッドごとの停止・再開状態を管理し、プロセス全体の停止（all-stop）と
//! ブレークポイントをまたいだ再開を提供します。

use crate::breakpoint::BreakpointTable;
use crate::thread::Thread;
use crate::{Memory, Registers, Result};
use conbreak_core::{AccessKind, BreakpointId, StopReason, ThreadId};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;

/// ブレークポイントをまたぐシングルステップの最大試行回数
const MAX_STEP_ATTEMPTS: usize = 8;

/// 1回の poll で処理する待機イベントの上限
const MAX_EVENTS_PER_POLL: usize = 64;

/// プロセスの由来
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// デバッガが起動した
    Spawned,
    /// 既存のプロセスにアタッチした
    Attached,
}

/// 待機で得られたイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    /// スレッドがブレークポイントで停止した（PCはブレークポイントのアドレスに戻してある）
    Breakpoint { tid: ThreadId, address: u64 },
    /// 新しいスレッドが作られた
    ThreadCreated(ThreadId),
    /// スレッドが終了した
    ThreadExited(ThreadId),
    /// その他の停止（シグナル、停止要求）
    Stopped(ThreadId),
    /// プロセスが終了した
    Exited(i32),
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    origin: Origin,
    memory: Memory,
    threads: BTreeMap<ThreadId, Thread>,
    breakpoints: BreakpointTable,
    /// デバッガがプロセス全体を止めている（一時的な停止から自動で再開しない）
    held: bool,
    exit_code: Option<i32>,
}

impl Process {
    fn new(pid: Pid, origin: Origin) -> Self {
        Self {
            pid,
            origin,
            memory: Memory::new(pid.as_raw()),
            threads: BTreeMap::new(),
            breakpoints: BreakpointTable::new(),
            held: true,
            exit_code: None,
        }
    }

    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスは execve 直後で停止した状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Stopped(_, _) => {
                    ptrace::setoptions(child, Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL)?;
                    let mut process = Self::new(child, Origin::Spawned);
                    process.threads.insert(child.as_raw(), Thread::new(child.as_raw()));
                    tracing::info!("spawned {} as pid {}", program_path, child);
                    Ok(process)
                }
                status => Err(anyhow::anyhow!("Unexpected wait status after execve: {:?}", status)),
            },
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execve(&program_cstring, &cstring_args, &env);
                }
                // execve が失敗した場合はここに到達
                unsafe { nix::libc::_exit(127) }
            }
        }
    }

    /// 既存のプロセスの全スレッドにアタッチする
    ///
    /// アタッチ中に作られたスレッドも拾うため、スレッド一覧が変わらなくなるまで繰り返します。
    pub fn attach(pid: i32) -> Result<Self> {
        let mut process = Self::new(Pid::from_raw(pid), Origin::Attached);

        loop {
            let fresh: Vec<ThreadId> = list_tasks(pid)?
                .into_iter()
                .filter(|tid| !process.threads.contains_key(tid))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for tid in fresh {
                let task = Pid::from_raw(tid);
                if let Err(e) = ptrace::attach(task) {
                    tracing::debug!("failed to attach thread {}: {}", tid, e);
                    continue;
                }

                let mut thread = Thread::new(tid);
                match waitpid(task, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
                    WaitStatus::Stopped(_, signal) => {
                        thread.pending_sigstop = true;
                        thread.pending_signal = Some(signal);
                    }
                    status => {
                        tracing::debug!("thread {} did not stop after attach: {:?}", tid, status);
                        continue;
                    }
                }
                ptrace::setoptions(task, Options::PTRACE_O_TRACECLONE)?;
                process.threads.insert(tid, thread);
            }
        }

        if process.threads.is_empty() {
            return Err(anyhow::anyhow!("Failed to attach to any thread of pid {}", pid));
        }
        tracing::info!("attached to pid {} ({} threads)", pid, process.threads.len());
        Ok(process)
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// プロセスがまだ終了していないか
    pub fn is_alive(&self) -> bool {
        self.exit_code.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// 実行中のスレッドが1つもないか
    pub fn is_stopped(&self) -> bool {
        self.threads.values().all(|t| !t.running)
    }

    /// 生存しているスレッドの一覧
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    /// スレッドのサスペンド状態を変更する
    pub fn set_suspended(&mut self, tid: ThreadId, suspended: bool) -> bool {
        match self.threads.get_mut(&tid) {
            Some(thread) => {
                thread.suspended = suspended;
                true
            }
            None => false,
        }
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// 実行時アドレスにブレークポイントを設置する
    pub fn insert_breakpoints(&mut self, kind: AccessKind, addresses: &[u64]) -> Result<(BreakpointId, usize)> {
        self.breakpoints.insert(&self.memory, kind, addresses)
    }

    /// 溜まっている待機イベントを1つ取り出す（ブロックしない）
    pub fn poll(&mut self) -> Result<Option<WaitEvent>> {
        if !self.is_alive() {
            return Ok(None);
        }

        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
        let status = match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => status,
            Err(Errno::ECHILD) => {
                tracing::warn!("no traced threads left for pid {}", self.pid);
                self.exit_code = Some(0);
                self.threads.clear();
                return Ok(Some(WaitEvent::Exited(0)));
            }
            Err(e) => return Err(e.into()),
        };
        self.handle(status)
    }

    /// 溜まっている待機イベントをまとめて取り出す
    pub fn drain(&mut self) -> Result<Vec<WaitEvent>> {
        let mut events = Vec::new();
        while events.len() < MAX_EVENTS_PER_POLL {
            match self.poll()? {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(events)
    }

    /// プロセス全体を停止する
    ///
    /// 実行中のスレッドに SIGSTOP を送り、すべてが停止するまで待ちます。
    /// この間にブレークポイントで停止したスレッドは停止理由が Breakpoint になります。
    pub fn stop_all(&mut self) -> Result<()> {
        self.held = true;

        let targets: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.running && !t.pending_sigstop)
            .map(|t| t.tid())
            .collect();
        for tid in targets {
            match tgkill(self.pid, tid, Signal::SIGSTOP) {
                Ok(()) => {
                    if let Some(thread) = self.threads.get_mut(&tid) {
                        thread.pending_sigstop = true;
                    }
                }
                Err(e) => tracing::debug!("failed to interrupt thread {}: {}", tid, e),
            }
        }

        while let Some(tid) = self.threads.values().find(|t| t.running).map(|t| t.tid()) {
            if !self.is_alive() {
                break;
            }
            self.wait_thread(tid)?;
        }
        Ok(())
    }

    /// サスペンドされていない停止中スレッドをすべて再開する
    ///
    /// ブレークポイント上で止まっているスレッドは、先にその命令を1つ実行させてから再開します。
    pub fn continue_all(&mut self) -> Result<()> {
        let ready = self.ready_threads();

        for &tid in &ready {
            self.step_over_breakpoint(tid)?;
        }

        self.held = false;
        for tid in ready {
            let resumable = self
                .threads
                .get(&tid)
                .is_some_and(|t| !t.running && !t.suspended);
            if resumable {
                self.resume_raw(tid)?;
            }
        }
        Ok(())
    }

    /// 継続時に再開されるスレッド（停止中かつサスペンドされていない）
    fn ready_threads(&self) -> Vec<ThreadId> {
        self.threads
            .values()
            .filter(|t| !t.running && !t.suspended)
            .map(|t| t.tid())
            .collect()
    }

    /// 待機ステータスを解釈してスレッド状態を更新する
    fn handle(&mut self, status: WaitStatus) -> Result<Option<WaitEvent>> {
        match status {
            WaitStatus::Exited(pid, code) => Ok(Some(self.on_exit(pid.as_raw(), code))),
            WaitStatus::Signaled(pid, signal, _) => Ok(Some(self.on_exit(pid.as_raw(), 128 + signal as i32))),
            WaitStatus::PtraceEvent(pid, _, event) if event == nix::libc::PTRACE_EVENT_CLONE => {
                let tid = pid.as_raw();
                let new_tid = ptrace::getevent(pid)? as ThreadId;
                // 新しいスレッドは SIGSTOP で停止した状態から始まる
                self.threads.entry(new_tid).or_insert_with(|| {
                    let mut thread = Thread::new(new_tid);
                    thread.running = true;
                    thread.pending_sigstop = true;
                    thread
                });
                tracing::debug!("thread {} created by {}", new_tid, tid);

                self.mark_stopped(tid, StopReason::None);
                self.resume_if_free(tid)?;
                Ok(Some(WaitEvent::ThreadCreated(new_tid)))
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                let tid = pid.as_raw();
                let registers = Registers::new(tid);
                let address = registers.get_pc()?.wrapping_sub(1);
                if self.breakpoints.is_enabled_at(address) {
                    registers.set_pc(address)?;
                    self.mark_stopped(tid, StopReason::Breakpoint);
                    return Ok(Some(WaitEvent::Breakpoint { tid, address }));
                }

                self.mark_stopped(tid, StopReason::Signal(Signal::SIGTRAP as i32));
                self.resume_if_free(tid)?;
                Ok(Some(WaitEvent::Stopped(tid)))
            }
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => {
                let tid = pid.as_raw();
                // clone イベントより先に新しいスレッドの停止が届くことがある
                self.threads.entry(tid).or_insert_with(|| Thread::new(tid)).pending_sigstop = false;
                self.mark_stopped(tid, StopReason::Interrupt);
                self.resume_if_free(tid)?;
                Ok(Some(WaitEvent::Stopped(tid)))
            }
            WaitStatus::Stopped(pid, signal) => {
                let tid = pid.as_raw();
                tracing::debug!("thread {} received {:?}", tid, signal);
                self.threads.entry(tid).or_insert_with(|| Thread::new(tid)).pending_signal = Some(signal);
                self.mark_stopped(tid, StopReason::Signal(signal as i32));
                self.resume_if_free(tid)?;
                Ok(Some(WaitEvent::Stopped(tid)))
            }
            other => {
                tracing::trace!("ignoring wait status {:?}", other);
                Ok(None)
            }
        }
    }

    fn on_exit(&mut self, tid: ThreadId, code: i32) -> WaitEvent {
        if tid == self.pid.as_raw() {
            tracing::info!("pid {} exited with status {}", tid, code);
            self.exit_code = Some(code);
            self.threads.clear();
            WaitEvent::Exited(code)
        } else {
            self.threads.remove(&tid);
            WaitEvent::ThreadExited(tid)
        }
    }

    fn mark_stopped(&mut self, tid: ThreadId, reason: StopReason) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.mark_stopped(reason);
        }
    }

    /// プロセスが止められていなければ、一時的に停止したスレッドを再開する
    fn resume_if_free(&mut self, tid: ThreadId) -> Result<()> {
        if self.held {
            return Ok(());
        }
        let free = self
            .threads
            .get(&tid)
            .is_some_and(|t| !t.running && !t.suspended);
        if free {
            self.resume_raw(tid)?;
        }
        Ok(())
    }

    fn resume_raw(&mut self, tid: ThreadId) -> Result<()> {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return Ok(());
        };
        let signal = thread.mark_running();
        match ptrace::cont(Pid::from_raw(tid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                // 終了処理中のスレッド（終了イベントは後で届く）
                tracing::debug!("thread {} vanished while resuming", tid);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to resume thread {}: {}", tid, e)),
        }
    }

    /// 特定のスレッドのイベントを1つ待つ
    fn wait_thread(&mut self, tid: ThreadId) -> Result<()> {
        match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL)) {
            Ok(status) => {
                self.handle(status)?;
                Ok(())
            }
            Err(Errno::ECHILD) => {
                self.threads.remove(&tid);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn step_over_breakpoint(&mut self, tid: ThreadId) -> Result<()> {
        let pc = Registers::new(tid).get_pc()?;
        if !self.breakpoints.is_enabled_at(pc) {
            return Ok(());
        }

        self.breakpoints.disable_at(&self.memory, pc)?;
        let stepped = self.single_step(tid);
        self.breakpoints.enable_at(&self.memory, pc)?;
        stepped
    }

    fn single_step(&mut self, tid: ThreadId) -> Result<()> {
        let task = Pid::from_raw(tid);

        for _ in 0..MAX_STEP_ATTEMPTS {
            ptrace::step(task, None)?;
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.running = true;
            }

            match waitpid(task, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    if let Some(thread) = self.threads.get_mut(&tid) {
                        thread.running = false;
                    }
                    return Ok(());
                }
                WaitStatus::Stopped(_, signal) => {
                    // シグナル配送で止まった（命令は実行されていない）のでやり直す
                    if let Some(thread) = self.threads.get_mut(&tid) {
                        thread.running = false;
                        if signal == Signal::SIGSTOP && thread.pending_sigstop {
                            thread.pending_sigstop = false;
                        } else {
                            thread.pending_signal = Some(signal);
                        }
                    }
                }
                status => {
                    self.handle(status)?;
                    if !self.threads.contains_key(&tid) {
                        return Ok(());
                    }
                }
            }
        }
        Err(anyhow::anyhow!("Failed to step thread {} over breakpoint", tid))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !self.is_alive() {
            return;
        }

        match self.origin {
            Origin::Spawned => {
                let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
                let _ = waitpid(self.pid, None);
            }
            Origin::Attached => {
                let _ = self.stop_all();
                if let Err(e) = self.breakpoints.disable_all(&self.memory) {
                    tracing::warn!("failed to remove breakpoints: {}", e);
                }
                for tid in self.thread_ids() {
                    let _ = ptrace::detach(Pid::from_raw(tid), None);
                }
                // 受け取られなかった SIGSTOP でグループ停止したままにしない
                let _ = nix::sys::signal::kill(self.pid, Signal::SIGCONT);
            }
        }
    }
}

/// スレッドを指定してシグナルを送る
fn tgkill(pid: Pid, tid: ThreadId, signal: Signal) -> Result<()> {
    let ret = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_tgkill,
            pid.as_raw(),
            tid,
            signal as nix::libc::c_int,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// `/proc/pid/task` からスレッドIDを列挙する
fn list_tasks(pid: i32) -> Result<Vec<ThreadId>> {
    let dir = format!("/proc/{}/task", pid);
    let entries = std::fs::read_dir(&dir).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", dir, e))?;

    let mut tids = Vec::new();
    for entry in entries {
        if let Some(tid) = entry?.file_name().to_str().and_then(|name| name.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_own_tasks() {
        let tids = list_tasks(std::process::id() as i32).unwrap();
        assert!(tids.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn test_attach_to_missing_process_fails() {
        assert!(Process::attach(i32::MAX).is_err());
    }

    /// ptrace を使わずにスレッド表だけを組み立てる
    fn process_with(tids: &[ThreadId]) -> Process {
        let mut process = Process::new(Pid::from_raw(i32::MAX), Origin::Spawned);
        for &tid in tids {
            process.threads.insert(tid, Thread::new(tid));
        }
        process
    }

    #[test]
    fn test_held_process_keeps_threads_stopped() {
        let mut process = process_with(&[1]);
        assert!(process.held);

        process.mark_stopped(1, StopReason::Interrupt);
        process.resume_if_free(1).unwrap();
        let thread = process.thread(1).unwrap();
        assert!(!thread.running);
        assert_eq!(thread.reason, StopReason::Interrupt);
    }

    #[test]
    fn test_ready_threads_skip_suspended_and_running() {
        let mut process = process_with(&[1, 2, 3]);
        assert!(process.set_suspended(2, true));
        process.threads.get_mut(&3).unwrap().running = true;

        assert_eq!(process.ready_threads(), vec![1]);
        assert!(!process.is_stopped());
        assert!(!process.set_suspended(9, true));
    }

    #[test]
    fn test_breakpoint_stop_survives_all_stop() {
        let mut process = process_with(&[1, 2]);
        process.mark_stopped(1, StopReason::Breakpoint);
        // stop_all の SIGSTOP が後から届いても停止理由は変わらない
        process.mark_stopped(1, StopReason::Interrupt);
        process.mark_stopped(2, StopReason::Interrupt);

        assert_eq!(process.thread(1).unwrap().reason, StopReason::Breakpoint);
        assert_eq!(process.thread(2).unwrap().reason, StopReason::Interrupt);
        assert!(process.is_stopped());

        // サスペンドされたスレッドは継続対象から外れ、停止理由も保たれる
        process.set_suspended(1, true);
        assert_eq!(process.ready_threads(), vec![2]);
        assert_eq!(process.thread(1).unwrap().reason, StopReason::Breakpoint);
    }

    #[test]
    fn test_worker_exit_removes_thread() {
        let mut process = process_with(&[i32::MAX, 7]);
        assert_eq!(process.on_exit(7, 0), WaitEvent::ThreadExited(7));
        assert_eq!(process.thread_ids(), vec![i32::MAX]);
        assert!(process.is_alive());
    }

    #[test]
    fn test_main_thread_exit_ends_process() {
        let mut process = process_with(&[i32::MAX, 7]);
        assert_eq!(process.on_exit(i32::MAX, 3), WaitEvent::Exited(3));
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(3));
        assert!(process.thread_ids().is_empty());
        assert_eq!(process.poll().unwrap(), None);
    }
}

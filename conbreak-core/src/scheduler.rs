//! スケジューラ本体（Scheduler Controller）
//!
//! ブレークポイントヒットとタイマーティックを1つずつ処理する状態機械です。
//! レジストリ・実行中フラグ・セッション状態は1つの粗粒度ロックで保護し、
//! 最終活動時刻は [`ActivityClock`] の独立したロックで保護します。
//!
//! 状態遷移: `Idle → Armed → Running → Halted → Terminated`

use crate::retry::{retry, succeeded};
use crate::{
    AccessKind, ActivityClock, AddressResolver, BreakpointHandle, Conflict, EventSink, Frame,
    MatchEngine, NotReproduced, ParkedAccess, ParkedRegistry, RaceDescriptor, ResolutionError,
    Result, RetryPolicy, SchedulerConfig, SchedulerError, SchedulerEvent, SessionLog, StopReason,
    Substrate, ThreadId, TokenResolver, Verdict, Watchdog,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// イベント待ちの間隔（この間隔でネイティブ通知をポーリングする）
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

const HALT_BANNER: [&str; 3] = [
    "**************************************************************",
    "**************************** HALT ****************************",
    "**************************************************************",
];

/// セッション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// ブレークポイント設置前
    Idle,
    /// ブレークポイント設置済み、まだ1度も発火していない
    Armed,
    /// 実行中（ウォッチドッグがスレッドを解放してよい）
    Running,
    /// 一致を検出し、後始末中
    Halted,
    /// 終了（以後の状態遷移はない）
    Terminated,
}

/// 未登録スレッドの処理結果
enum Settled {
    /// 一致を検出してセッションを終了した
    Halted,
    /// 新たに登録したスレッド数
    Parked(usize),
}

/// 粗粒度ロックで保護される状態
#[derive(Debug)]
struct ControlState {
    registry: ParkedRegistry,
    /// コールバック処理中は `false`
    running: bool,
    phase: SessionState,
    verdict: Option<Verdict>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            registry: ParkedRegistry::new(),
            running: false,
            phase: SessionState::Idle,
            verdict: None,
        }
    }
}

/// 他スレッドからセッション状態を観測するためのハンドル
#[derive(Debug, Clone)]
pub struct SessionStatus {
    inner: Arc<Mutex<ControlState>>,
}

impl SessionStatus {
    pub fn state(&self) -> SessionState {
        self.inner.lock().phase
    }

    /// 停止中スレッドの一覧
    pub fn parked_threads(&self) -> Vec<ThreadId> {
        self.inner.lock().registry.thread_ids()
    }

    pub fn parked_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.inner.lock().verdict.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }
}

/// スケジューラ
pub struct Scheduler<S: Substrate> {
    substrate: S,
    race: RaceDescriptor,
    config: SchedulerConfig,
    engine: MatchEngine,
    resolver: Box<dyn AddressResolver>,
    control: Arc<Mutex<ControlState>>,
    clock: ActivityClock,
    log: Arc<SessionLog>,
    retry: RetryPolicy,
    rng: StdRng,
    events_tx: EventSink,
    events_rx: Receiver<SchedulerEvent>,
    watchdog: Option<Watchdog>,
}

impl<S: Substrate> Scheduler<S> {
    /// スケジューラを作成する
    pub fn new(substrate: S, race: RaceDescriptor, config: SchedulerConfig, log: Arc<SessionLog>) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            substrate,
            engine: MatchEngine::new(race.shared_site()),
            race,
            retry: config.retry_policy(),
            config,
            resolver: Box::new(TokenResolver),
            control: Arc::new(Mutex::new(ControlState::new())),
            clock: ActivityClock::new(),
            log,
            rng,
            events_tx,
            events_rx,
            watchdog: None,
        }
    }

    /// アドレス解決の戦略を差し替える
    pub fn with_resolver(mut self, resolver: Box<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    pub fn race(&self) -> &RaceDescriptor {
        &self.race
    }

    pub fn clock(&self) -> &ActivityClock {
        &self.clock
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// セッション状態のハンドル
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            inner: Arc::clone(&self.control),
        }
    }

    pub fn state(&self) -> SessionState {
        self.control.lock().phase
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.control.lock().verdict.clone()
    }

    /// 外部からイベントを投入するための送信側
    pub fn event_sink(&self) -> EventSink {
        self.events_tx.clone()
    }

    /// 設置済みのブレークポイントで対象を走らせる
    ///
    /// 他の継続操作と同じくリトライします。
    pub fn start(&mut self) -> Result<()> {
        let phase = self.state();
        if phase != SessionState::Armed {
            return Err(SchedulerError::State(format!("cannot start target in {:?} state", phase)));
        }
        self.continue_process()
    }

    /// ブレークポイントを設置し、ウォッチドッグを起動する
    pub fn arm(&mut self) -> Result<Vec<BreakpointHandle>> {
        let lock = Arc::clone(&self.control);
        let mut control = lock.lock();
        if control.phase != SessionState::Idle {
            return Err(SchedulerError::State(format!(
                "cannot arm breakpoints in {:?} state",
                control.phase
            )));
        }

        self.log.line("Setting breakpoints...");
        self.log.line(&self.race.write);
        self.log.line(&self.race.read);

        let mut handles = vec![self.substrate.arm_breakpoint(AccessKind::Write, &self.race.write)?];
        if self.engine.shared_site() {
            self.log.warn("READ & WRITE ARE THE SAME!");
        } else {
            handles.push(self.substrate.arm_breakpoint(AccessKind::Read, &self.race.read)?);
        }
        for handle in &handles {
            tracing::debug!("{} breakpoint {} armed at {} site(s)", handle.kind, handle.id, handle.sites);
        }

        self.clock.touch();
        let watchdog = Watchdog::spawn(self.config.tick_interval(), self.events_tx.clone())
            .map_err(|e| SchedulerError::Substrate(anyhow::Error::new(e).context("failed to spawn watchdog")))?;
        self.watchdog = Some(watchdog);
        control.phase = SessionState::Armed;

        self.log.line("Breakpoint initialization done!");
        Ok(handles)
    }

    /// セッションが終了するまでイベントループを回す
    pub fn run(&mut self) -> Result<Verdict> {
        if self.state() == SessionState::Idle {
            return Err(SchedulerError::State("run() called before arm()".to_string()));
        }

        loop {
            if let Some(verdict) = self.verdict() {
                return Ok(verdict);
            }

            if let Err(e) = self.substrate.pump(&self.events_tx) {
                self.fail(SchedulerError::Substrate(e));
                continue;
            }

            match self.events_rx.recv_timeout(PUMP_INTERVAL) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SchedulerError::State("event channel closed".to_string()));
                }
            }
        }
    }

    /// イベントを1つ処理する
    ///
    /// 処理中のエラーは失敗判定としてセッションを終了させます。
    pub fn handle_event(&mut self, event: SchedulerEvent) {
        let result = match event {
            SchedulerEvent::BreakpointHit { thread, kind } => self.on_breakpoint_hit(thread, kind),
            SchedulerEvent::TimerTick => self.on_timer_tick(),
            SchedulerEvent::TargetExited { code } => {
                self.terminate(Verdict::NotReproduced(NotReproduced::TargetExited(code)));
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn fail(&mut self, error: SchedulerError) {
        self.log.error(&error);
        self.terminate(Verdict::Failed(error.to_string()));
    }

    /// セッションを終了する
    ///
    /// 2回目以降の呼び出しは何もせず `false` を返します。
    pub fn terminate(&mut self, verdict: Verdict) -> bool {
        let lock = Arc::clone(&self.control);
        let mut control = lock.lock();
        self.finish(&mut control, verdict)
    }

    fn finish(&mut self, control: &mut ControlState, verdict: Verdict) -> bool {
        if control.phase == SessionState::Terminated {
            return false;
        }

        control.phase = SessionState::Terminated;
        control.running = false;
        self.log.line(format!("####### {} #######", verdict.log_line()));
        tracing::info!("session finished: {}", verdict);
        control.verdict = Some(verdict);

        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }
        self.log.close();
        true
    }

    /// ブレークポイントヒットの処理
    fn on_breakpoint_hit(&mut self, thread: ThreadId, kind: AccessKind) -> Result<()> {
        let lock = Arc::clone(&self.control);
        let mut control = lock.lock();
        match control.phase {
            SessionState::Armed | SessionState::Running => {}
            phase => {
                tracing::debug!("ignoring breakpoint hit of {} in {:?} state", thread, phase);
                return Ok(());
            }
        }

        // 先行するコールバックで処理済みのスレッドからの重複通知
        if control.registry.contains(thread) && self.substrate.is_suspended(thread) {
            tracing::debug!("thread {} already parked, dropping duplicate hit", thread);
            return Ok(());
        }

        self.log.info(format!("{} THREAD {} IS TRIGGERED", kind, thread));
        self.clock.touch();

        self.stop_process()?;
        control.running = false;

        if let Settled::Halted = self.settle(&mut control, true)? {
            return Ok(());
        }

        control.running = true;
        if control.phase == SessionState::Armed {
            control.phase = SessionState::Running;
        }
        self.continue_process()
    }

    /// ブレークポイントで停止している未登録スレッドをすべて登録する
    ///
    /// プロセスを継続する前に必ず呼びます。`from_callback` が `false` のとき
    /// （タイマーティックから呼ばれたとき）は未登録スレッドが0でも警告しません。
    fn settle(&mut self, control: &mut ControlState, from_callback: bool) -> Result<Settled> {
        self.reconcile(control);

        let untracked = self.untracked_threads(control, from_callback);
        let count = untracked.len();
        for tid in untracked {
            if !from_callback {
                self.log.info(format!("PENDING THREAD {} IS TRIGGERED", tid));
            }
            self.suspend_thread(tid)?;
            if self.park(control, tid)? {
                return Ok(Settled::Halted);
            }
        }
        Ok(Settled::Parked(count))
    }

    /// 予期せず再開していたスレッドのエントリを取り除く
    fn reconcile(&mut self, control: &mut ControlState) {
        let alive: BTreeSet<ThreadId> = self.substrate.threads().into_iter().collect();
        let substrate = &self.substrate;
        let stale = control
            .registry
            .discard_if(|entry| !alive.contains(&entry.thread) || !substrate.is_suspended(entry.thread));

        for entry in stale {
            self.log.warn(format!("{} Unexpectedly resumed.", entry.thread));
        }
    }

    /// ブレークポイントで停止しているが未登録のスレッド
    fn untracked_threads(&self, control: &ControlState, from_callback: bool) -> Vec<ThreadId> {
        let stopped: Vec<ThreadId> = self
            .substrate
            .threads()
            .into_iter()
            .filter(|tid| self.substrate.stop_reason(*tid) == StopReason::Breakpoint)
            .collect();
        let untracked: Vec<ThreadId> = stopped
            .iter()
            .copied()
            .filter(|tid| !control.registry.contains(*tid))
            .collect();

        match untracked.len() {
            _ if !from_callback => {}
            1 => {}
            0 => {
                self.log.warn("No breakpoints are hit in CALLBACK!");
                self.log.line(format!("{:?}", stopped));
            }
            _ => {
                self.log.warn("Multiple breakpoints are hit in CALLBACK!");
                self.log.line(format!("{:?}", untracked));
            }
        }
        untracked
    }

    /// 停止したスレッドのアドレスを解決し、一致判定して登録する
    ///
    /// 一致してセッションが終了した場合は `true` を返します。
    fn park(&mut self, control: &mut ControlState, thread: ThreadId) -> Result<bool> {
        let frame = self
            .substrate
            .top_frame(thread)
            .ok_or(ResolutionError::InvalidFrame { thread })?;

        // どちらのブレークポイントが発火したかではなく、実際の停止行で判定する
        let kind = self
            .race
            .kind_at(frame.file(), frame.line())
            .ok_or(ResolutionError::UnknownStopLine {
                thread,
                line: frame.line(),
            })?;
        let location = self.race.location(kind);
        let addresses = self.resolver.resolve(&frame, &location.source_text)?;
        let access = ParkedAccess::new(thread, kind, location.line, addresses);

        for addr in &access.addresses {
            self.log.timed(format!("{}:  [{}] Checking {}...", kind, thread, addr));
        }

        let conflicts = self.engine.find_conflicts(&control.registry, &access);
        if !conflicts.is_empty() {
            self.halt(control, &access, conflicts)?;
            return Ok(true);
        }

        self.clock.touch();
        control.registry.insert(access);
        self.log.info(format!("RECORD THREAD {}", thread));

        if self.all_threads_suspended() && self.release_random(control)? {
            self.clock.touch();
        }
        Ok(false)
    }

    /// 一致を検出したときの後始末
    fn halt(&mut self, control: &mut ControlState, access: &ParkedAccess, conflicts: Vec<Conflict>) -> Result<()> {
        self.log
            .line(format!(">>>>>>>>>> {}:  [{}] Found match!", access.kind, access.thread));

        let mut keep = BTreeSet::from([access.thread]);
        for conflict in &conflicts {
            self.log.line(format!(
                "addr={}  tid1={}  tid2={}",
                conflict.address, conflict.thread, access.thread
            ));
            keep.insert(conflict.thread);
        }
        for line in HALT_BANNER {
            self.log.line(line);
        }

        control.phase = SessionState::Halted;
        control.running = false;

        self.resume_threads_except(&keep)?;
        control.registry.discard_if(|entry| !keep.contains(&entry.thread));
        self.stop_process()?;

        self.finish(
            control,
            Verdict::MatchFound {
                thread: access.thread,
                conflicts,
            },
        );
        Ok(())
    }

    /// タイマーティックの処理
    fn on_timer_tick(&mut self) -> Result<()> {
        let lock = Arc::clone(&self.control);
        let mut control = lock.lock();

        if control.running {
            let idle = control.registry.is_empty() && !self.substrate.is_stopped();
            if !idle && self.clock.elapsed() > self.config.stability_window() {
                control.running = false;
                self.stop_process()?;

                // イベントがまだ届いていないブレークポイント停止を先に処理する
                match self.settle(&mut control, false)? {
                    Settled::Halted => return Ok(()),
                    Settled::Parked(0) => {
                        if self.release_random(&mut control)? {
                            self.clock.touch();
                        }
                    }
                    Settled::Parked(_) => {}
                }
                control.running = true;
                self.continue_process()?;
            }

            if control.registry.is_empty() && self.clock.elapsed() > self.config.kill_timeout() {
                let verdict = Verdict::NotReproduced(NotReproduced::NoBreakpointActivity(
                    self.config.kill_timeout(),
                ));
                self.finish(&mut control, verdict);
            }
        } else if control.phase == SessionState::Armed
            && !self.config.interactive
            && self.clock.elapsed() > self.config.startup_timeout()
        {
            let verdict = Verdict::NotReproduced(NotReproduced::StartupTimeout(self.config.startup_timeout()));
            self.finish(&mut control, verdict);
        }
        Ok(())
    }

    /// 停止中スレッドを一様乱数で1つ解放する
    ///
    /// プロセスは停止させますが、継続は呼び出し側が行います。
    fn release_random(&mut self, control: &mut ControlState) -> Result<bool> {
        if !self.substrate.is_valid() {
            self.log.warn("PROCESS IS INVALID");
            return Ok(false);
        }
        let Some(entry) = control.registry.take_random(&mut self.rng) else {
            return Ok(false);
        };

        self.stop_process()?;
        self.resume_thread(entry.thread)?;
        self.log
            .timed(format!(">>>>>>> INFO: Thread {} is released. >>>>>>>", entry.thread));
        Ok(true)
    }

    fn all_threads_suspended(&self) -> bool {
        let threads = self.substrate.threads();
        !threads.is_empty() && threads.iter().all(|tid| self.substrate.is_suspended(*tid))
    }

    fn resume_threads_except(&mut self, keep: &BTreeSet<ThreadId>) -> Result<()> {
        for tid in self.substrate.threads() {
            if keep.contains(&tid) || !self.substrate.is_suspended(tid) {
                continue;
            }
            self.resume_thread(tid)?;
        }
        self.log.info("THREADS RESUMED.");
        Ok(())
    }

    fn stop_process(&mut self) -> Result<()> {
        if self.substrate.is_stopped() {
            return Ok(());
        }
        let substrate = &mut self.substrate;
        retry("process.Stop()", &self.retry, &self.log, || {
            succeeded("process.Stop()", substrate.stop())
        })
    }

    fn continue_process(&mut self) -> Result<()> {
        if !self.substrate.is_stopped() {
            return Ok(());
        }
        let substrate = &mut self.substrate;
        retry("process.Continue()", &self.retry, &self.log, || {
            succeeded("process.Continue()", substrate.continue_execution())
        })
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<()> {
        let substrate = &mut self.substrate;
        retry("thread.Suspend()", &self.retry, &self.log, || substrate.suspend_thread(thread))
    }

    fn resume_thread(&mut self, thread: ThreadId) -> Result<()> {
        let substrate = &mut self.substrate;
        retry("thread.Resume()", &self.retry, &self.log, || substrate.resume_thread(thread))
    }
}

impl<S: Substrate> Drop for Scheduler<S> {
    fn drop(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, RaceLocation};

    /// 何もしない基盤（状態遷移の検査用）
    struct NullSubstrate;

    struct NullFrame;

    impl Frame for NullFrame {
        fn file(&self) -> Option<&str> {
            None
        }

        fn line(&self) -> Option<u32> {
            None
        }

        fn resolve_variable(&self, _path: &str) -> Option<Address> {
            None
        }
    }

    impl Substrate for NullSubstrate {
        type Frame = NullFrame;

        fn arm_breakpoint(&mut self, kind: AccessKind, _location: &RaceLocation) -> anyhow::Result<BreakpointHandle> {
            Ok(BreakpointHandle { id: 1, kind, sites: 1 })
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn is_stopped(&self) -> bool {
            true
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn continue_execution(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn threads(&self) -> Vec<ThreadId> {
            Vec::new()
        }

        fn suspend_thread(&mut self, _thread: ThreadId) -> bool {
            true
        }

        fn resume_thread(&mut self, _thread: ThreadId) -> bool {
            true
        }

        fn is_suspended(&self, _thread: ThreadId) -> bool {
            false
        }

        fn stop_reason(&self, _thread: ThreadId) -> StopReason {
            StopReason::None
        }

        fn top_frame(&self, _thread: ThreadId) -> Option<NullFrame> {
            None
        }
    }

    fn scheduler(race: RaceDescriptor) -> Scheduler<NullSubstrate> {
        Scheduler::new(NullSubstrate, race, SchedulerConfig::default(), Arc::new(SessionLog::discard()))
    }

    fn race() -> RaceDescriptor {
        RaceDescriptor::new(
            RaceLocation::new("file1.c", 10, "counter++;"),
            RaceLocation::new("file2.c", 20, "x = counter;"),
        )
    }

    #[test]
    fn test_arm_transitions() {
        let mut sched = scheduler(race());
        assert_eq!(sched.state(), SessionState::Idle);
        assert!(matches!(sched.run(), Err(SchedulerError::State(_))));

        let handles = sched.arm().unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(sched.state(), SessionState::Armed);
        assert!(matches!(sched.arm(), Err(SchedulerError::State(_))));
    }

    #[test]
    fn test_shared_site_arms_once() {
        let same = RaceDescriptor::new(
            RaceLocation::new("f.c", 3, "n++;"),
            RaceLocation::new("f.c", 3, "n++;"),
        );
        let mut sched = scheduler(same);
        let handles = sched.arm().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].kind, AccessKind::Write);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut sched = scheduler(race());
        sched.arm().unwrap();

        let first = Verdict::Failed("first".to_string());
        assert!(sched.terminate(first.clone()));
        assert!(!sched.terminate(Verdict::Failed("second".to_string())));
        assert_eq!(sched.verdict(), Some(first));
        assert!(sched.log().is_closed());
    }

    #[test]
    fn test_target_exit_ends_session() {
        let mut sched = scheduler(race());
        sched.arm().unwrap();
        sched.handle_event(SchedulerEvent::TargetExited { code: 0 });
        assert_eq!(
            sched.verdict(),
            Some(Verdict::NotReproduced(NotReproduced::TargetExited(0)))
        );
        assert!(sched.status().is_terminated());
    }
}

//! スレッド管理機能

use conbreak_core::{StopReason, ThreadId};
use nix::sys::signal::Signal;

/// トレース中のスレッド
#[derive(Debug, Clone)]
pub struct Thread {
    tid: ThreadId,
    /// 実行中か（ptrace-stop でないか）
    pub running: bool,
    /// サスペンド中（プロセス継続時も停止したまま）
    pub suspended: bool,
    /// 最後の停止理由（再開でクリアされる）
    pub reason: StopReason,
    /// 送信済みでまだ受け取っていない SIGSTOP がある
    pub pending_sigstop: bool,
    /// 次の再開時に配送するシグナル
    pub pending_signal: Option<Signal>,
}

impl Thread {
    /// 停止状態のスレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            running: false,
            suspended: false,
            reason: StopReason::None,
            pending_sigstop: false,
            pending_signal: None,
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// 再開の準備（停止理由をクリアし、配送すべきシグナルを取り出す）
    pub fn mark_running(&mut self) -> Option<Signal> {
        self.running = true;
        self.reason = StopReason::None;
        self.pending_signal.take()
    }

    /// 停止を記録する
    pub fn mark_stopped(&mut self, reason: StopReason) {
        self.running = false;
        // ブレークポイントの停止理由は後から来た SIGSTOP で上書きしない
        if self.reason != StopReason::Breakpoint || reason == StopReason::Breakpoint {
            self.reason = reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_reason_survives_interrupt() {
        let mut thread = Thread::new(42);
        thread.mark_stopped(StopReason::Breakpoint);
        thread.mark_stopped(StopReason::Interrupt);
        assert_eq!(thread.reason, StopReason::Breakpoint);

        thread.pending_signal = Some(Signal::SIGUSR1);
        assert_eq!(thread.mark_running(), Some(Signal::SIGUSR1));
        assert_eq!(thread.reason, StopReason::None);
        assert!(thread.running);
        assert_eq!(thread.mark_running(), None);
    }
}

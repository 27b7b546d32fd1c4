//! スケジューライベント

use crate::capability::ThreadId;
use crate::location::AccessKind;
use crossbeam::channel::Sender;

/// スケジューラが1つずつ処理するイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// スレッドがブレークポイントに到達した
    BreakpointHit { thread: ThreadId, kind: AccessKind },
    /// ウォッチドッグの定期チェック
    TimerTick,
    /// デバッグ対象プロセスが終了した
    TargetExited { code: i32 },
}

/// イベントの送信先
pub type EventSink = Sender<SchedulerEvent>;

//! ウォッチドッグタイマー
//!
//! 一定周期で `TimerTick` を送る専用スレッドです。解放・終了の判断自体は
//! スケジューラがイベントループ内で行います。

use crate::{EventSink, SchedulerEvent};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 最後のブレークポイント活動の時刻
///
/// レジストリのロックとは独立したロックで保護します。
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// 活動を記録する
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// 最後の活動からの経過時間
    pub fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }

    /// 最後の活動時刻を直接設定する（テスト用）
    pub fn set(&self, at: Instant) {
        *self.last.lock() = at;
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// 周期タイマースレッド
pub struct Watchdog {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// タイマースレッドを起動する
    ///
    /// 受信側が閉じられるか [`Watchdog::shutdown`] が呼ばれると終了します。
    pub fn spawn(interval: Duration, sink: EventSink) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("conbreak-watchdog".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        if sink.send(SchedulerEvent::TimerTick).is_err() {
                            tracing::debug!("scheduler gone, watchdog exiting");
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// タイマースレッドを停止して合流する
    pub fn shutdown(&mut self) {
        // 送信側を落とすと stop_rx が切断として受信する
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

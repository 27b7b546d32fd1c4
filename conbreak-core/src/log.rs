//! セッションログ（出力シンク）
//!
//! ブレークポイントヒット、解決したアドレス、停止・解放の判断、最終判定を
//! 追記専用で記録します。複数スレッドから書き込まれるため専用のロックで直列化します。

use parking_lot::Mutex;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// セッションログ
pub struct SessionLog {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// 対話モードでは標準出力にも表示する
    echo: bool,
}

impl SessionLog {
    /// ファイルを作成してログを開く
    pub fn create<P: AsRef<Path>>(path: P, echo: bool) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file), echo))
    }

    /// 任意の書き込み先からログを作成する
    pub fn from_writer<W: Write + Send + 'static>(writer: W, echo: bool) -> Self {
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            echo,
        }
    }

    /// 何も記録しないログ
    pub fn discard() -> Self {
        Self::from_writer(io::sink(), false)
    }

    /// 1行書き込んでフラッシュする
    ///
    /// クローズ後の書き込みは無視されます。
    pub fn line(&self, msg: impl Display) {
        let msg = msg.to_string();
        if self.echo {
            println!("{}", msg);
        }

        let mut guard = self.writer.lock();
        if let Some(writer) = guard.as_mut() {
            let result = writeln!(writer, "{}", msg).and_then(|_| writer.flush());
            if let Err(e) = result {
                tracing::error!("failed to write session log: {}", e);
            }
        }
    }

    /// 情報メッセージ
    pub fn info(&self, msg: impl Display) {
        tracing::info!("{}", msg);
        self.line(format!(">>>>>>> INFO: {} >>>>>>>", msg));
    }

    /// 警告メッセージ（一貫性の警告、リトライなど）
    pub fn warn(&self, msg: impl Display) {
        tracing::warn!("{}", msg);
        self.line(format!("####### WARN: {} #######", msg));
    }

    /// エラーメッセージ
    pub fn error(&self, msg: impl Display) {
        tracing::error!("{}", msg);
        self.line(format!("####### ERROR: {} #######", msg));
    }

    /// 時刻付きのメッセージ
    pub fn timed(&self, msg: impl Display) {
        self.line(format!("{:.6} {}", unix_time(), msg));
    }

    /// ログを閉じる
    ///
    /// 2回目以降の呼び出しは何もせず `false` を返します。
    pub fn close(&self) -> bool {
        let mut guard = self.writer.lock();
        match guard.take() {
            Some(mut writer) => {
                if let Err(e) = writer.flush() {
                    tracing::error!("failed to flush session log: {}", e);
                }
                true
            }
            None => false,
        }
    }

    /// ログが閉じられているか
    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }
}

/// UNIX時刻（秒、小数あり）
fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lines_are_appended_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let log = SessionLog::create(&path, false).unwrap();

        log.line("Setting breakpoints...");
        log.warn("READ & WRITE ARE THE SAME!");

        // クローズ前でも内容が見える
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Setting breakpoints...\n####### WARN: READ & WRITE ARE THE SAME! #######\n"
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let log = SessionLog::create(&path, false).unwrap();

        log.line("first");
        assert!(log.close());
        assert!(log.is_closed());
        assert!(!log.close());

        log.line("after close");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "first\n");
    }

    #[test]
    fn test_timed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let log = SessionLog::create(&path, false).unwrap();

        log.timed("WRITE:  [7] Checking 0x10...");
        let text = fs::read_to_string(&path).unwrap();
        let (stamp, rest) = text.trim_end().split_once(' ').unwrap();
        assert!(stamp.parse::<f64>().unwrap() > 0.0);
        assert_eq!(rest, "WRITE:  [7] Checking 0x10...");
    }
}

//! スケジューラ設定
//!
//! 既定値 → TOMLファイル → コマンドライン引数 の順に上書きされます。

use crate::{ReportError, RetryPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// スケジューラ設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 最後のブレークポイント活動からこの時間が経つと、停止中スレッドを1つ解放する
    pub stability_window_ms: u64,
    /// 停止中スレッドがなく、この時間ブレークポイントが発火しなければ終了する
    pub kill_timeout_ms: u64,
    /// 非対話モードで、最初のブレークポイントがこの時間内に発火しなければ終了する
    pub startup_timeout_ms: u64,
    /// ウォッチドッグの周期
    pub tick_interval_ms: u64,
    /// 対話モード（ログを標準出力にも表示し、起動タイムアウトを無効にする）
    pub interactive: bool,
    /// 制御操作の最大試行回数
    pub retry_attempts: u32,
    /// 制御操作の再試行間隔
    pub retry_backoff_ms: u64,
    /// 停止中スレッドを選ぶ乱数のシード（未指定ならエントロピーから）
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stability_window_ms: 500,
            kill_timeout_ms: 5_000,
            startup_timeout_ms: 20_000,
            tick_interval_ms: 100,
            interactive: false,
            retry_attempts: 10,
            retry_backoff_ms: 1_000,
            seed: None,
        }
    }
}

impl SchedulerConfig {
    /// TOML文字列から設定を読み込む
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// TOMLファイルから設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ReportError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|e| ReportError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// 制御操作のリトライ方針
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.stability_window(), Duration::from_millis(500));
        assert_eq!(config.kill_timeout(), Duration::from_secs(5));
        assert_eq!(config.startup_timeout(), Duration::from_secs(20));
        assert!(!config.interactive);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SchedulerConfig::from_toml_str(
            "stability_window_ms = 1000\nstartup_timeout_ms = 30000\n",
        )
        .unwrap();
        assert_eq!(config.stability_window_ms, 1000);
        assert_eq!(config.startup_timeout_ms, 30_000);
        assert_eq!(config.kill_timeout_ms, 5_000);
        assert_eq!(config.retry_policy().max_attempts, 10);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(SchedulerConfig::from_toml_str("interactive = \"yes\"").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conbreak.toml");
        std::fs::write(&path, "interactive = true\nseed = 7\n").unwrap();

        let config = SchedulerConfig::load(&path).unwrap();
        assert!(config.interactive);
        assert_eq!(config.seed, Some(7));

        let missing = SchedulerConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ReportError::Io { .. })));
    }
}

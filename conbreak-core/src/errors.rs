//! エラー型
//!
//! 制御プレーンの一時的な失敗、アドレス解決の失敗、レポート入力の失敗を区別します。
//! タイムアウトはエラーではなく [`crate::Verdict`] として扱います。

use crate::ThreadId;
use std::path::PathBuf;
use thiserror::Error;

/// スケジューラのエラー
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// 停止・再開などの制御操作がリトライ上限まで失敗した
    #[error("{operation} failed after {attempts} attempts")]
    Control {
        operation: &'static str,
        attempts: u32,
    },

    /// ブレークポイント行から監視対象アドレスを得られなかった
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// レポートまたはソース行を読み込めなかった
    #[error(transparent)]
    Report(#[from] ReportError),

    /// デバッガ基盤からのエラー
    #[error("substrate error: {0:#}")]
    Substrate(#[from] anyhow::Error),

    /// セッションの状態遷移が不正
    #[error("invalid session state: {0}")]
    State(String),
}

/// アドレス解決のエラー
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// スタックフレームを取得できなかった
    #[error("Couldn't obtain frame of thread {thread}")]
    InvalidFrame { thread: ThreadId },

    /// 停止した行がどちらのレース位置にも一致しない
    #[error("thread {thread} stopped at unexpected line {line:?}")]
    UnknownStopLine { thread: ThreadId, line: Option<u32> },

    /// ソース行から変数アドレスが1つも得られなかった
    #[error("No variables found in `{source_line}`")]
    NoAddresses { source_line: String },
}

/// レポート入力のエラー
#[derive(Debug, Error)]
pub enum ReportError {
    /// ファイルの読み込みに失敗した
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `SYMBOL (FILE:LINE)` 形式として解析できない行
    #[error("FAIL TO PARSE INPUT at line {line_no}: `{text}`")]
    Unparsable { line_no: usize, text: String },

    /// 書き込み側・読み込み側の2行が揃っていない
    #[error("report must contain 2 locations, found {found}")]
    MissingLocations { found: usize },

    /// ソースコード行を取得できなかった
    #[error("FAIL TO GRAB SOURCE CODE for {file}:{line}")]
    SourceUnavailable { file: String, line: u32 },

    /// 設定ファイルの解析に失敗した
    #[error("invalid config {path:?}: {message}")]
    Config { path: PathBuf, message: String },
}

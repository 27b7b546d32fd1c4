//! セッションの最終判定

use crate::{Conflict, ThreadId};
use std::fmt;
use std::time::Duration;

/// レースが再現できなかった理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReproduced {
    /// 起動後、最初のブレークポイントが発火しなかった
    StartupTimeout(Duration),
    /// 停止中スレッドがないまま、ブレークポイントが発火しなくなった
    NoBreakpointActivity(Duration),
    /// デバッグ対象が一致前に終了した
    TargetExited(i32),
}

impl fmt::Display for NotReproduced {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NotReproduced::StartupTimeout(d) => {
                write!(f, "TERMINATE: Unable to start up after {} sec...", d.as_secs_f64())
            }
            NotReproduced::NoBreakpointActivity(d) => {
                write!(f, "TERMINATE: No breakpoints hit in {} sec...", d.as_secs_f64())
            }
            NotReproduced::TargetExited(code) => {
                write!(f, "TERMINATE: Process exited with status {}", code)
            }
        }
    }
}

/// 最終判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// レースを再現した
    MatchFound {
        /// 新しく停止したスレッド
        thread: ThreadId,
        conflicts: Vec<Conflict>,
    },
    /// タイムアウトなどで再現できなかった（エラーではない）
    NotReproduced(NotReproduced),
    /// 解決失敗・制御失敗による異常終了
    Failed(String),
}

impl Verdict {
    /// セッションログに書く最終行
    pub fn log_line(&self) -> String {
        match self {
            Verdict::MatchFound { .. } => "SUCCESS: MATCH FOUND".to_string(),
            Verdict::NotReproduced(reason) => reason.to_string(),
            Verdict::Failed(reason) => format!("FAILURE: {}", reason),
        }
    }

    /// プロセスの終了コード
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::MatchFound { .. } => 0,
            Verdict::NotReproduced(_) => 1,
            Verdict::Failed(_) => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::MatchFound { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.log_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    #[test]
    fn test_exit_codes() {
        let found = Verdict::MatchFound {
            thread: 2,
            conflicts: vec![Conflict {
                address: Address(0xAAAA),
                thread: 1,
            }],
        };
        assert!(found.is_success());
        assert_eq!(found.exit_code(), 0);
        assert_eq!(found.log_line(), "SUCCESS: MATCH FOUND");

        let timeout = Verdict::NotReproduced(NotReproduced::StartupTimeout(Duration::from_secs(20)));
        assert_eq!(timeout.exit_code(), 1);
        assert_eq!(timeout.log_line(), "TERMINATE: Unable to start up after 20 sec...");

        let failed = Verdict::Failed("No variables found in `return;`".to_string());
        assert_eq!(failed.exit_code(), 2);
        assert!(!failed.is_success());
    }

    #[test]
    fn test_kill_timeout_message() {
        let verdict = NotReproduced::NoBreakpointActivity(Duration::from_millis(5_500));
        assert_eq!(verdict.to_string(), "TERMINATE: No breakpoints hit in 5.5 sec...");
    }
}

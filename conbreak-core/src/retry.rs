//! 制御操作のリトライ
//!
//! デバッガ基盤は状態遷移の途中で停止・再開要求を一時的に拒否することがあるため、
//! 固定間隔で上限回数まで再試行します。

use crate::{SchedulerError, SessionLog};
use std::time::Duration;

/// リトライ方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最初の試行を含む最大試行回数
    pub max_attempts: u32,
    /// 失敗後の待ち時間
    pub backoff: Duration,
}

impl RetryPolicy {
    /// リトライ方針を作成する
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

/// `attempt` が `true` を返すまで再試行する
///
/// 失敗のたびにセッションログへ警告を書き、`policy.backoff` だけ待ちます。
/// 上限に達した場合は [`SchedulerError::Control`] を返します。
pub fn retry<F>(
    operation: &'static str,
    policy: &RetryPolicy,
    log: &SessionLog,
    mut attempt: F,
) -> Result<(), SchedulerError>
where
    F: FnMut() -> bool,
{
    for n in 1..=policy.max_attempts {
        if attempt() {
            return Ok(());
        }
        log.warn(format!("{} FAILED! TRYING AGAIN!", operation));
        if n < policy.max_attempts {
            std::thread::sleep(policy.backoff);
        }
    }

    Err(SchedulerError::Control {
        operation,
        attempts: policy.max_attempts,
    })
}

/// `anyhow::Result` を返す操作を [`retry`] で扱える形に変換する
pub fn succeeded(operation: &str, result: anyhow::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("{} rejected: {:#}", operation, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_retry_until_success() {
        let log = SessionLog::discard();
        let mut calls = 0;
        let result = retry("thread.Suspend()", &quick(5), &log, || {
            calls += 1;
            calls == 3
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let log = SessionLog::discard();
        let mut calls = 0;
        let result = retry("process.Stop()", &quick(4), &log, || {
            calls += 1;
            false
        });
        assert_eq!(calls, 4);
        match result {
            Err(SchedulerError::Control { operation, attempts }) => {
                assert_eq!(operation, "process.Stop()");
                assert_eq!(attempts, 4);
            }
            other => panic!("Expected Control error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_succeeded() {
        assert!(succeeded("op", Ok(())));
        assert!(!succeeded("op", Err(anyhow::anyhow!("busy"))));
    }
}

//! conbreak スケジューラのコア機能
//!
//! このクレートは、動的レース検出器が報告した2箇所のソース位置に
//! ブレークポイントを設定し、スレッドの停止・解放を制御してデータ競合を
//! 再現するスケジューラを提供します。
//! デバッガ基盤（ptrace等）には [`capability`] のトレイト経由でのみアクセスします。

pub mod capability;
pub mod config;
pub mod errors;
pub mod event;
pub mod location;
pub mod log;
pub mod matcher;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod verdict;
pub mod watchdog;

pub use capability::{Address, BreakpointHandle, BreakpointId, Frame, StopReason, Substrate, ThreadId};
pub use config::SchedulerConfig;
pub use errors::{ReportError, ResolutionError, SchedulerError};
pub use event::{EventSink, SchedulerEvent};
pub use location::{AccessKind, RaceDescriptor, RaceLocation};
pub use log::SessionLog;
pub use matcher::{Conflict, MatchEngine};
pub use registry::{ParkedAccess, ParkedRegistry};
pub use report::{load_race, parse_report, parse_report_line, ReportEntry, SourceTree};
pub use resolver::{tokenize, AddressResolver, TokenResolver};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SessionState, SessionStatus};
pub use verdict::{NotReproduced, Verdict};
pub use watchdog::{ActivityClock, Watchdog};

/// スケジューラの結果型
pub type Result<T> = std::result::Result<T, SchedulerError>;

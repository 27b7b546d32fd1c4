//! デバッガ基盤の能力インターフェース
//!
//! ブレークポイントの設置、スレッドの停止・再開、変数アドレスの解決は
//! すべてこのトレイトを通して行います。実装は `conbreak-target`（ptrace）と
//! テスト用のスクリプト化された基盤です。

use crate::event::EventSink;
use crate::location::{AccessKind, RaceLocation};
use std::fmt;

/// スレッドID
pub type ThreadId = i32;

/// ブレークポイントID
pub type BreakpointId = usize;

/// 監視対象の変数アドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

/// スレッドの停止理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 実行中、または停止理由なし
    None,
    /// ブレークポイントで停止
    Breakpoint,
    /// プロセス停止要求による停止
    Interrupt,
    /// その他のシグナル
    Signal(i32),
}

/// 設置済みブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHandle {
    pub id: BreakpointId,
    pub kind: AccessKind,
    /// 実際に設置された物理アドレスの数
    pub sites: usize,
}

/// 停止中スレッドの最上位フレーム
pub trait Frame {
    /// ソースファイルのパス
    fn file(&self) -> Option<&str>;

    /// ソース行番号
    fn line(&self) -> Option<u32>;

    /// 関数名
    fn function(&self) -> Option<&str> {
        None
    }

    /// 変数パス（`x`, `s.field`, `p->field` など）を実行時アドレスに解決する
    ///
    /// 解決できないトークンは `None` を返します。
    fn resolve_variable(&self, path: &str) -> Option<Address>;
}

/// デバッガ基盤
///
/// 制御操作はいずれも「失敗しうるが最終的には成功する」ものとして扱い、
/// 呼び出し側がリトライします。
pub trait Substrate {
    type Frame: Frame;

    /// `location` にブレークポイントを設置する
    fn arm_breakpoint(
        &mut self,
        kind: AccessKind,
        location: &RaceLocation,
    ) -> anyhow::Result<BreakpointHandle>;

    /// プロセスがまだ有効か
    fn is_valid(&self) -> bool;

    /// 実行中のスレッドが1つもないか
    fn is_stopped(&self) -> bool;

    /// プロセス全体を停止する
    fn stop(&mut self) -> anyhow::Result<()>;

    /// サスペンドされていないスレッドの実行を継続する
    fn continue_execution(&mut self) -> anyhow::Result<()>;

    /// 生存しているスレッドの一覧
    fn threads(&self) -> Vec<ThreadId>;

    /// スレッドをサスペンドする（プロセス継続時も停止したままにする）
    fn suspend_thread(&mut self, thread: ThreadId) -> bool;

    /// スレッドのサスペンドを解除する
    fn resume_thread(&mut self, thread: ThreadId) -> bool;

    /// スレッドがサスペンドされているか
    fn is_suspended(&self, thread: ThreadId) -> bool;

    /// スレッドの停止理由
    fn stop_reason(&self, thread: ThreadId) -> StopReason;

    /// スレッドの最上位フレーム
    fn top_frame(&self, thread: ThreadId) -> Option<Self::Frame>;

    /// ソース行のテキストを取得する
    fn source_line_text(&self, _file: &str, _line: u32) -> Option<String> {
        None
    }

    /// ネイティブの通知（ブレークポイントヒット、プロセス終了）をイベントとして送る
    fn pump(&mut self, _sink: &EventSink) -> anyhow::Result<()> {
        Ok(())
    }
}

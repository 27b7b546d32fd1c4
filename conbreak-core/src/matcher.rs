//! 一致判定（Match Engine）
//!
//! 新しく停止したアクセスが、既に停止中のアクセスと競合するかを判定する純粋関数です。

use crate::{Address, ParkedAccess, ParkedRegistry, ThreadId};

/// 競合レコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    /// 共通のアドレス
    pub address: Address,
    /// 競合相手のスレッド
    pub thread: ThreadId,
}

/// 一致判定エンジン
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchEngine {
    /// 書き込み側と読み込み側が同じ物理位置か
    shared_site: bool,
}

impl MatchEngine {
    pub fn new(shared_site: bool) -> Self {
        Self { shared_site }
    }

    pub fn shared_site(&self) -> bool {
        self.shared_site
    }

    /// 2つのアクセスが競合しうる組み合わせか
    ///
    /// スレッドが異なることが必須です。位置が異なれば（アクセス種別は問わない）競合候補、
    /// 同じ位置なら停止行が異なる場合のみ候補です。同一位置モードでは
    /// 物理ブレークポイントが1つなので、異なるスレッド同士はすべて候補になります。
    pub fn may_conflict(&self, parked: &ParkedAccess, candidate: &ParkedAccess) -> bool {
        if parked.thread == candidate.thread {
            return false;
        }
        if self.shared_site {
            return true;
        }
        parked.kind != candidate.kind || parked.line != candidate.line
    }

    /// 候補と競合する停止中アクセスを列挙する
    ///
    /// 共通アドレスごとに1レコードを返します。空でなければレースの再現です。
    pub fn find_conflicts(&self, registry: &ParkedRegistry, candidate: &ParkedAccess) -> Vec<Conflict> {
        registry
            .iter()
            .filter(|parked| self.may_conflict(parked, candidate))
            .flat_map(|parked| {
                parked.shared_addresses(candidate).map(move |address| Conflict {
                    address,
                    thread: parked.thread,
                })
            })
            .collect()
    }
}

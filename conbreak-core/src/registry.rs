//! 停止中アクセスのレジストリ（Parked-Access Registry）

use crate::{AccessKind, Address, ThreadId};
use rand::Rng;
use std::collections::BTreeSet;

/// ブレークポイントで停止させているスレッドのアクセス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedAccess {
    /// 解決したアドレス集合
    pub addresses: BTreeSet<Address>,
    /// アクセス種別
    pub kind: AccessKind,
    /// 停止した行（同一位置モードでの自己一致の判定に使う）
    pub line: u32,
    /// スレッドID
    pub thread: ThreadId,
}

impl ParkedAccess {
    pub fn new<I>(thread: ThreadId, kind: AccessKind, line: u32, addresses: I) -> Self
    where
        I: IntoIterator<Item = Address>,
    {
        Self {
            addresses: addresses.into_iter().collect(),
            kind,
            line,
            thread,
        }
    }

    /// 両者に共通するアドレス
    pub fn shared_addresses<'a>(&'a self, other: &'a ParkedAccess) -> impl Iterator<Item = Address> + 'a {
        self.addresses.intersection(&other.addresses).copied()
    }

    /// 解決したアドレスを空白区切りで表示する
    pub fn address_list(&self) -> String {
        self.addresses
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 停止中アクセスのレジストリ
///
/// スレッドIDは一意です。挿入順は意味を持ちません。
#[derive(Debug, Default, Clone)]
pub struct ParkedRegistry {
    entries: Vec<ParkedAccess>,
}

impl ParkedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// アクセスを登録する
    ///
    /// 同じスレッドの既存エントリは置き換え、古いエントリを返します。
    pub fn insert(&mut self, access: ParkedAccess) -> Option<ParkedAccess> {
        let previous = self.remove(access.thread);
        self.entries.push(access);
        previous
    }

    /// スレッドのエントリを取り除く
    pub fn remove(&mut self, thread: ThreadId) -> Option<ParkedAccess> {
        let idx = self.entries.iter().position(|e| e.thread == thread)?;
        Some(self.entries.swap_remove(idx))
    }

    pub fn get(&self, thread: ThreadId) -> Option<&ParkedAccess> {
        self.entries.iter().find(|e| e.thread == thread)
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.get(thread).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParkedAccess> {
        self.entries.iter()
    }

    /// 登録されているスレッドID
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.entries.iter().map(|e| e.thread).collect()
    }

    /// 一様乱数で1つ選んで取り除く
    pub fn take_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<ParkedAccess> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.entries.len());
        Some(self.entries.swap_remove(idx))
    }

    /// `discard` が `true` を返したエントリを取り除いて返す
    pub fn discard_if<F>(&mut self, mut discard: F) -> Vec<ParkedAccess>
    where
        F: FnMut(&ParkedAccess) -> bool,
    {
        let mut discarded = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if discard(&self.entries[i]) {
                discarded.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn access(thread: ThreadId, addrs: &[u64]) -> ParkedAccess {
        ParkedAccess::new(thread, AccessKind::Write, 10, addrs.iter().map(|a| Address(*a)))
    }

    #[test]
    fn test_insert_replaces_same_thread() {
        let mut registry = ParkedRegistry::new();
        assert!(registry.insert(access(1, &[0x10])).is_none());
        assert!(registry.insert(access(2, &[0x20])).is_none());

        let old = registry.insert(access(1, &[0x30])).unwrap();
        assert_eq!(old.addresses, [Address(0x10)].into_iter().collect());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().address_list(), "0x30");
    }

    #[test]
    fn test_take_random_drains() {
        let mut registry = ParkedRegistry::new();
        for t in 1..=5 {
            registry.insert(access(t, &[0x10]));
        }

        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = BTreeSet::new();
        while let Some(entry) = registry.take_random(&mut rng) {
            assert!(seen.insert(entry.thread));
        }
        assert_eq!(seen.len(), 5);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discard_if() {
        let mut registry = ParkedRegistry::new();
        for t in 1..=4 {
            registry.insert(access(t, &[0x10]));
        }
        let discarded = registry.discard_if(|e| e.thread % 2 == 1);
        let mut gone: Vec<_> = discarded.iter().map(|e| e.thread).collect();
        gone.sort();
        assert_eq!(gone, vec![1, 3]);

        let mut left = registry.thread_ids();
        left.sort();
        assert_eq!(left, vec![2, 4]);
    }

    #[test]
    fn test_shared_addresses() {
        let a = access(1, &[0x10, 0x20, 0x30]);
        let b = access(2, &[0x30, 0x10, 0x40]);
        let shared: Vec<_> = a.shared_addresses(&b).collect();
        assert_eq!(shared, vec![Address(0x10), Address(0x30)]);
        assert_eq!(a.address_list(), "0x10 0x20 0x30");
    }
}

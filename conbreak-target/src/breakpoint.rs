//! ブレークポイント機能

use crate::{Memory, Result};
use conbreak_core::{AccessKind, BreakpointId};
use std::collections::BTreeMap;

/// INT3命令のオペコード
const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, memory: &Memory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        self.original_byte = memory.read_u8(self.address)?;
        memory.write_u8(self.address, INT3_OPCODE)?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, memory: &Memory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        memory.write_u8(self.address, self.original_byte)?;

        self.enabled = false;
        Ok(())
    }
}

/// 設置場所
#[derive(Debug)]
struct Site {
    id: BreakpointId,
    kind: AccessKind,
    breakpoint: SoftwareBreakpoint,
}

/// 論理ブレークポイント（ソース行）と物理ブレークポイント（アドレス）の対応表
#[derive(Debug, Default)]
pub struct BreakpointTable {
    sites: BTreeMap<u64, Site>,
    next_id: BreakpointId,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 実行時アドレスの一覧に論理ブレークポイントを1つ設置する
    ///
    /// 既に別のブレークポイントがあるアドレスは共有します。
    pub fn insert(&mut self, memory: &Memory, kind: AccessKind, addresses: &[u64]) -> Result<(BreakpointId, usize)> {
        let id = self.next_id;
        self.next_id += 1;

        let mut placed = 0;
        for &address in addresses {
            if self.sites.contains_key(&address) {
                tracing::debug!("breakpoint already present at 0x{:x}", address);
                continue;
            }
            let mut breakpoint = SoftwareBreakpoint::new(address);
            breakpoint.enable(memory)?;
            self.sites.insert(address, Site { id, kind, breakpoint });
            placed += 1;
        }
        Ok((id, placed))
    }

    /// アドレスにあるブレークポイントの種類
    pub fn kind_at(&self, address: u64) -> Option<AccessKind> {
        self.sites.get(&address).map(|site| site.kind)
    }

    /// アドレスにあるブレークポイントのID
    pub fn id_at(&self, address: u64) -> Option<BreakpointId> {
        self.sites.get(&address).map(|site| site.id)
    }

    /// 有効なブレークポイントがあるか
    pub fn is_enabled_at(&self, address: u64) -> bool {
        self.sites
            .get(&address)
            .is_some_and(|site| site.breakpoint.is_enabled())
    }

    pub fn disable_at(&mut self, memory: &Memory, address: u64) -> Result<()> {
        match self.sites.get_mut(&address) {
            Some(site) => site.breakpoint.disable(memory),
            None => Ok(()),
        }
    }

    pub fn enable_at(&mut self, memory: &Memory, address: u64) -> Result<()> {
        match self.sites.get_mut(&address) {
            Some(site) => site.breakpoint.enable(memory),
            None => Ok(()),
        }
    }

    /// すべてのブレークポイントを解除する
    pub fn disable_all(&mut self, memory: &Memory) -> Result<()> {
        for site in self.sites.values_mut() {
            site.breakpoint.disable(memory)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

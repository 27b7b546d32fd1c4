//! 停止中フレームへのアクセス
//!
//! ロケーション式の評価に必要なレジスタ・メモリ読み取りと、
//! `.eh_frame` を使った CFA（Canonical Frame Address）の計算を提供します。

use crate::{DwarfLoader, Result};
use gimli::UnwindSection;

/// 停止中スレッドのフレームから値を読み出すインターフェース
pub trait FrameAccess {
    /// 実行時のプログラムカウンタ
    fn pc(&self) -> u64;

    /// ロードバイアス（PIEの実行時ベースアドレス、非PIEでは0）
    fn load_bias(&self) -> u64;

    /// DWARFレジスタ番号でレジスタ値を取得する
    fn register(&self, reg: u16) -> Result<u64>;

    /// メモリを読み取る
    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// DWARF上のアドレス（ファイル上のアドレス）に変換したPC
    fn file_pc(&self) -> u64 {
        self.pc().wrapping_sub(self.load_bias())
    }

    /// ポインタサイズの値を読み取る
    fn read_pointer(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(u64::from_le_bytes(buf))
    }
}

/// 現在のPCにおけるCFAを計算する
///
/// `DW_OP_call_frame_cfa` をフレームベースに使う関数（Cコンパイラ出力に多い）で必要になります。
pub fn compute_cfa(loader: &DwarfLoader, access: &dyn FrameAccess) -> Result<u64> {
    let pc = access.file_pc();
    let mut ctx: gimli::UnwindContext<usize> = gimli::UnwindContext::new();
    let row = loader
        .eh_frame()
        .unwind_info_for_address(loader.bases(), &mut ctx, pc, gimli::EhFrame::cie_from_offset)
        .map_err(|e| anyhow::anyhow!("No unwind info for 0x{:x}: {}", pc, e))?;

    match row.cfa() {
        gimli::CfaRule::RegisterAndOffset { register, offset } => {
            let base = access.register(register.0)?;
            Ok(base.wrapping_add_signed(*offset))
        }
        gimli::CfaRule::Expression(_) => Err(anyhow::anyhow!("CFA expressions are not supported")),
    }
}

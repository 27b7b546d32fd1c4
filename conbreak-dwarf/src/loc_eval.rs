//! DWARF ロケーション式評価
//!
//! DWARFのロケーション式を評価して、変数のメモリ上の位置を特定します。

use crate::frame::FrameAccess;
use crate::Result;
use gimli::{Evaluation, EvaluationResult, Location, Piece, Reader, Value};

/// ロケーション評価の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loc {
    /// レジスタに格納されている
    Reg { reg: u16 },
    /// メモリアドレス
    Addr { addr: u64, size: usize },
    /// 値そのもの（`DW_OP_stack_value` など）
    Value(u64),
    /// 複数のピースから構成される
    Pieces(usize),
    /// 最適化により削除された
    Empty,
}

impl Loc {
    /// メモリ上に存在する場合のアドレス
    pub fn address(&self) -> Option<u64> {
        match self {
            Loc::Addr { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

/// ロケーション評価器
pub struct LocationEvaluator<R: Reader> {
    eval: Option<Evaluation<R>>,
    frame_base: Option<u64>,
    cfa: Option<u64>,
}

impl<R: Reader<Offset = usize>> LocationEvaluator<R> {
    /// 新しいロケーション評価器を作成する
    ///
    /// # Arguments
    /// * `expr` - DWARF ロケーション式
    /// * `encoding` - DWARF エンコーディング情報
    pub fn new(expr: gimli::Expression<R>, encoding: gimli::Encoding) -> Self {
        Self {
            eval: Some(expr.evaluation(encoding)),
            frame_base: None,
            cfa: None,
        }
    }

    /// フレームベースアドレス（`DW_AT_frame_base` の評価結果）を設定する
    pub fn with_frame_base(mut self, frame_base: Option<u64>) -> Self {
        self.frame_base = frame_base;
        self
    }

    /// CFAを設定する
    pub fn with_cfa(mut self, cfa: Option<u64>) -> Self {
        self.cfa = cfa;
        self
    }

    /// 式の評価スタックの初期値を設定する（`DW_AT_data_member_location` 用）
    pub fn with_initial_value(mut self, value: u64) -> Self {
        if let Some(eval) = self.eval.as_mut() {
            eval.set_initial_value(value);
        }
        self
    }

    /// ロケーション式を評価する
    ///
    /// # Arguments
    /// * `access` - レジスタとメモリの読み取り元
    /// * `indexed_address` - `.debug_addr` のインデックスをファイル上のアドレスに変換するコールバック
    pub fn evaluate<F>(&mut self, access: &dyn FrameAccess, mut indexed_address: F) -> Result<Loc>
    where
        F: FnMut(gimli::DebugAddrIndex<usize>) -> Result<u64>,
    {
        let mut eval = self
            .eval
            .take()
            .ok_or_else(|| anyhow::anyhow!("Evaluation already consumed"))?;

        let mut state = eval.evaluate()?;
        loop {
            state = match state {
                EvaluationResult::Complete => break,
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = access.register(register.0)?;
                    eval.resume_with_register(Value::Generic(value))?
                }
                EvaluationResult::RequiresFrameBase => {
                    let fb = self
                        .frame_base
                        .ok_or_else(|| anyhow::anyhow!("Frame base required but not provided"))?;
                    eval.resume_with_frame_base(fb)?
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    let cfa = self
                        .cfa
                        .ok_or_else(|| anyhow::anyhow!("CFA required but not available"))?;
                    eval.resume_with_call_frame_cfa(cfa)?
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let bytes = access.read_memory(address, size as usize)?;
                    let mut value_bytes = [0u8; 8];
                    let copy_size = bytes.len().min(8);
                    value_bytes[..copy_size].copy_from_slice(&bytes[..copy_size]);
                    eval.resume_with_memory(Value::Generic(u64::from_le_bytes(value_bytes)))?
                }
                EvaluationResult::RequiresRelocatedAddress(addr) => {
                    // DW_OP_addr はファイル上のアドレスなのでロードバイアスを足す
                    eval.resume_with_relocated_address(addr.wrapping_add(access.load_bias()))?
                }
                EvaluationResult::RequiresIndexedAddress { index, relocate } => {
                    let mut addr = indexed_address(index)?;
                    if relocate {
                        addr = addr.wrapping_add(access.load_bias());
                    }
                    eval.resume_with_indexed_address(addr)?
                }
                other => {
                    return Err(anyhow::anyhow!("Unsupported evaluation result: {:?}", other));
                }
            };
        }

        let result = eval.result();
        match result.len() {
            0 => Ok(Loc::Empty),
            1 => Ok(convert_piece(&result[0])),
            n => Ok(Loc::Pieces(n)),
        }
    }
}

fn convert_piece<R: Reader>(piece: &Piece<R>) -> Loc {
    match piece.location {
        Location::Register { register } => Loc::Reg { reg: register.0 },
        Location::Address { address } => {
            let size = piece.size_in_bits.map(|b| (b / 8) as usize).unwrap_or(8);
            Loc::Addr { addr: address, size }
        }
        Location::Value { value } => match value.to_u64(u64::MAX) {
            Ok(v) => Loc::Value(v),
            Err(_) => Loc::Empty,
        },
        _ => Loc::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::{EndianSlice, LittleEndian};

    struct Regs {
        bias: u64,
    }

    impl FrameAccess for Regs {
        fn pc(&self) -> u64 {
            self.bias + 0x1000
        }

        fn load_bias(&self) -> u64 {
            self.bias
        }

        fn register(&self, reg: u16) -> Result<u64> {
            match reg {
                7 => Ok(0x7fff_0000),
                _ => Err(anyhow::anyhow!("no register {}", reg)),
            }
        }

        fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
            Ok(addr.to_le_bytes()[..size].to_vec())
        }
    }

    fn encoding() -> gimli::Encoding {
        gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        }
    }

    fn evaluate(bytes: &[u8], frame_base: Option<u64>, cfa: Option<u64>) -> Result<Loc> {
        let expr = gimli::Expression(EndianSlice::new(bytes, LittleEndian));
        LocationEvaluator::new(expr, encoding())
            .with_frame_base(frame_base)
            .with_cfa(cfa)
            .evaluate(&Regs { bias: 0x5555_0000_0000 }, |_| {
                Err(anyhow::anyhow!("no .debug_addr"))
            })
    }

    #[test]
    fn test_addr_is_relocated() {
        // DW_OP_addr 0x4010
        let mut bytes = vec![gimli::constants::DW_OP_addr.0];
        bytes.extend_from_slice(&0x4010u64.to_le_bytes());
        let loc = evaluate(&bytes, None, None).unwrap();
        assert_eq!(loc.address(), Some(0x5555_0000_4010));
    }

    #[test]
    fn test_fbreg() {
        // DW_OP_fbreg -16
        let bytes = [gimli::constants::DW_OP_fbreg.0, 0x70];
        let loc = evaluate(&bytes, Some(0x7fff_0100), None).unwrap();
        assert_eq!(loc.address(), Some(0x7fff_00f0));

        assert!(evaluate(&bytes, None, None).is_err());
    }

    #[test]
    fn test_call_frame_cfa() {
        let bytes = [gimli::constants::DW_OP_call_frame_cfa.0];
        let loc = evaluate(&bytes, None, Some(0x7fff_0200)).unwrap();
        assert_eq!(loc.address(), Some(0x7fff_0200));
    }

    #[test]
    fn test_register_location() {
        // DW_OP_reg7 (rsp)
        let bytes = [gimli::constants::DW_OP_reg7.0];
        let loc = evaluate(&bytes, None, None).unwrap();
        assert_eq!(loc, Loc::Reg { reg: 7 });
        assert_eq!(loc.address(), None);
    }
}

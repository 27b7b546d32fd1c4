//! DWARF型情報の参照
//!
//! 変数パスを辿るのに必要な分だけ、型DIEからメンバーオフセット・サイズ・
//! 参照先の型を取り出します。

use crate::loc_eval::LocationEvaluator;
use crate::frame::FrameAccess;
use crate::utils;
use crate::Result;
use gimli::Reader;

/// 型DIEの種類（修飾子を取り除いた後）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// ポインタ・参照
    Pointer,
    /// 配列
    Array,
    /// 構造体・共用体・クラス
    Aggregate,
    /// その他（基本型、列挙型など）
    Scalar,
}

/// メンバー情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member<O> {
    /// 構造体先頭からのオフセット（バイト）
    pub offset: u64,
    /// メンバーの型
    pub ty: Option<gimli::UnitOffset<O>>,
}

/// 1つのコンパイルユニット内の型を参照する
pub struct TypeWalker<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
    unit: &'a gimli::Unit<R>,
}

impl<'a, R: Reader<Offset = usize>> TypeWalker<'a, R> {
    pub fn new(dwarf: &'a gimli::Dwarf<R>, unit: &'a gimli::Unit<R>) -> Self {
        Self { dwarf, unit }
    }

    /// typedef と const/volatile/restrict/atomic 修飾子を取り除く
    pub fn strip(&self, mut offset: gimli::UnitOffset) -> Result<gimli::UnitOffset> {
        // 循環した型情報で無限ループしないように上限を設ける
        for _ in 0..64 {
            let entry = self.unit.entry(offset)?;
            match entry.tag() {
                gimli::DW_TAG_typedef
                | gimli::DW_TAG_const_type
                | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_restrict_type
                | gimli::DW_TAG_atomic_type => match utils::type_of(self.unit, &entry)? {
                    Some(next) => offset = next,
                    None => return Ok(offset),
                },
                _ => return Ok(offset),
            }
        }
        Err(anyhow::anyhow!("Type chain too deep at {:?}", offset))
    }

    /// 型の種類
    pub fn kind(&self, offset: gimli::UnitOffset) -> Result<TypeKind> {
        let entry = self.unit.entry(self.strip(offset)?)?;
        Ok(match entry.tag() {
            gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type => TypeKind::Pointer,
            gimli::DW_TAG_array_type => TypeKind::Array,
            gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type | gimli::DW_TAG_class_type => {
                TypeKind::Aggregate
            }
            _ => TypeKind::Scalar,
        })
    }

    /// ポインタ・配列の要素型
    pub fn target(&self, offset: gimli::UnitOffset) -> Result<Option<gimli::UnitOffset>> {
        let entry = self.unit.entry(self.strip(offset)?)?;
        utils::type_of(self.unit, &entry)
    }

    /// 型のバイトサイズ
    pub fn byte_size(&self, offset: gimli::UnitOffset) -> Result<Option<u64>> {
        let stripped = self.strip(offset)?;
        let entry = self.unit.entry(stripped)?;
        if let Some(size) = entry.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()) {
            return Ok(Some(size));
        }

        match entry.tag() {
            gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type => Ok(Some(u64::from(self.unit.encoding().address_size))),
            gimli::DW_TAG_array_type => {
                let Some(elem) = utils::type_of(self.unit, &entry)? else {
                    return Ok(None);
                };
                let Some(elem_size) = self.byte_size(elem)? else {
                    return Ok(None);
                };
                Ok(self.array_length(stripped)?.map(|len| len * elem_size))
            }
            _ => Ok(None),
        }
    }

    /// 配列の要素数（`DW_AT_count` または `DW_AT_upper_bound` + 1）
    fn array_length(&self, offset: gimli::UnitOffset) -> Result<Option<u64>> {
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            if let Some(count) = entry.attr(gimli::DW_AT_count)?.and_then(|a| a.udata_value()) {
                return Ok(Some(count));
            }
            if let Some(upper) = entry.attr(gimli::DW_AT_upper_bound)?.and_then(|a| a.udata_value()) {
                return Ok(Some(upper + 1));
            }
        }
        Ok(None)
    }

    /// 構造体のメンバーを名前で探す
    pub fn member(&self, offset: gimli::UnitOffset, name: &str) -> Result<Option<Member<usize>>> {
        let stripped = self.strip(offset)?;
        let mut tree = self.unit.entries_tree(Some(stripped))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let member_name = utils::entry_name(self.dwarf, self.unit, entry)?;
            // Rustのタプル構造体のフィールドは `__0` という名前になる
            let matches = member_name
                .as_deref()
                .is_some_and(|n| n == name || n.strip_prefix("__") == Some(name));
            if !matches {
                continue;
            }

            return Ok(Some(Member {
                offset: self.member_offset(entry)?,
                ty: utils::type_of(self.unit, entry)?,
            }));
        }
        Ok(None)
    }

    fn member_offset(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Result<u64> {
        let Some(attr) = entry.attr(gimli::DW_AT_data_member_location)? else {
            // 共用体のメンバーは位置を持たない
            return Ok(0);
        };
        if let Some(offset) = attr.udata_value() {
            return Ok(offset);
        }
        let Some(expr) = attr.exprloc_value() else {
            return Err(anyhow::anyhow!("Unsupported member location: {:?}", attr.value()));
        };

        let loc = LocationEvaluator::new(expr, self.unit.encoding())
            .with_initial_value(0)
            .evaluate(&NoFrame, |_| Err(anyhow::anyhow!("Indexed member location")))?;
        loc.address()
            .ok_or_else(|| anyhow::anyhow!("Member location is not an offset: {:?}", loc))
    }
}

/// メンバー位置の計算に使う、レジスタもメモリも持たないフレーム
struct NoFrame;

impl FrameAccess for NoFrame {
    fn pc(&self) -> u64 {
        0
    }

    fn load_bias(&self) -> u64 {
        0
    }

    fn register(&self, reg: u16) -> Result<u64> {
        Err(anyhow::anyhow!("Register {} is not available here", reg))
    }

    fn read_memory(&self, addr: u64, _size: usize) -> Result<Vec<u8>> {
        Err(anyhow::anyhow!("Memory at 0x{:x} is not available here", addr))
    }
}

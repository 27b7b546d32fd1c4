//! DWARF解析のユーティリティ関数

use crate::Result;
use gimli::Reader;

/// 関数DIE検索ユーティリティ
pub struct FunctionFinder;

impl FunctionFinder {
    /// PCを含む関数DIEを検索
    ///
    /// # Arguments
    /// * `dwarf` - DWARFコンテキスト
    /// * `unit` - DWARFコンパイルユニット
    /// * `pc` - ファイル上のプログラムカウンタ
    ///
    /// # Returns
    /// 関数DIEのオフセット、見つからない場合はNone
    pub fn find_at_pc<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        pc: u64,
    ) -> Result<Option<gimli::UnitOffset<R::Offset>>> {
        let mut entries = unit.entries();

        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() == gimli::DW_TAG_subprogram && contains_pc(dwarf, unit, entry, pc)? {
                return Ok(Some(entry.offset()));
            }
        }
        Ok(None)
    }
}

/// DIEがアドレス範囲を持っているか（`low_pc` または `ranges`）
pub fn has_ranges<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Result<bool> {
    Ok(entry.attr(gimli::DW_AT_low_pc)?.is_some() || entry.attr(gimli::DW_AT_ranges)?.is_some())
}

/// DIEのアドレス範囲が `pc` を含むか
///
/// `low_pc`/`high_pc` と `DW_AT_ranges` の両方に対応します。
pub fn contains_pc<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
    pc: u64,
) -> Result<bool> {
    let mut ranges = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = ranges.next()? {
        if range.begin <= pc && pc < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// DIEの名前を取得する
///
/// 名前を持たない場合は `DW_AT_abstract_origin` / `DW_AT_specification` を辿ります。
pub fn entry_name<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<Option<String>> {
    if let Some(attr) = entry.attr_value(gimli::DW_AT_name)? {
        let name = dwarf.attr_string(unit, attr)?;
        return Ok(Some(name.to_string_lossy()?.into_owned()));
    }

    for origin in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Some(gimli::AttributeValue::UnitRef(offset)) = entry.attr_value(origin)? {
            let target = unit.entry(offset)?;
            if let Some(attr) = target.attr_value(gimli::DW_AT_name)? {
                let name = dwarf.attr_string(unit, attr)?;
                return Ok(Some(name.to_string_lossy()?.into_owned()));
            }
        }
    }
    Ok(None)
}

/// `DW_AT_type` が指す型DIEのオフセット
///
/// 宣言側にしか型がない場合は `DW_AT_specification` / `DW_AT_abstract_origin` を辿ります。
pub fn type_of<R: Reader>(
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<Option<gimli::UnitOffset<R::Offset>>> {
    if let Some(gimli::AttributeValue::UnitRef(offset)) = entry.attr_value(gimli::DW_AT_type)? {
        return Ok(Some(offset));
    }

    for origin in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
        if let Some(gimli::AttributeValue::UnitRef(offset)) = entry.attr_value(origin)? {
            let target = unit.entry(offset)?;
            if let Some(gimli::AttributeValue::UnitRef(ty)) = target.attr_value(gimli::DW_AT_type)? {
                return Ok(Some(ty));
            }
        }
    }
    Ok(None)
}

//! 変数アドレスの解決
//!
//! 停止中フレームのPCを基準に、ローカル変数（最も内側のスコープを優先）と
//! グローバル変数を探し、変数パスを辿って実行時アドレスを求めます。

use crate::frame::{compute_cfa, FrameAccess};
use crate::loc_eval::{Loc, LocationEvaluator};
use crate::types::{TypeKind, TypeWalker};
use crate::utils::{self, FunctionFinder};
use crate::var_path::{parse_var_path, PathStep, VarPath};
use crate::{DwarfLoader, DwarfReader, Result};
use std::collections::HashMap;
use std::sync::Arc;

type Unit = gimli::Unit<DwarfReader>;

/// 見つかった変数DIE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VariableRef {
    unit: usize,
    offset: gimli::UnitOffset,
}

/// 変数ロケーター
pub struct VariableLocator {
    loader: Arc<DwarfLoader>,
    units: Vec<Unit>,
    /// 名前 → グローバル変数
    globals: HashMap<String, Vec<VariableRef>>,
}

impl VariableLocator {
    /// 変数ロケーターを作成する（全ユニットを解析してグローバル変数を索引化）
    pub fn new(loader: Arc<DwarfLoader>) -> Result<Self> {
        let dwarf = loader.dwarf();
        let mut units = Vec::new();
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            units.push(dwarf.unit(header)?);
        }

        let mut globals: HashMap<String, Vec<VariableRef>> = HashMap::new();
        for (index, unit) in units.iter().enumerate() {
            index_globals(dwarf, unit, index, &mut globals)?;
        }
        tracing::debug!("indexed {} global variable names", globals.len());

        Ok(Self {
            loader,
            units,
            globals,
        })
    }

    pub fn loader(&self) -> &DwarfLoader {
        &self.loader
    }

    /// 変数パスを実行時アドレスに解決する
    ///
    /// 変数が見つからない、メモリ上にない（レジスタ割り当て・最適化で消去）場合は `None` です。
    pub fn resolve(&self, access: &dyn FrameAccess, path: &str) -> Result<Option<u64>> {
        let Some(path) = parse_var_path(path) else {
            return Ok(None);
        };

        let file_pc = access.file_pc();
        if let Some((var, function)) = self.find_local(file_pc, &path.root)? {
            return self.resolve_path(access, var, Some(function), &path);
        }
        if let Some(var) = self.find_global(&path.root) {
            return self.resolve_path(access, var, None, &path);
        }

        tracing::trace!("variable {} not found at 0x{:x}", path.root, file_pc);
        Ok(None)
    }

    /// PCを含む関数の中で、名前が一致する最も内側の変数を探す
    fn find_local(&self, file_pc: u64, name: &str) -> Result<Option<(VariableRef, gimli::UnitOffset)>> {
        let dwarf = self.loader.dwarf();
        for (index, unit) in self.units.iter().enumerate() {
            let Some(function) = FunctionFinder::find_at_pc(dwarf, unit, file_pc)? else {
                continue;
            };
            let mut tree = unit.entries_tree(Some(function))?;
            let found = search_scope(dwarf, unit, tree.root()?, file_pc, name)?;
            return Ok(found.map(|offset| (VariableRef { unit: index, offset }, function)));
        }
        Ok(None)
    }

    fn find_global(&self, name: &str) -> Option<VariableRef> {
        let candidates = self.globals.get(name)?;
        if candidates.len() > 1 {
            tracing::debug!("{} global variables named {}, using the first", candidates.len(), name);
        }
        candidates.first().copied()
    }

    fn resolve_path(
        &self,
        access: &dyn FrameAccess,
        var: VariableRef,
        function: Option<gimli::UnitOffset>,
        path: &VarPath,
    ) -> Result<Option<u64>> {
        let dwarf = self.loader.dwarf();
        let unit = &self.units[var.unit];
        let entry = unit.entry(var.offset)?;

        let Some(loc) = self.evaluate_location(access, unit, &entry, function)? else {
            return Ok(None);
        };
        let Some(mut addr) = loc.address() else {
            tracing::trace!("{} is not in memory: {:?}", path.root, loc);
            return Ok(None);
        };

        let walker = TypeWalker::new(dwarf, unit);
        let mut ty = utils::type_of(unit, &entry)?;

        for step in &path.steps {
            let Some(current) = ty else {
                return Ok(None);
            };
            match step {
                PathStep::Field(name) => {
                    // Rustの参照・ポインタに対する `.` は自動で参照外しする
                    let mut owner = current;
                    if walker.kind(owner)? == TypeKind::Pointer {
                        addr = access.read_pointer(addr)?;
                        let Some(target) = walker.target(owner)? else {
                            return Ok(None);
                        };
                        owner = target;
                    }
                    let Some(member) = walker.member(owner, name)? else {
                        return Ok(None);
                    };
                    addr = addr.wrapping_add(member.offset);
                    ty = member.ty;
                }
                PathStep::PointerField(name) => {
                    if walker.kind(current)? != TypeKind::Pointer {
                        return Ok(None);
                    }
                    let Some(target) = walker.target(current)? else {
                        return Ok(None);
                    };
                    let Some(member) = walker.member(target, name)? else {
                        return Ok(None);
                    };
                    addr = access.read_pointer(addr)?.wrapping_add(member.offset);
                    ty = member.ty;
                }
                PathStep::Index(index) => {
                    let base = match walker.kind(current)? {
                        TypeKind::Array => addr,
                        TypeKind::Pointer => access.read_pointer(addr)?,
                        _ => return Ok(None),
                    };
                    let Some(elem) = walker.target(current)? else {
                        return Ok(None);
                    };
                    let Some(elem_size) = walker.byte_size(elem)? else {
                        return Ok(None);
                    };
                    addr = base.wrapping_add(index * elem_size);
                    ty = Some(elem);
                }
            }
        }

        Ok(Some(addr))
    }

    /// 変数DIEの `DW_AT_location` を評価する
    fn evaluate_location(
        &self,
        access: &dyn FrameAccess,
        unit: &Unit,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        function: Option<gimli::UnitOffset>,
    ) -> Result<Option<Loc>> {
        let dwarf = self.loader.dwarf();
        let Some(expr) = location_expression(dwarf, unit, entry, access.file_pc())? else {
            return Ok(None);
        };

        let cfa = compute_cfa(&self.loader, access).ok();
        let frame_base = match function {
            Some(function) => self.frame_base(access, unit, function, cfa)?,
            None => None,
        };

        let loc = LocationEvaluator::new(expr, unit.encoding())
            .with_frame_base(frame_base)
            .with_cfa(cfa)
            .evaluate(access, |index| Ok(dwarf.address(unit, index)?))?;
        Ok(Some(loc))
    }

    /// 関数の `DW_AT_frame_base` を評価する
    fn frame_base(
        &self,
        access: &dyn FrameAccess,
        unit: &Unit,
        function: gimli::UnitOffset,
        cfa: Option<u64>,
    ) -> Result<Option<u64>> {
        let dwarf = self.loader.dwarf();
        let entry = unit.entry(function)?;
        let Some(gimli::AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_frame_base)? else {
            return Ok(None);
        };

        let loc = LocationEvaluator::new(expr, unit.encoding())
            .with_cfa(cfa)
            .evaluate(access, |index| Ok(dwarf.address(unit, index)?))?;
        match loc {
            Loc::Reg { reg } => Ok(Some(access.register(reg)?)),
            Loc::Addr { addr, .. } => Ok(Some(addr)),
            Loc::Value(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }
}

/// 変数DIEの位置式を取り出す（ロケーションリストの場合はPCに該当する式）
fn location_expression(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &Unit,
    entry: &gimli::DebuggingInformationEntry<DwarfReader>,
    file_pc: u64,
) -> Result<Option<gimli::Expression<DwarfReader>>> {
    let Some(value) = entry.attr_value(gimli::DW_AT_location)? else {
        return Ok(None);
    };
    if let gimli::AttributeValue::Exprloc(expr) = value {
        return Ok(Some(expr));
    }

    let Some(mut locations) = dwarf.attr_locations(unit, value)? else {
        return Ok(None);
    };
    while let Some(location) = locations.next()? {
        if location.range.begin <= file_pc && file_pc < location.range.end {
            return Ok(Some(location.data));
        }
    }
    Ok(None)
}

/// スコープ内で名前が一致する変数を探す（PCを含むネストしたスコープを優先）
fn search_scope(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &Unit,
    node: gimli::EntriesTreeNode<'_, '_, '_, DwarfReader>,
    file_pc: u64,
    name: &str,
) -> Result<Option<gimli::UnitOffset>> {
    let mut here = None;
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                if utils::entry_name(dwarf, unit, entry)?.as_deref() == Some(name) {
                    here = Some(entry.offset());
                }
            }
            gimli::DW_TAG_lexical_block | gimli::DW_TAG_inlined_subroutine => {
                let inside = !utils::has_ranges(entry)? || utils::contains_pc(dwarf, unit, entry, file_pc)?;
                if inside {
                    if let Some(found) = search_scope(dwarf, unit, child, file_pc, name)? {
                        return Ok(Some(found));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(here)
}

/// 関数の外側にある、位置を持つ変数を索引に登録する
fn index_globals(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &Unit,
    index: usize,
    globals: &mut HashMap<String, Vec<VariableRef>>,
) -> Result<()> {
    let mut depth: isize = 0;
    let mut subprogram_depth: Option<isize> = None;
    let mut entries = unit.entries();

    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        if subprogram_depth.is_some_and(|d| depth <= d) {
            subprogram_depth = None;
        }

        match entry.tag() {
            gimli::DW_TAG_subprogram if subprogram_depth.is_none() => {
                subprogram_depth = Some(depth);
            }
            gimli::DW_TAG_variable if subprogram_depth.is_none() => {
                if entry.attr(gimli::DW_AT_location)?.is_none() {
                    continue;
                }
                if let Some(name) = utils::entry_name(dwarf, unit, entry)? {
                    globals.entry(name).or_default().push(VariableRef {
                        unit: index,
                        offset: entry.offset(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

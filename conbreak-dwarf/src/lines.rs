//! ソース行情報
//!
//! `file:line` からブレークポイントを置くアドレスへの変換と、
//! アドレスから `file:line` への変換を提供します。

use crate::{DwarfLoader, DwarfReader, Result};
use gimli::Reader;
use std::path::{Component, Path, PathBuf};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// 行テーブルの1行（その行の命令列の先頭）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRow {
    /// ファイル上のアドレス（PIEの場合はロードバイアスを含まない）
    pub address: u64,
    pub file: String,
    pub line: u32,
}

/// 全コンパイルユニットの行テーブル
#[derive(Debug, Default)]
pub struct LineTable {
    rows: Vec<LineRow>,
}

impl LineTable {
    /// DWARFの行番号プログラムから行テーブルを構築する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.dwarf();
        let mut rows = Vec::new();

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut program_rows = program.rows();
            let mut previous: Option<(u64, u64)> = None;
            while let Some((header, row)) = program_rows.next_row()? {
                if row.end_sequence() {
                    previous = None;
                    continue;
                }
                let Some(line) = row.line() else {
                    previous = None;
                    continue;
                };

                // 同じ行が続く場合は先頭の命令だけを使う
                let key = (row.file_index(), line.get());
                let starts_line = previous != Some(key);
                previous = Some(key);
                if !starts_line || !row.is_stmt() {
                    continue;
                }

                let Some(file) = row.file(header) else {
                    continue;
                };
                let path = file_path(dwarf, &unit, header, file)?;
                rows.push(LineRow {
                    address: row.address(),
                    file: path,
                    line: line.get() as u32,
                });
            }
        }

        tracing::debug!("line table has {} rows", rows.len());
        Ok(Self { rows })
    }

    /// 行を直接指定して作成する
    pub fn from_rows(rows: Vec<LineRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[LineRow] {
        &self.rows
    }

    /// `file:line` にブレークポイントを置くべきアドレスを求める
    ///
    /// その行にコードがない場合は、同じファイルで直後にコードを持つ行を使います。
    pub fn breakpoint_addresses(&self, file: &str, line: u32) -> Vec<u64> {
        let in_file: Vec<&LineRow> = self
            .rows
            .iter()
            .filter(|row| path_ends_with(&row.file, file))
            .collect();

        let target = if in_file.iter().any(|row| row.line == line) {
            line
        } else {
            match in_file.iter().map(|row| row.line).filter(|l| *l > line).min() {
                Some(next) => {
                    tracing::warn!("{}:{} has no code, moving breakpoint to line {}", file, line, next);
                    next
                }
                None => return Vec::new(),
            }
        };

        let mut addresses: Vec<u64> = in_file
            .iter()
            .filter(|row| row.line == target)
            .map(|row| row.address)
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// パスの末尾が `file` に一致する、行テーブル上のファイルパス
    pub fn find_file(&self, file: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|row| path_ends_with(&row.file, file))
            .map(|row| row.file.as_str())
    }
}

/// アドレスからソース行情報を取得する
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfReader>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.load_dwarf_copy()?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build addr2line context: {}", e))?;
        Ok(Self { context })
    }

    /// ファイル上のアドレスからソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self.context.find_location(addr)?;
        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}

/// `candidate` の末尾のパス要素が `wanted` と一致するか
///
/// 先頭の `./` は無視します。
pub fn path_ends_with(candidate: &str, wanted: &str) -> bool {
    let wanted = normalize(wanted);
    if wanted.as_os_str().is_empty() {
        return false;
    }
    normalize(candidate).ends_with(&wanted)
}

fn normalize(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// 行番号プログラムのファイルエントリからパスを組み立てる
fn file_path<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    header: &gimli::LineProgramHeader<R>,
    file: &gimli::FileEntry<R>,
) -> Result<String> {
    let name = dwarf.attr_string(unit, file.path_name())?;
    let name = name.to_string_lossy()?;
    if Path::new(name.as_ref()).is_absolute() {
        return Ok(name.into_owned());
    }

    let mut path = PathBuf::new();
    if let Some(comp_dir) = &unit.comp_dir {
        path.push(comp_dir.to_string_lossy()?.as_ref());
    }
    if let Some(dir) = file.directory(header) {
        let dir = dwarf.attr_string(unit, dir)?;
        // 絶対パスなら comp_dir を置き換える
        path.push(dir.to_string_lossy()?.as_ref());
    }
    path.push(name.as_ref());
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: u64, file: &str, line: u32) -> LineRow {
        LineRow {
            address,
            file: file.to_string(),
            line,
        }
    }

    fn table() -> LineTable {
        LineTable::from_rows(vec![
            row(0x1000, "/build/src/main.rs", 10),
            row(0x1010, "/build/src/main.rs", 12),
            row(0x1040, "/build/src/main.rs", 12),
            row(0x2000, "/build/src/worker.rs", 10),
        ])
    }

    #[test]
    fn test_breakpoint_addresses_exact() {
        let table = table();
        assert_eq!(table.breakpoint_addresses("src/main.rs", 10), vec![0x1000]);
        assert_eq!(table.breakpoint_addresses("main.rs", 12), vec![0x1010, 0x1040]);
        assert_eq!(table.breakpoint_addresses("worker.rs", 10), vec![0x2000]);
    }

    #[test]
    fn test_breakpoint_addresses_next_line() {
        let table = table();
        assert_eq!(table.breakpoint_addresses("main.rs", 11), vec![0x1010, 0x1040]);
        assert!(table.breakpoint_addresses("main.rs", 13).is_empty());
        assert!(table.breakpoint_addresses("other.rs", 10).is_empty());
    }

    #[test]
    fn test_path_ends_with() {
        assert!(path_ends_with("/build/src/main.rs", "./src/main.rs"));
        assert!(path_ends_with("/build/src/main.rs", "main.rs"));
        assert!(!path_ends_with("/build/src/xmain.rs", "main.rs"));
        assert!(!path_ends_with("/build/src/main.rs", ""));
        assert_eq!(table().find_file("worker.rs"), Some("/build/src/worker.rs"));
    }
}

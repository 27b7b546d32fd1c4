//! 正規化済みレースレポートの読み込み
//!
//! レポートは `SYMBOL (FILE:LINE)` 形式の行からなり、1行目が書き込み側、
//! 2行目が読み込み側です。各行のソーステキストはソースツリーから取得します。

use crate::{RaceDescriptor, RaceLocation, ReportError};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// シンボリックリンクのループに備えた探索深さの上限
const MAX_SEARCH_DEPTH: usize = 32;

/// レポートの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub symbol: String,
    pub file: String,
    pub line: u32,
}

fn entry_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(.*?)\s*\(([A-Za-z0-9_~./\-]+):([0-9]+)(?::[0-9]+)?\)").ok())
        .as_ref()
}

/// レポートの1行を解析する
///
/// 列番号（`FILE:LINE:COL`）は無視します。
pub fn parse_report_line(text: &str) -> Option<ReportEntry> {
    let caps = entry_regex()?.captures(text)?;
    let line = caps[3].parse::<u32>().ok()?;
    Some(ReportEntry {
        symbol: caps[1].to_string(),
        file: caps[2].to_string(),
        line,
    })
}

/// レポート全体を解析する
///
/// 空行は読み飛ばします。書き込み側と読み込み側の2行が必要で、
/// 3行目以降は無視します。
pub fn parse_report(text: &str) -> Result<(ReportEntry, ReportEntry), ReportError> {
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let entry = parse_report_line(raw).ok_or_else(|| ReportError::Unparsable {
            line_no: idx + 1,
            text: raw.to_string(),
        })?;
        entries.push(entry);
    }

    if entries.len() > 2 {
        tracing::warn!("report has {} locations, using the first two", entries.len());
    }

    let mut iter = entries.into_iter();
    match (iter.next(), iter.next()) {
        (Some(write), Some(read)) => Ok((write, read)),
        (first, _) => Err(ReportError::MissingLocations {
            found: usize::from(first.is_some()),
        }),
    }
}

/// レポートファイルを読み込み、ソーステキスト付きのレース記述を作る
///
/// `lookup` は `(file, line)` のソーステキストを返す関数です。
pub fn load_race<F>(report: &Path, lookup: F) -> Result<RaceDescriptor, ReportError>
where
    F: Fn(&str, u32) -> Option<String>,
{
    let text = fs::read_to_string(report).map_err(|source| ReportError::Io {
        path: report.to_path_buf(),
        source,
    })?;
    let (write, read) = parse_report(&text)?;

    let locate = |entry: ReportEntry| -> Result<RaceLocation, ReportError> {
        let source_text = lookup(&entry.file, entry.line).ok_or_else(|| ReportError::SourceUnavailable {
            file: entry.file.clone(),
            line: entry.line,
        })?;
        Ok(RaceLocation::new(entry.file, entry.line, source_text))
    };

    Ok(RaceDescriptor::new(locate(write)?, locate(read)?))
}

/// ソースコードのディレクトリ
///
/// 対象プログラムのソースへのシンボリックリンク（既定では `source_code`）を想定します。
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    /// ソースツリーを作成する
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// ルートディレクトリ
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// パスの末尾が `file` に一致する最初のファイルを探す
    pub fn find(&self, file: &str) -> Option<PathBuf> {
        let wanted = RaceLocation::new(file, 0, "");
        let mut stack = vec![(self.root.clone(), 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            let mut entries: Vec<PathBuf> = match fs::read_dir(&dir) {
                Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
                Err(_) => continue,
            };
            entries.sort();

            for path in entries {
                // fs::metadata はシンボリックリンクを辿る
                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                if meta.is_dir() {
                    if depth < MAX_SEARCH_DEPTH {
                        stack.push((path, depth + 1));
                    }
                } else if wanted.matches_file(&path.to_string_lossy()) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// `file` の `line` 行目（1始まり）のテキストを取得する
    pub fn line_text(&self, file: &str, line: u32) -> Result<String, ReportError> {
        let unavailable = || ReportError::SourceUnavailable {
            file: file.to_string(),
            line,
        };

        let path = self.find(file).ok_or_else(unavailable)?;
        let text = fs::read_to_string(&path).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;

        let idx = (line as usize).checked_sub(1).ok_or_else(unavailable)?;
        text.lines()
            .nth(idx)
            .map(|s| s.to_string())
            .ok_or_else(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_line() {
        let entry = parse_report_line("do_write (src/file1.c:10)").unwrap();
        assert_eq!(entry.symbol, "do_write");
        assert_eq!(entry.file, "src/file1.c");
        assert_eq!(entry.line, 10);

        let with_col = parse_report_line("reader (./file2.c:20:5)").unwrap();
        assert_eq!(with_col.file, "./file2.c");
        assert_eq!(with_col.line, 20);

        assert!(parse_report_line("no location here").is_none());
        assert!(parse_report_line("f (file.c:)").is_none());
    }

    #[test]
    fn test_parse_report_order() {
        let (write, read) = parse_report("w (a.c:1)\n\nr (b.c:2)\nextra (c.c:3)\n").unwrap();
        assert_eq!(write.file, "a.c");
        assert_eq!(read.file, "b.c");
    }

    #[test]
    fn test_parse_report_errors() {
        match parse_report("w (a.c:1)\n") {
            Err(ReportError::MissingLocations { found }) => assert_eq!(found, 1),
            other => panic!("Expected MissingLocations, got {:?}", other),
        }
        match parse_report("w (a.c:1)\ngarbage\n") {
            Err(ReportError::Unparsable { line_no, .. }) => assert_eq!(line_no, 2),
            other => panic!("Expected Unparsable, got {:?}", other),
        }
        assert!(matches!(
            parse_report(""),
            Err(ReportError::MissingLocations { found: 0 })
        ));
    }

    #[test]
    fn test_source_tree_line_text() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("lib").join("core");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("items.c"), "int a;\n  counter++;\nreturn;\n").unwrap();

        let tree = SourceTree::new(dir.path());
        assert_eq!(tree.line_text("items.c", 2).unwrap(), "  counter++;");
        assert_eq!(tree.line_text("core/items.c", 1).unwrap(), "int a;");
        assert!(tree.line_text("items.c", 0).is_err());
        assert!(tree.line_text("items.c", 9).is_err());
        assert!(tree.line_text("other/items.c", 1).is_err());
    }

    #[test]
    fn test_load_race() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.txt");
        fs::write(&report, "w (a.c:1)\nr (b.c:2)\n").unwrap();

        let race = load_race(&report, |file, line| Some(format!("{}#{}", file, line))).unwrap();
        assert_eq!(race.write.source_text, "a.c#1");
        assert_eq!(race.read.line, 2);

        let missing = load_race(&report, |_, _| None);
        assert!(matches!(missing, Err(ReportError::SourceUnavailable { .. })));
    }
}

//! レース位置（Race Descriptor）

use std::fmt;
use std::path::{Component, Path};

/// アクセスの種類
///
/// レポートの1行目が書き込み側、2行目が読み込み側という固定の規約に従います。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessKind {
    Write,
    Read,
}

impl AccessKind {
    /// ログ出力用のラベル
    pub fn label(self) -> &'static str {
        match self {
            AccessKind::Write => "WRITE",
            AccessKind::Read => "READ",
        }
    }

    /// 1文字の略号（W / R）
    pub fn letter(self) -> char {
        match self {
            AccessKind::Write => 'W',
            AccessKind::Read => 'R',
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// レースの片側のソース位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceLocation {
    /// レポートに書かれたファイルパス
    pub file: String,
    /// 行番号（1始まり）
    pub line: u32,
    /// その行のソーステキスト（アドレス解決に使う）
    pub source_text: String,
}

impl RaceLocation {
    /// レース位置を作成する
    pub fn new(file: impl Into<String>, line: u32, source_text: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            source_text: source_text.into(),
        }
    }

    /// 同じ `file:line` を指しているか
    pub fn same_site(&self, other: &RaceLocation) -> bool {
        self.line == other.line && normalize(&self.file) == normalize(&other.file)
    }

    /// デバッグ情報上のファイルパスがこの位置のファイルを指しているか
    ///
    /// レポート側は相対パスやファイル名のみのことが多いため、末尾一致で判定します。
    pub fn matches_file(&self, path: &str) -> bool {
        let wanted = normalize(&self.file);
        if wanted.is_empty() {
            return false;
        }
        let candidate = normalize(path);
        Path::new(&candidate).ends_with(Path::new(&wanted))
    }
}

impl fmt::Display for RaceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// 先頭の `./` などを取り除いたパス文字列
fn normalize(path: &str) -> String {
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect::<std::path::PathBuf>()
        .to_string_lossy()
        .into_owned()
}

/// 1セッション分のレース記述（書き込み側と読み込み側）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceDescriptor {
    pub write: RaceLocation,
    pub read: RaceLocation,
}

impl RaceDescriptor {
    /// レース記述を作成する
    pub fn new(write: RaceLocation, read: RaceLocation) -> Self {
        Self { write, read }
    }

    /// 両側が同じ位置を指しており、物理的なブレークポイントが1つで済むか
    pub fn shared_site(&self) -> bool {
        self.write.same_site(&self.read)
    }

    /// アクセス種別に対応する位置を取得する
    pub fn location(&self, kind: AccessKind) -> &RaceLocation {
        match kind {
            AccessKind::Write => &self.write,
            AccessKind::Read => &self.read,
        }
    }

    /// スレッドが実際に停止している行からアクセス種別を判定する
    ///
    /// どちらのブレークポイントが発火したかではなく、停止行で判定します。
    /// 行番号とファイルの両方が一致する側を優先し、ファイル情報が
    /// 一致しない場合は行番号のみで判定します。
    pub fn kind_at(&self, file: Option<&str>, line: Option<u32>) -> Option<AccessKind> {
        let line = line?;
        let sides = [AccessKind::Write, AccessKind::Read];

        if let Some(file) = file {
            let exact = sides.iter().copied().find(|kind| {
                let loc = self.location(*kind);
                loc.line == line && loc.matches_file(file)
            });
            if exact.is_some() {
                return exact;
            }
        }

        sides
            .iter()
            .copied()
            .find(|kind| self.location(*kind).line == line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race() -> RaceDescriptor {
        RaceDescriptor::new(
            RaceLocation::new("src/file1.c", 10, "counter++;"),
            RaceLocation::new("file2.c", 20, "x = counter;"),
        )
    }

    #[test]
    fn test_kind_at_by_line() {
        let race = race();
        assert_eq!(race.kind_at(None, Some(10)), Some(AccessKind::Write));
        assert_eq!(race.kind_at(None, Some(20)), Some(AccessKind::Read));
        assert_eq!(race.kind_at(None, Some(30)), None);
        assert_eq!(race.kind_at(None, None), None);
    }

    #[test]
    fn test_kind_at_prefers_file_match() {
        let race = RaceDescriptor::new(
            RaceLocation::new("a.c", 7, "g = 1;"),
            RaceLocation::new("b.c", 7, "y = g;"),
        );
        assert_eq!(race.kind_at(Some("/home/u/proj/b.c"), Some(7)), Some(AccessKind::Read));
        assert_eq!(race.kind_at(Some("/home/u/proj/a.c"), Some(7)), Some(AccessKind::Write));
        assert_eq!(race.kind_at(Some("/elsewhere/c.c"), Some(7)), Some(AccessKind::Write));
    }

    #[test]
    fn test_matches_file() {
        let loc = RaceLocation::new("./src/file1.c", 10, "");
        assert!(loc.matches_file("/build/proj/src/file1.c"));
        assert!(!loc.matches_file("/build/proj/src/xfile1.c"));
        assert!(!loc.matches_file("/build/proj/other/file1.c"));
    }

    #[test]
    fn test_shared_site() {
        assert!(!race().shared_site());
        let same = RaceDescriptor::new(
            RaceLocation::new("./f.c", 3, "n++;"),
            RaceLocation::new("f.c", 3, "n++;"),
        );
        assert!(same.shared_site());
    }
}

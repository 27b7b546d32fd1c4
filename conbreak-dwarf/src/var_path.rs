//! 変数パスのパース
//!
//! `counter`, `state.total`, `node->next`, `slots[3]` のような
//! ソース行のトークンを、ルート変数とアクセス手順に分解します。

/// アクセス手順
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// `.field`
    Field(String),
    /// `->field`
    PointerField(String),
    /// `[index]`
    Index(u64),
}

/// 変数パス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    pub root: String,
    pub steps: Vec<PathStep>,
}

/// 変数パスをパースする
///
/// 識別子として読めないトークン（数値リテラル、演算子など）は `None` を返します。
pub fn parse_var_path(input: &str) -> Option<VarPath> {
    let input = input.trim();
    let (root, mut rest) = take_ident(input)?;
    let mut steps = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("->") {
            let (field, tail) = take_ident(after)?;
            steps.push(PathStep::PointerField(field.to_string()));
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('.') {
            let (field, tail) = take_field(after)?;
            steps.push(PathStep::Field(field.to_string()));
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let index = after[..close].trim().parse::<u64>().ok()?;
            steps.push(PathStep::Index(index));
            rest = &after[close + 1..];
        } else {
            return None;
        }
    }

    Some(VarPath {
        root: root.to_string(),
        steps,
    })
}

/// 先頭の識別子を切り出す
fn take_ident(input: &str) -> Option<(&str, &str)> {
    let first = input.chars().next()?;
    if !(first.is_alphabetic() || first == '_') {
        return None;
    }
    let end = input
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    Some((&input[..end], &input[end..]))
}

/// フィールド名を切り出す（Rustのタプルフィールド `.0` も許可）
fn take_field(input: &str) -> Option<(&str, &str)> {
    if input.starts_with(|c: char| c.is_ascii_digit()) {
        let end = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        return Some((&input[..end], &input[end..]));
    }
    take_ident(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variable() {
        let path = parse_var_path("counter").unwrap();
        assert_eq!(path.root, "counter");
        assert!(path.steps.is_empty());
    }

    #[test]
    fn test_parse_steps() {
        let path = parse_var_path("node->next.value[2]").unwrap();
        assert_eq!(path.root, "node");
        assert_eq!(
            path.steps,
            vec![
                PathStep::PointerField("next".to_string()),
                PathStep::Field("value".to_string()),
                PathStep::Index(2),
            ]
        );

        let tuple = parse_var_path("pair.0").unwrap();
        assert_eq!(tuple.steps, vec![PathStep::Field("0".to_string())]);
    }

    #[test]
    fn test_parse_rejects_non_identifiers() {
        assert!(parse_var_path("1").is_none());
        assert!(parse_var_path("").is_none());
        assert!(parse_var_path("a[i]").is_none());
        assert!(parse_var_path("a+b").is_none());
        assert!(parse_var_path("s.").is_none());
    }
}

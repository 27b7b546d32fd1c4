//! アドレス解決（Address Resolver）
//!
//! ソース行をトークンに分割し、各トークンを停止フレームの変数として解決します。
//! 構文解析ではなくヒューリスティックです。無関係な変数を拾うことがありますが、
//! 誤検出は一致判定側のアドレス比較で除外されます。

use crate::{Address, Frame, ResolutionError};
use std::collections::BTreeSet;

/// トークンの区切り文字
const DELIMITERS: &[char] = &[' ', '\n', '\t', ',', ';', '(', ')', '='];

/// オペランド名を残すために取り除く演算子
const STRIPPED_OPERATORS: &[&str] = &["++", "--", "!", "*", "&"];

/// ソース行を変数名の候補に分割する
pub fn tokenize(source_line: &str) -> Vec<String> {
    source_line
        .split(DELIMITERS)
        .map(|raw| {
            let mut token: String = raw.chars().filter(|c| !c.is_control()).collect();
            for op in STRIPPED_OPERATORS {
                token = token.replace(op, "");
            }
            token
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// アドレス解決の戦略
pub trait AddressResolver: Send {
    /// `source_line` が参照する変数のアドレス集合を返す
    ///
    /// 1つも解決できなかった場合はエラーです。
    fn resolve(&self, frame: &dyn Frame, source_line: &str) -> Result<BTreeSet<Address>, ResolutionError>;
}

/// トークン分割による既定の解決戦略
///
/// 解決できないトークンは黙って捨てます。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenResolver;

impl AddressResolver for TokenResolver {
    fn resolve(&self, frame: &dyn Frame, source_line: &str) -> Result<BTreeSet<Address>, ResolutionError> {
        let addresses: BTreeSet<Address> = tokenize(source_line)
            .iter()
            .filter_map(|token| {
                let addr = frame.resolve_variable(token);
                tracing::trace!("token {:?} -> {:?}", token, addr);
                addr
            })
            .collect();

        if addresses.is_empty() {
            return Err(ResolutionError::NoAddresses {
                source_line: source_line.to_string(),
            });
        }
        Ok(addresses)
    }
}

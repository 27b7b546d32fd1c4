//! conbreak DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! ソース行からブレークポイントアドレスへの変換、アドレスからソース行への変換、
//! 変数パスから実行時アドレスへの解決などを行います。

pub mod frame;
pub mod lines;
pub mod loader;
pub mod loc_eval;
pub mod types;
pub mod utils;
pub mod var_path;
pub mod variables;

pub use frame::{compute_cfa, FrameAccess};
pub use lines::{path_ends_with, LineInfo, LineInfoProvider, LineRow, LineTable};
pub use loader::{DwarfLoader, DwarfReader};
pub use loc_eval::{Loc, LocationEvaluator};
pub use types::{TypeKind, TypeWalker};
pub use utils::FunctionFinder;
pub use var_path::{parse_var_path, PathStep, VarPath};
pub use variables::VariableLocator;

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;

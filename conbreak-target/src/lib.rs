//! conbreak ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント設定などを行い、
//! それらをまとめてスケジューラ用の [`PtraceSubstrate`] として公開します。

pub mod breakpoint;
pub mod frame;
pub mod memory;
pub mod process;
pub mod registers;
pub mod substrate;
pub mod thread;

pub use breakpoint::{BreakpointTable, SoftwareBreakpoint};
pub use frame::PtraceFrame;
pub use memory::{Memory, MemoryMapping};
pub use process::{Origin, Process, WaitEvent};
pub use registers::Registers;
pub use substrate::PtraceSubstrate;
pub use thread::Thread;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;

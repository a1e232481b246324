//! Tsubaki ターゲットプロセスアクセス
//!
//! このクレートは、検査対象プロセスへの低レベルアクセスを提供します。
//! メモリ読み書き、ptraceによるプロセス制御、レジスタアクセス、
//! モジュールマップ、スクラッチ領域アロケータ、およびテスト用の
//! 合成ターゲットを含みます。

pub mod breakpoint;
pub mod error;
pub mod fake;
pub mod memory;
pub mod module;
pub mod process;
pub mod registers;
pub mod scratch;
pub mod symbols;
pub mod thread;

pub use breakpoint::SoftwareBreakpoint;
pub use error::TargetError;
pub use fake::FakeTarget;
pub use memory::{MemoryReadable, ProcessMemory, TargetAccess, TargetAccessExt};
pub use module::{ModuleKind, ModuleMap, TargetModule};
pub use process::{Process, StopReason};
pub use registers::Registers;
pub use scratch::ScratchArena;
pub use symbols::ImageSymbols;
pub use thread::{Thread, ThreadId};

/// ターゲットアクセスの結果型
pub type Result<T> = std::result::Result<T, TargetError>;

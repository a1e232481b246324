//! Tsubaki デバッガのコア機能
//!
//! このクレートは、検査対象プロセスの制御ロジックを統合します。
//! ブレークポイント表のターゲットメモリへのミラーリング、ゲート関数を
//! 使ったステップ実行の調停、式評価のタイムアウト制御、遅延参照カウント
//! 解放を提供します。

pub mod breakpoints;
pub mod command;
pub mod debugger;
pub mod disasm;
pub mod errors;
pub mod eval;
pub mod gates;
pub mod helper;
pub mod options;
pub mod release;
pub mod session;
pub mod stepping;

pub use breakpoints::{BreakpointBlob, BreakpointId, BreakpointTable};
pub use command::Command;
pub use debugger::Debugger;
pub use errors::CoreError;
pub use eval::{EvalEngine, EvalOutcome, ExecutionControl};
pub use gates::{ArgSource, GateArgs, GateSpec, GATE_TABLE};
pub use helper::HelperExports;
pub use options::{InspectorOptions, OptionsHandle};
pub use release::DecrefQueue;
pub use session::DebugSession;
pub use stepping::{StepDeps, StepKind, StepPhase, SteppingCoordinator};

// 他のクレートから使用するために再エクスポート
pub use tsubaki_bus::SourceLocation;
pub use tsubaki_target::StopReason;

/// コアの結果型
pub type Result<T> = anyhow::Result<T>;

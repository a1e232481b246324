//! Tsubaki コールスタック縫合
//!
//! ネイティブのスタックウォーク結果とインタプリタのフレームチェインを
//! 突き合わせ、1本の混在コールスタックに縫合します。評価ループの
//! ネイティブフレームはインタプリタフレームに置き換えられ、
//! ネイティブ区間との境界には遷移マーカーが挿入されます。

pub mod resolver;
pub mod stitcher;
pub mod walk;

pub use resolver::{display_symbol, ThreadFrameResolver};
pub use walk::{walk_native_stack, NativeSymbolizer};
pub use stitcher::{
    is_eval_frame, FrameResolver, NativeFrame, PythonFrameInfo, StackStitcher, StitchOptions,
    StitchedFrame, EVAL_FRAME_SYMBOLS,
};

/// スタック縫合の結果型
pub type Result<T> = anyhow::Result<T>;

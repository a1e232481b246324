//! フレームリゾルバ
//!
//! スレッドのインタプリタフレームチェインを上から順に消費し、
//! 評価ループのネイティブフレームに対応づけます。評価ループの
//! ネイティブフレームは最新側から並ぶため、チェインも最新側から
//! 消費すれば順序が一致します。

use crate::stitcher::{FrameResolver, NativeFrame, PythonFrameInfo};
use tsubaki_proxy::structs::PyFrame;

/// スレッドのフレームチェインに基づくリゾルバ
///
/// 1回のスタックウォークにつき1インスタンスを作り、使い捨てます。
pub struct ThreadFrameResolver {
    frames: std::collections::VecDeque<PyFrame>,
}

impl ThreadFrameResolver {
    /// 最新フレームからチェインを収集してリゾルバを作る
    pub fn from_top_frame(top: Option<PyFrame>) -> Self {
        let mut frames = std::collections::VecDeque::new();
        if let Some(top) = top {
            match top.chain() {
                Ok(chain) => frames.extend(chain),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to walk interpreter frame chain");
                }
            }
        }
        Self { frames }
    }

    /// 残っている未対応フレーム数
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameResolver for ThreadFrameResolver {
    fn resolve_eval_frame(&mut self, _frame: &NativeFrame) -> Option<PythonFrameInfo> {
        let frame = self.frames.pop_front()?;
        let code = match frame.code() {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!(error = %e, "frame has unreadable code object");
                return None;
            }
        };
        let function = code.name().ok()?;
        let file = code.filename().ok()?;
        let line = frame.line_number().unwrap_or(0);
        Some(PythonFrameInfo {
            function,
            file,
            line,
            frame_address: frame.address(),
        })
    }
}

/// ネイティブシンボル名を表示用に整形する
///
/// Rust由来のシンボルはデマングルし、それ以外はそのまま返します。
pub fn display_symbol(raw: &str) -> String {
    let demangled = rustc_demangle::demangle(raw).to_string();
    if demangled != raw {
        demangled
    } else {
        raw.to_string()
    }
}

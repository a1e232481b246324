//! スタック縫合の状態機械
//!
//! ネイティブスタックを上（最新）から下へ1フレームずつ受け取り、
//! 縫合済みフレーム列を出力します。直前に出力したフレームの種類を
//! 状態として持ち、インタプリタ区間とネイティブ区間の境界で
//! 遷移マーカーを挿入します。
//!
//! 評価ループフレームの解決に失敗した場合は、そのフレームを
//! 生のネイティブフレームとして出力します（スタック全体を
//! 失敗させない）。

use tsubaki_target::ModuleKind;

/// 評価ループのエントリ関数名
///
/// この名前のインタプリタモジュール内フレームだけが
/// インタプリタフレームへの置き換え対象になります。
pub const EVAL_FRAME_SYMBOLS: &[&str] = &["_PyEval_EvalFrameDefault", "PyEval_EvalFrameEx"];

/// フレームが評価ループのエントリかどうか
pub fn is_eval_frame(frame: &NativeFrame) -> bool {
    frame.module == ModuleKind::Interpreter
        && frame
            .symbol
            .as_deref()
            .map(|s| EVAL_FRAME_SYMBOLS.iter().any(|e| s.contains(e)))
            .unwrap_or(false)
}

/// スタックウォークから得た1ネイティブフレーム
#[derive(Debug, Clone)]
pub struct NativeFrame {
    pub instruction_pointer: u64,
    pub frame_base: u64,
    pub module: ModuleKind,
    pub symbol: Option<String>,
}

/// 縫合で解決されたインタプリタフレームの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonFrameInfo {
    pub function: String,
    pub file: String,
    pub line: i32,
    pub frame_address: u64,
}

/// 縫合済みスタックの1フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StitchedFrame {
    /// インタプリタフレーム
    Python(PythonFrameInfo),
    /// 外部ネイティブコードのフレーム
    Native {
        instruction_pointer: u64,
        symbol: Option<String>,
        module: ModuleKind,
    },
    /// インタプリタ区間 → ネイティブ区間 の境界
    TransitionToNative,
    /// ネイティブ区間 → インタプリタ区間 の境界
    TransitionToPython,
}

/// 評価ループフレームをインタプリタフレームに解決する
///
/// 実装はスレッドのフレームチェインを上から順に消費します。
pub trait FrameResolver {
    fn resolve_eval_frame(&mut self, frame: &NativeFrame) -> Option<PythonFrameInfo>;
}

/// 縫合オプション
#[derive(Debug, Clone, Copy, Default)]
pub struct StitchOptions {
    /// 外部ネイティブフレームを出力しない（遷移マーカーは残す）
    pub hide_native_frames: bool,
    /// インタプリタ内部のフレームも出力する
    pub show_interpreter_internals: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Unknown,
    LastWasNative,
    LastWasInterpreted,
}

/// スタック縫合の状態機械
pub struct StackStitcher<R: FrameResolver> {
    resolver: R,
    options: StitchOptions,
    state: WalkState,
}

impl<R: FrameResolver> StackStitcher<R> {
    /// 縫合を開始する（1回のスタックウォークにつき1インスタンス）
    pub fn new(resolver: R, options: StitchOptions) -> Self {
        Self {
            resolver,
            options,
            state: WalkState::Unknown,
        }
    }

    /// ネイティブフレームを1つ受け取り、出力フレーム列を返す
    pub fn feed(&mut self, frame: &NativeFrame) -> Vec<StitchedFrame> {
        match frame.module {
            ModuleKind::Interpreter if self.is_eval_frame(frame) => {
                match self.resolver.resolve_eval_frame(frame) {
                    Some(info) => self.emit_python(info),
                    None => {
                        // 解決失敗: 生のネイティブフレームに格下げ
                        tracing::warn!(
                            ip = format_args!("0x{:x}", frame.instruction_pointer),
                            "eval frame resolution failed; emitting raw native frame"
                        );
                        self.emit_native(frame)
                    }
                }
            }
            ModuleKind::Interpreter | ModuleKind::Helper => {
                // インタプリタ内部とヘルパーのフレームは通常隠す
                if self.options.show_interpreter_internals {
                    self.emit_native(frame)
                } else {
                    Vec::new()
                }
            }
            ModuleKind::Other => self.emit_native(frame),
        }
    }

    /// ネイティブスタック全体を一括で縫合する
    pub fn stitch_all(mut self, frames: &[NativeFrame]) -> Vec<StitchedFrame> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend(self.feed(frame));
        }
        out
    }

    fn is_eval_frame(&self, frame: &NativeFrame) -> bool {
        is_eval_frame(frame)
    }

    fn emit_python(&mut self, info: PythonFrameInfo) -> Vec<StitchedFrame> {
        let mut out = Vec::new();
        if self.state == WalkState::LastWasNative {
            out.push(StitchedFrame::TransitionToPython);
        }
        out.push(StitchedFrame::Python(info));
        self.state = WalkState::LastWasInterpreted;
        out
    }

    fn emit_native(&mut self, frame: &NativeFrame) -> Vec<StitchedFrame> {
        let mut out = Vec::new();
        if self.state == WalkState::LastWasInterpreted {
            out.push(StitchedFrame::TransitionToNative);
        }
        if !self.options.hide_native_frames {
            out.push(StitchedFrame::Native {
                instruction_pointer: frame.instruction_pointer,
                symbol: frame.symbol.clone(),
                module: frame.module,
            });
        }
        self.state = WalkState::LastWasNative;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 解決結果を順番に返すだけのリゾルバ
    struct QueueResolver {
        queue: Vec<Option<PythonFrameInfo>>,
    }

    impl QueueResolver {
        fn new(mut infos: Vec<Option<PythonFrameInfo>>) -> Self {
            infos.reverse();
            Self { queue: infos }
        }
    }

    impl FrameResolver for QueueResolver {
        fn resolve_eval_frame(&mut self, _frame: &NativeFrame) -> Option<PythonFrameInfo> {
            self.queue.pop().flatten()
        }
    }

    fn eval_frame(ip: u64) -> NativeFrame {
        NativeFrame {
            instruction_pointer: ip,
            frame_base: ip + 0x100,
            module: ModuleKind::Interpreter,
            symbol: Some("_PyEval_EvalFrameDefault".to_string()),
        }
    }

    fn foreign_frame(ip: u64, symbol: &str) -> NativeFrame {
        NativeFrame {
            instruction_pointer: ip,
            frame_base: ip + 0x100,
            module: ModuleKind::Other,
            symbol: Some(symbol.to_string()),
        }
    }

    fn internals_frame(ip: u64) -> NativeFrame {
        NativeFrame {
            instruction_pointer: ip,
            frame_base: ip + 0x100,
            module: ModuleKind::Interpreter,
            symbol: Some("gc_collect_main".to_string()),
        }
    }

    fn info(name: &str) -> PythonFrameInfo {
        PythonFrameInfo {
            function: name.to_string(),
            file: "app.py".to_string(),
            line: 1,
            frame_address: 0x1000,
        }
    }

    #[test]
    fn interleaved_stack_gets_exactly_two_transition_markers() {
        let resolver = QueueResolver::new(vec![
            Some(info("inner")),
            Some(info("middle")),
            Some(info("outer")),
        ]);
        let stitcher = StackStitcher::new(resolver, StitchOptions::default());
        let out = stitcher.stitch_all(&[
            eval_frame(0x10),
            eval_frame(0x20),
            foreign_frame(0x7e00_0000, "libm_cos"),
            eval_frame(0x30),
        ]);

        let markers = out
            .iter()
            .filter(|f| {
                matches!(
                    f,
                    StitchedFrame::TransitionToNative | StitchedFrame::TransitionToPython
                )
            })
            .count();
        assert_eq!(markers, 2);

        // 並び: python, python, →native, native, →python, python
        assert!(matches!(out[0], StitchedFrame::Python(_)));
        assert!(matches!(out[1], StitchedFrame::Python(_)));
        assert_eq!(out[2], StitchedFrame::TransitionToNative);
        assert!(matches!(out[3], StitchedFrame::Native { .. }));
        assert_eq!(out[4], StitchedFrame::TransitionToPython);
        assert!(matches!(out[5], StitchedFrame::Python(_)));
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn pure_native_stack_has_no_markers() {
        let resolver = QueueResolver::new(vec![]);
        let stitcher = StackStitcher::new(resolver, StitchOptions::default());
        let out = stitcher.stitch_all(&[
            foreign_frame(0x1, "main"),
            foreign_frame(0x2, "start"),
        ]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| matches!(f, StitchedFrame::Native { .. })));
    }

    #[test]
    fn failed_resolution_degrades_to_native_frame() {
        let resolver = QueueResolver::new(vec![None]);
        let stitcher = StackStitcher::new(resolver, StitchOptions::default());
        let out = stitcher.stitch_all(&[eval_frame(0x10)]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StitchedFrame::Native { .. }));
    }

    #[test]
    fn interpreter_internals_are_hidden_by_default() {
        let resolver = QueueResolver::new(vec![Some(info("f"))]);
        let stitcher = StackStitcher::new(resolver, StitchOptions::default());
        let out = stitcher.stitch_all(&[internals_frame(0x5), eval_frame(0x10)]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StitchedFrame::Python(_)));
    }

    #[test]
    fn hide_native_frames_keeps_markers() {
        let resolver = QueueResolver::new(vec![Some(info("a")), Some(info("b"))]);
        let options = StitchOptions {
            hide_native_frames: true,
            show_interpreter_internals: false,
        };
        let stitcher = StackStitcher::new(resolver, options);
        let out = stitcher.stitch_all(&[
            eval_frame(0x10),
            foreign_frame(0x20, "ffi_call"),
            eval_frame(0x30),
        ]);
        assert_eq!(
            out,
            vec![
                StitchedFrame::Python(info("a")),
                StitchedFrame::TransitionToNative,
                StitchedFrame::TransitionToPython,
                StitchedFrame::Python(info("b")),
            ]
        );
    }
}

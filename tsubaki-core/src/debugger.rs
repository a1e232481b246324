//! デバッガのメインロジック
//!
//! CLIから呼ばれるフロントです。接続済みセッションを高々1つ持ち、
//! コマンドを各コンポーネントへ振り分けます。

use std::fmt::Write as _;

use tsubaki_bus::{BusMessage, SourceLocation};
use tsubaki_proxy::structs::PyFrame;
use tsubaki_proxy::{assign_slot, parse_literal, repr, ReprOptions};
use tsubaki_stack::{
    walk_native_stack, NativeFrame, NativeSymbolizer, StackStitcher, StitchOptions, StitchedFrame,
    ThreadFrameResolver,
};
use tsubaki_target::{ModuleMap, Registers, StopReason, ThreadId};

use crate::breakpoints::BreakpointId;
use crate::errors::CoreError;
use crate::eval::{EvalEngine, EvalOutcome};
use crate::options::OptionsHandle;
use crate::session::DebugSession;
use crate::stepping::StepKind;
use crate::Result;

/// デバッガ
pub struct Debugger {
    session: Option<DebugSession>,
    options: OptionsHandle,
    eval: EvalEngine,
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new() -> Self {
        let options = OptionsHandle::default();
        Self {
            session: None,
            options,
            eval: EvalEngine::new(),
        }
    }

    /// 共有オプションハンドル
    pub fn options(&self) -> &OptionsHandle {
        &self.options
    }

    fn require_session(&self) -> Result<&DebugSession> {
        self.session.as_ref().ok_or_else(|| CoreError::NotAttached.into())
    }

    fn require_session_mut(&mut self) -> Result<&mut DebugSession> {
        self.session.as_mut().ok_or_else(|| CoreError::NotAttached.into())
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let session = DebugSession::attach(pid, self.options.clone())?;
        self.session = Some(session);
        Ok(())
    }

    /// ターゲットから切り離す
    pub fn detach(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session
                .coordinator
                .cancel(session.target.as_ref(), &session.helper);
            session.process.detach()?;
        }
        Ok(())
    }

    /// アタッチ済みかどうか
    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    /// ブレークポイントを追加してターゲットへ反映する
    pub fn add_breakpoint(&mut self, file: &str, line: i32) -> Result<BreakpointId> {
        let session = self.require_session_mut()?;
        let id = session.breakpoints.add(&SourceLocation::new(file, line));
        session.sync_breakpoints()?;
        Ok(id)
    }

    /// ブレークポイントを削除してターゲットへ反映する
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        let session = self.require_session_mut()?;
        session.breakpoints.remove(id);
        session.sync_breakpoints()?;
        Ok(())
    }

    /// アタッチ中のメインスレッドID
    pub fn main_thread(&self) -> Result<ThreadId> {
        Ok(self.require_session()?.process.pid())
    }

    /// 登録済みブレークポイントを(ハンドル, ファイル, 行)で列挙する
    pub fn list_breakpoints(&self) -> Result<Vec<(BreakpointId, String, i32)>> {
        let session = self.require_session()?;
        Ok(session
            .breakpoints
            .iter()
            .map(|(id, file, line)| (id, file.to_string(), line))
            .collect())
    }

    /// 実行を再開する
    pub fn continue_execution(&mut self) -> Result<StopReason> {
        let session = self.require_session_mut()?;
        session.flush_decrefs()?;
        let reason = session.process.continue_and_wait()?;
        if matches!(reason, StopReason::Breakpoint | StopReason::Step) {
            // 停止中に作られた新しいスレッド状態を取りこぼさない
            if let Err(e) = session.register_trace_func() {
                tracing::debug!(error = %e, "trace re-registration failed");
            }
        }
        Ok(reason)
    }

    /// ステップを開始する
    ///
    /// 開始スレッドの現在のレジスタから最小限のネイティブスタックを
    /// 組み立てて調停器へ渡します。
    pub fn begin_step(&mut self, kind: StepKind, thread: ThreadId) -> Result<()> {
        let session = self.require_session_mut()?;
        let regs = Registers::read_live(thread)?;
        let top = NativeFrame {
            instruction_pointer: regs.rip,
            frame_base: regs.rbp,
            module: session.modules.kind_at(regs.rip),
            symbol: None,
        };
        let stack = [top];
        let (deps, coordinator) = session.stepping();
        coordinator.begin_step(&deps, kind, thread, regs.rbp, &stack)?;
        Ok(())
    }

    /// アクティブなステップを取り消す
    pub fn cancel_step(&mut self) -> Result<()> {
        let session = self.require_session_mut()?;
        session
            .coordinator
            .cancel(session.target.as_ref(), &session.helper);
        Ok(())
    }

    /// バスに届いたイベントを処理し、表示用の文字列を返す
    pub fn poll_events(&mut self) -> Result<Vec<String>> {
        let session = self.require_session_mut()?;
        session.forward_option_changes()?;
        let mut lines = Vec::new();
        while let Some(msg) = session.bus.try_recv()? {
            match msg {
                BusMessage::BreakpointHit {
                    thread_id,
                    frame_base,
                    line,
                    ..
                } => {
                    lines.push(format!("breakpoint hit on thread {} (line {})", thread_id, line));
                    // トレースコールバック由来の行境界。アクティブな
                    // ステップがあれば完了判定に使う
                    let (deps, coordinator) = session.stepping();
                    if coordinator.on_trace_boundary(&deps, thread_id, frame_base)? {
                        lines.push(format!("step complete on thread {}", thread_id));
                    }
                }
                BusMessage::StepComplete { thread_id } => {
                    lines.push(format!("step complete on thread {}", thread_id));
                }
                BusMessage::AsyncBreakComplete { thread_id } => {
                    lines.push(format!("async break complete on thread {}", thread_id));
                }
                other => {
                    tracing::debug!(message = other.name(), "unhandled bus message");
                }
            }
        }
        Ok(lines)
    }

    fn current_frame(&self) -> Result<PyFrame> {
        let session = self.require_session()?;
        let tstate = session.current_tstate()?;
        PyFrame::current_of_thread(session.ctx.clone(), tstate)?
            .ok_or_else(|| anyhow::anyhow!("no interpreter frame on the current thread"))
    }

    /// 混在コールスタックを表示用に整形する
    ///
    /// ネイティブスタックをフレームポインタチェインから復元し、評価
    /// ループのフレームをインタプリタフレームに置き換えて縫合します。
    /// シンボル情報が足りず縫合が成立しない場合はインタプリタ側の
    /// チェインだけを出します。
    pub fn backtrace(&self) -> Result<String> {
        let session = self.require_session()?;
        let thread = session.process.pid();
        let regs = Registers::read_live(thread)?;

        let mut symbolizer = NativeSymbolizer::new();
        let native = walk_native_stack(
            session.target.as_ref(),
            &session.modules,
            &mut symbolizer,
            regs.rip,
            regs.rbp,
        );

        let tstate = session.current_tstate()?;
        let top = PyFrame::current_of_thread(session.ctx.clone(), tstate)?;
        let resolver = ThreadFrameResolver::from_top_frame(top.clone());
        let opts = session.options.get();
        let stitcher = StackStitcher::new(
            resolver,
            StitchOptions {
                hide_native_frames: opts.hide_native_frames,
                show_interpreter_internals: opts.show_interpreter_internals,
            },
        );
        let stitched = stitcher.stitch_all(&native);

        if stitched.iter().any(|f| matches!(f, StitchedFrame::Python(_))) {
            Ok(render_stitched(&session.modules, &stitched))
        } else {
            self.interpreter_only_backtrace(top)
        }
    }

    fn interpreter_only_backtrace(&self, top: Option<PyFrame>) -> Result<String> {
        let Some(top) = top else {
            return Ok("no interpreter frame on the current thread\n".to_string());
        };
        let mut out = String::new();
        for (i, frame) in top.chain()?.iter().enumerate() {
            let code = frame.code()?;
            let _ = writeln!(
                out,
                "#{:<3} {} ({}:{})",
                i,
                code.name()?,
                code.filename()?,
                frame.line_number()?
            );
        }
        Ok(out)
    }

    /// 現在のフレームのローカル変数を整形する
    pub fn locals(&self) -> Result<String> {
        let frame = self.current_frame()?;
        let opts = self.repr_options()?;
        let mut out = String::new();
        for (name, value) in frame.locals()? {
            let _ = writeln!(out, "{} = {}", name, repr::render(&value, &opts));
        }
        Ok(out)
    }

    /// 名前でローカル変数を表示する
    pub fn print_local(&self, name: &str) -> Result<String> {
        let frame = self.current_frame()?;
        let opts = self.repr_options()?;
        for (candidate, value) in frame.locals()? {
            if candidate == name {
                return Ok(repr::render(&value, &opts));
            }
        }
        anyhow::bail!("no local variable named '{}'", name)
    }

    /// ローカル変数をリテラルで書き換える
    ///
    /// 差し替え前のオブジェクトは遅延解放キューに積まれ、次の再開時に
    /// ターゲット側で解放されます。
    pub fn set_local(&mut self, name: &str, literal_text: &str) -> Result<()> {
        let frame = self.current_frame()?;
        let Some((slot, _current)) = frame.local_slot(name)? else {
            anyhow::bail!("no local variable named '{}'", name);
        };
        let literal = parse_literal(literal_text)?;
        let session = self.require_session_mut()?;
        let old = assign_slot(&session.ctx, &mut session.arena, slot, &literal)?;
        session.decrefs.defer(old);
        Ok(())
    }

    /// ターゲット内で式を評価し、結果を整形する
    pub fn evaluate(&mut self, thread: ThreadId, expression: &str) -> Result<String> {
        let opts = self.repr_options()?;
        let eval = &self.eval;
        let Some(session) = self.session.as_mut() else {
            return Err(CoreError::NotAttached.into());
        };
        session.flush_decrefs()?;
        let outcome = {
            let mut control = session.control();
            eval.evaluate(
                session.target.as_ref(),
                &session.helper,
                &session.bus,
                &mut control,
                thread,
                expression,
            )?
        };
        match outcome {
            EvalOutcome::Completed { result } if result != 0 => {
                let obj = tsubaki_proxy::PyObject::new(session.ctx.clone(), result)?;
                // 評価結果はデバッガ所有。表示後に解放予定へ積む
                let text = repr::render(&obj, &opts);
                session.decrefs.defer(result);
                Ok(text)
            }
            EvalOutcome::Completed { .. } => Ok("None".to_string()),
            EvalOutcome::Aborted => Ok("<evaluation aborted>".to_string()),
        }
    }

    fn repr_options(&self) -> Result<ReprOptions> {
        let session = self.require_session()?;
        let opts = session.options.get();
        Ok(ReprOptions {
            max_length: opts.max_repr_length,
            hex_display: opts.hex_display,
        })
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

/// 縫合済みスタックを表示用に整形する
///
/// 遷移マーカーはフレーム番号を消費しません。
fn render_stitched(modules: &ModuleMap, stitched: &[StitchedFrame]) -> String {
    let mut out = String::new();
    let mut index = 0usize;
    for frame in stitched {
        match frame {
            StitchedFrame::Python(info) => {
                let _ = writeln!(
                    out,
                    "#{:<3} {} ({}:{})",
                    index, info.function, info.file, info.line
                );
                index += 1;
            }
            StitchedFrame::Native {
                instruction_pointer,
                symbol,
                ..
            } => {
                let name = symbol
                    .clone()
                    .unwrap_or_else(|| format!("0x{:x}", instruction_pointer));
                let module = modules
                    .module_at(*instruction_pointer)
                    .map(|m| m.name().to_string())
                    .unwrap_or_else(|| "?".to_string());
                let _ = writeln!(out, "#{:<3} {} [{}]", index, name, module);
                index += 1;
            }
            StitchedFrame::TransitionToNative => {
                let _ = writeln!(out, "     --- native code ---");
            }
            StitchedFrame::TransitionToPython => {
                let _ = writeln!(out, "     --- python code ---");
            }
        }
    }
    out
}

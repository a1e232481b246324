//! ステップ実行の調停
//!
//! ステッピングセッションはターゲットプロセスごとに高々1つです。
//! ステップインではゲート表の各関数の入口にブレークポイントを張り、
//! ゲートが踏まれたら引数から飛び先を計算して単発のステップターゲットを
//! 張り直します。ステップオーバー/アウトでは縫合済みスタックを辿って
//! 戻り先アドレスにブレークポイントを張ります。
//!
//! 完了経路は3つあります。ステップターゲットのヒット、トレース
//! コールバックからの境界通知、そしてフレームベース比較による復帰検出
//! です。どの経路でもセッションの武装をすべて解除してからバスで通知
//! します。キャンセルは冪等で、どの状態からでも`Idle`へ戻ります。

use tsubaki_bus::{BusMessage, Endpoint};
use tsubaki_proxy::RuntimeContext;
use tsubaki_stack::{is_eval_frame, NativeFrame};
use tsubaki_target::{
    ImageSymbols, ModuleKind, ModuleMap, Registers, SoftwareBreakpoint, TargetAccess,
    TargetAccessExt, ThreadId,
};

use crate::disasm::scan_returns;
use crate::errors::CoreError;
use crate::gates::{evaluate_exits, ArgSource, GateArgs, GateSpec, GATE_TABLE};
use crate::helper::HelperExports;
use crate::Result;

/// ゲート本体を逆アセンブルする最大バイト数
const GATE_SCAN_BYTES: usize = 512;

/// ステップの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    /// ヘルパーの`tsubaki_step_kind`に書くワイヤ値
    pub fn wire_value(&self) -> i32 {
        match self {
            StepKind::Into => 1,
            StepKind::Over => 2,
            StepKind::Out => 3,
        }
    }
}

/// 調停器の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    SteppingRequested,
    GatesArmed,
    AwaitingTargetSignal,
    Completing,
}

/// 張られたブレークポイントの用途
#[derive(Debug, Clone, Copy)]
enum Purpose {
    /// ゲート関数の入口
    GateEntry { gate: &'static GateSpec },
    /// 複数出口ゲートのret（残りの出口を再評価する足場）
    GateReturn {
        gate: &'static GateSpec,
        frame_base: u64,
    },
    /// ステップインの飛び先（単発）
    StepTarget,
    /// ステップオーバー/アウトの戻り先
    ReturnAddress,
}

struct Armed {
    bp: SoftwareBreakpoint,
    purpose: Purpose,
}

/// アクティブなステッピングセッション
struct StepSession {
    kind: StepKind,
    thread: ThreadId,
    /// ステップ開始時点のフレームベース。復帰検出の基準
    frame_base: u64,
    armed: Vec<Armed>,
}

/// ステップ調停が参照する接続済みプロセスの文脈
pub struct StepDeps<'a> {
    pub target: &'a dyn TargetAccess,
    pub modules: &'a ModuleMap,
    pub ctx: &'a RuntimeContext,
    pub interpreter_symbols: &'a ImageSymbols,
    pub helper: &'a HelperExports,
    pub bus: &'a Endpoint,
}

/// ブレークポイント/ステッピング調停器
pub struct SteppingCoordinator {
    phase: StepPhase,
    session: Option<StepSession>,
}

impl SteppingCoordinator {
    pub fn new() -> Self {
        Self {
            phase: StepPhase::Idle,
            session: None,
        }
    }

    /// 現在の状態
    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    /// 張られているブレークポイント数
    pub fn armed_count(&self) -> usize {
        self.session.as_ref().map(|s| s.armed.len()).unwrap_or(0)
    }

    /// ステップを開始する
    ///
    /// `stack`はステップ開始時点の、開始スレッドのネイティブスタック
    /// （最新フレームが先頭）です。同じスレッドからの再要求は前の
    /// セッションを暗黙に取り消して（武装をすべて解除して）から
    /// 開始します。別スレッドのセッションがアクティブな間の開始要求は
    /// 拒否します。
    pub fn begin_step(
        &mut self,
        deps: &StepDeps<'_>,
        kind: StepKind,
        thread: ThreadId,
        frame_base: u64,
        stack: &[NativeFrame],
    ) -> Result<()> {
        if let Some(active) = &self.session {
            if active.thread != thread {
                return Err(CoreError::SessionActive {
                    thread: active.thread,
                }
                .into());
            }
            self.cancel(deps.target, deps.helper);
        }
        self.phase = StepPhase::SteppingRequested;
        let mut session = StepSession {
            kind,
            thread,
            frame_base,
            armed: Vec::new(),
        };

        // トレースコールバックへステップ文脈を公開する
        deps.target
            .write_bytes(deps.helper.step_kind, &kind.wire_value().to_le_bytes())?;
        deps.target
            .write_bytes(deps.helper.step_thread, &thread.to_le_bytes())?;

        let result = match kind {
            StepKind::Into => arm_gates(deps, &mut session, stack),
            StepKind::Over | StepKind::Out => arm_return(deps, &mut session, stack),
        };
        if let Err(e) = result {
            disarm_all(deps.target, &mut session);
            clear_helper_step(deps.target, deps.helper);
            self.phase = StepPhase::Idle;
            return Err(e);
        }

        tracing::info!(?kind, thread, armed = session.armed.len(), "step session started");
        self.session = Some(session);
        self.phase = StepPhase::GatesArmed;
        Ok(())
    }

    /// ブレークポイント停止の処理
    ///
    /// 戻り値はステップが完了したかどうかです。セッションの記録にない
    /// アドレスの通知はログに残して無視します（ホスト境界へエラーを
    /// 投げてはいけません）。
    pub fn on_breakpoint_hit(
        &mut self,
        deps: &StepDeps<'_>,
        address: u64,
        thread: ThreadId,
        regs: &Registers,
    ) -> Result<bool> {
        let (purpose, session_thread, session_base) = {
            let Some(session) = &self.session else {
                tracing::debug!(
                    address = format_args!("0x{:x}", address),
                    "breakpoint hit with no active step session; ignored"
                );
                return Ok(false);
            };
            let Some(hit) = session.armed.iter().find(|a| a.bp.address() == address) else {
                tracing::warn!(
                    address = format_args!("0x{:x}", address),
                    "breakpoint hit for unknown address; ignored"
                );
                return Ok(false);
            };
            (hit.purpose, session.thread, session.frame_base)
        };

        match purpose {
            Purpose::GateEntry { gate } => {
                // 非同期停止: 引数はレジスタから
                let args = GateArgs::new(ArgSource::Registers(*regs));
                if let Some(session) = self.session.as_mut() {
                    arm_step_targets(deps, session, gate, &args)?;
                }
                self.phase = StepPhase::AwaitingTargetSignal;
                Ok(false)
            }
            Purpose::GateReturn { gate, frame_base } => {
                // 最初の出口から戻ってきた。残りの出口を同期評価する
                let args = GateArgs::new(ArgSource::FrameBase { base: frame_base });
                if let Some(session) = self.session.as_mut() {
                    arm_step_targets(deps, session, gate, &args)?;
                }
                Ok(false)
            }
            Purpose::StepTarget => {
                if thread != session_thread {
                    tracing::debug!(thread, "step target hit on another thread; ignored");
                    return Ok(false);
                }
                self.complete(deps)?;
                Ok(true)
            }
            Purpose::ReturnAddress => {
                if thread != session_thread {
                    return Ok(false);
                }
                // 同じ戻り先を再帰呼び出しの深い側で踏んだだけなら
                // まだ復帰していない。フレームベースで判定する
                if regs.rbp <= session_base {
                    tracing::debug!("return address hit inside recursion; not a completion");
                    return Ok(false);
                }
                self.complete(deps)?;
                Ok(true)
            }
        }
    }

    /// トレースコールバックからのステップ境界通知
    pub fn on_trace_boundary(
        &mut self,
        deps: &StepDeps<'_>,
        thread: ThreadId,
        frame_base: u64,
    ) -> Result<bool> {
        let Some(session) = &self.session else {
            tracing::debug!(thread, "trace boundary with no active step session; ignored");
            return Ok(false);
        };
        if thread != session.thread {
            return Ok(false);
        }
        let done = match session.kind {
            StepKind::Into => true,
            // 開始フレームより浅い位置の境界だけが完了
            StepKind::Over => frame_base >= session.frame_base,
            StepKind::Out => frame_base > session.frame_base,
        };
        if done {
            self.complete(deps)?;
        }
        Ok(done)
    }

    /// 完了処理: 全ブレークポイント解除とバス通知
    fn complete(&mut self, deps: &StepDeps<'_>) -> Result<()> {
        self.phase = StepPhase::Completing;
        let Some(mut session) = self.session.take() else {
            self.phase = StepPhase::Idle;
            return Ok(());
        };
        disarm_all(deps.target, &mut session);
        clear_helper_step(deps.target, deps.helper);
        if let Err(e) = deps.bus.send(&BusMessage::StepComplete {
            thread_id: session.thread,
        }) {
            tracing::warn!(error = %e, "failed to send step completion");
        }
        tracing::info!(thread = session.thread, "step session completed");
        self.phase = StepPhase::Idle;
        Ok(())
    }

    /// セッションの取り消し
    ///
    /// どの状態から呼ばれても`Idle`に戻ります。アイドル時の呼び出しは
    /// 何もしません（冪等）。
    pub fn cancel(&mut self, target: &dyn TargetAccess, helper: &HelperExports) {
        if let Some(mut session) = self.session.take() {
            disarm_all(target, &mut session);
            clear_helper_step(target, helper);
            tracing::info!(thread = session.thread, "step session canceled");
        }
        self.phase = StepPhase::Idle;
    }
}

impl Default for SteppingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// ステップイン: ゲート表をすべて武装する
fn arm_gates(
    deps: &StepDeps<'_>,
    session: &mut StepSession,
    stack: &[NativeFrame],
) -> Result<()> {
    for gate in GATE_TABLE {
        let Some(entry) = deps.interpreter_symbols.try_lookup(gate.symbol) else {
            tracing::debug!(gate = gate.symbol, "gate symbol not present; skipped");
            continue;
        };
        let mut bp = SoftwareBreakpoint::new(entry);
        bp.enable(deps.target)?;
        session.armed.push(Armed {
            bp,
            purpose: Purpose::GateEntry { gate },
        });

        // 既にこのゲートの中にいる複数出口ゲートは、入口ブレーク
        // ポイントがこの呼び出しではもう発火しないため、いま同期的に
        // 出口を評価する。引数はスタックから読む
        if gate.multiple_exit_points {
            if let Some(frame) = stack
                .iter()
                .find(|f| f.symbol.as_deref().is_some_and(|s| s.contains(gate.symbol)))
            {
                let args = GateArgs::new(ArgSource::FrameBase {
                    base: frame.frame_base,
                });
                arm_step_targets(deps, session, gate, &args)?;
                arm_gate_returns(deps, session, gate, entry, frame.frame_base)?;
            }
        }
    }
    Ok(())
}

/// 複数出口ゲートのret命令に足場ブレークポイントを張る
fn arm_gate_returns(
    deps: &StepDeps<'_>,
    session: &mut StepSession,
    gate: &'static GateSpec,
    entry: u64,
    frame_base: u64,
) -> Result<()> {
    let code = match deps.target.read_bytes(entry, GATE_SCAN_BYTES) {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(gate = gate.symbol, error = %e, "gate body unreadable");
            return Ok(());
        }
    };
    for ret_addr in scan_returns(&code, entry)? {
        if session.armed.iter().any(|a| a.bp.address() == ret_addr) {
            continue;
        }
        let mut bp = SoftwareBreakpoint::new(ret_addr);
        bp.enable(deps.target)?;
        session.armed.push(Armed {
            bp,
            purpose: Purpose::GateReturn { gate, frame_base },
        });
    }
    Ok(())
}

/// ステップオーバー/アウト: 戻り先アドレスにブレークポイントを張る
///
/// 最初の外部ネイティブフレームか、2番目のインタプリタフレームの
/// 浅い方を戻り先とします。1番目のインタプリタフレームはいま
/// 抜けようとしているフレーム自身なので対象になりません。
fn arm_return(
    deps: &StepDeps<'_>,
    session: &mut StepSession,
    stack: &[NativeFrame],
) -> Result<()> {
    let mut interpreted_seen = 0usize;
    let mut chosen: Option<&NativeFrame> = None;
    for frame in stack {
        if frame.module == ModuleKind::Other {
            chosen = Some(frame);
            break;
        }
        if is_eval_frame(frame) {
            interpreted_seen += 1;
            if interpreted_seen == 2 {
                chosen = Some(frame);
                break;
            }
        }
    }
    let Some(frame) = chosen else {
        // 戻り先なし（最上位フレームからのステップアウト等)。
        // トレース境界通知だけで完了を待つ
        tracing::debug!("no return frame found; relying on trace boundary");
        return Ok(());
    };
    let ret_addr = deps.target.read_typed::<u64>(frame.frame_base + 8)?;
    let mut bp = SoftwareBreakpoint::new(ret_addr);
    bp.enable(deps.target)?;
    session.armed.push(Armed {
        bp,
        purpose: Purpose::ReturnAddress,
    });
    Ok(())
}

/// ゲートの飛び先候補を計算し、外部コードを指すものに単発の
/// ステップターゲットを張る
fn arm_step_targets(
    deps: &StepDeps<'_>,
    session: &mut StepSession,
    gate: &'static GateSpec,
    args: &GateArgs,
) -> Result<()> {
    for exit in evaluate_exits(gate, args, deps.ctx) {
        // インタプリタとヘルパー内の飛び先はステップ対象にしない
        match deps.modules.kind_at(exit) {
            ModuleKind::Interpreter | ModuleKind::Helper => continue,
            ModuleKind::Other => {}
        }
        if session.armed.iter().any(|a| a.bp.address() == exit) {
            continue;
        }
        let mut bp = SoftwareBreakpoint::new(exit);
        bp.enable(deps.target)?;
        tracing::debug!(
            gate = gate.symbol,
            target = format_args!("0x{:x}", exit),
            "step target armed"
        );
        session.armed.push(Armed {
            bp,
            purpose: Purpose::StepTarget,
        });
    }
    Ok(())
}

/// セッションの全ブレークポイントを外す
///
/// プロセスが消えている場合でも残りの解除を続けます。
fn disarm_all(target: &dyn TargetAccess, session: &mut StepSession) {
    for armed in session.armed.iter_mut() {
        if let Err(e) = armed.bp.disable(target) {
            tracing::debug!(
                address = format_args!("0x{:x}", armed.bp.address()),
                error = %e,
                "failed to disarm breakpoint"
            );
        }
    }
    session.armed.clear();
}

fn clear_helper_step(target: &dyn TargetAccess, helper: &HelperExports) {
    let _ = target.write_bytes(helper.step_kind, &0i32.to_le_bytes());
    let _ = target.write_bytes(helper.step_thread, &0i32.to_le_bytes());
}

//! ターゲット内での式評価
//!
//! 任意式の評価はデバッガ側では完結できないため、ヘルパーの評価ループに
//! 依頼します。リクエストをスクラッチ経由でターゲットに書き込み、
//! スレッドを1本だけ再開して、完了ブレークポイントからの通知を
//! 制限時間付きで待ちます。
//!
//! タイムアウト時はまず中断を要求し、それにも応答がなければターゲットを
//! 強制停止します。強制停止に失敗した場合の最終手段としてのみプロセスを
//! 終了させます。これがターゲットを殺してよい唯一の経路です。

use std::time::Duration;

use tsubaki_bus::{wire, BusMessage, Endpoint};
use tsubaki_target::{SoftwareBreakpoint, TargetAccess, ThreadId};

use crate::errors::CoreError;
use crate::helper::HelperExports;
use crate::Result;

/// 完了待ちの既定制限時間
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_millis(3000);

/// 中断要求後の応答待ち制限時間
pub const ABORT_GRACE: Duration = Duration::from_millis(1000);

/// 評価リクエストバッファの容量（バイト、長さプレフィクス込み）
const REQUEST_CAPACITY: usize = 4096;

/// 実行制御の抽象
///
/// 本物の実装はptraceでスレッドを再開・停止します。テストでは
/// 呼び出し記録だけを取るフェイクに差し替えます。
pub trait ExecutionControl {
    /// 指定スレッドだけを再開する
    fn resume_thread(&mut self, thread: ThreadId) -> Result<()>;
    /// 全スレッドを停止する
    fn suspend_all(&mut self) -> Result<()>;
    /// プロセスを強制終了する（評価中断の最終手段）
    fn terminate(&mut self) -> Result<()>;
}

/// 評価の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// 結果オブジェクトのターゲットアドレス
    Completed { result: u64 },
    /// 中断要求に応答して停止した
    Aborted,
}

/// 評価エンジン
pub struct EvalEngine {
    timeout: Duration,
    abort_grace: Duration,
}

impl EvalEngine {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_EVAL_TIMEOUT,
            abort_grace: ABORT_GRACE,
        }
    }

    /// 制限時間を指定して作成する（テスト用に短縮できる）
    pub fn with_timeouts(timeout: Duration, abort_grace: Duration) -> Self {
        Self {
            timeout,
            abort_grace,
        }
    }

    /// 式をターゲット内で評価する
    ///
    /// 完了ブレークポイントはこの関数を抜けるまでに必ず解除されます。
    /// タイムアウトからの中断にも失敗した場合はプロセスを終了し、
    /// その上で`EvaluationTimeout`を返します。
    pub fn evaluate(
        &self,
        target: &dyn TargetAccess,
        helper: &HelperExports,
        bus: &Endpoint,
        control: &mut dyn ExecutionControl,
        thread: ThreadId,
        expression: &str,
    ) -> Result<EvalOutcome> {
        write_request(target, helper, expression)?;

        let mut completion_bp = SoftwareBreakpoint::new(helper.eval_complete);
        completion_bp.enable(target)?;
        let outcome = self.run_and_wait(bus, control, thread);
        // どの経路でも完了ブレークポイントを残さない
        if let Err(e) = completion_bp.disable(target) {
            tracing::debug!(error = %e, "failed to remove evaluation breakpoint");
        }
        outcome
    }

    fn run_and_wait(
        &self,
        bus: &Endpoint,
        control: &mut dyn ExecutionControl,
        thread: ThreadId,
    ) -> Result<EvalOutcome> {
        control.resume_thread(thread)?;

        match bus.wait_for(wire::CODE_EVALUATION_DONE, self.timeout) {
            Ok(BusMessage::EvaluationComplete { result, .. }) => {
                control.suspend_all()?;
                return Ok(EvalOutcome::Completed { result });
            }
            Ok(other) => {
                tracing::warn!(message = other.name(), "unexpected evaluation completion");
                control.suspend_all()?;
                return Ok(EvalOutcome::Aborted);
            }
            Err(tsubaki_bus::BusError::Timeout) => {}
            Err(e) => return Err(e.into()),
        }

        // 制限時間超過。まず行儀よく中断を求める
        tracing::warn!(thread, timeout_ms = self.timeout.as_millis() as u64, "evaluation timed out; requesting abort");
        bus.send(&BusMessage::AbortEvaluation)?;
        match bus.wait_for(wire::CODE_EVALUATION_DONE, self.abort_grace) {
            Ok(_) => {
                control.suspend_all()?;
                return Ok(EvalOutcome::Aborted);
            }
            Err(tsubaki_bus::BusError::Timeout) => {}
            Err(e) => return Err(e.into()),
        }

        // 中断にも応答しない。強制停止を試み、それさえ失敗したら
        // プロセスを道連れにしてでもホストのハングを防ぐ
        if let Err(e) = control.suspend_all() {
            tracing::error!(error = %e, "forced suspend failed; terminating target");
            control.terminate()?;
        }
        Err(CoreError::EvaluationTimeout {
            thread,
            timeout_ms: self.timeout.as_millis() as u64,
        }
        .into())
    }
}

impl Default for EvalEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// 評価リクエストをヘルパーのバッファへ書く
///
/// 形式は `{ len: u32, utf8: u8[len] }` です。
fn write_request(
    target: &dyn TargetAccess,
    helper: &HelperExports,
    expression: &str,
) -> Result<()> {
    let bytes = expression.as_bytes();
    if bytes.len() + 4 > REQUEST_CAPACITY {
        anyhow::bail!(
            "evaluation request too large: {} bytes (capacity {})",
            bytes.len(),
            REQUEST_CAPACITY - 4
        );
    }
    let mut buf = Vec::with_capacity(bytes.len() + 4);
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
    target.write_bytes(helper.eval_request, &buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsubaki_bus::pair;
    use tsubaki_target::{FakeTarget, TargetAccessExt};

    struct FakeControl {
        resumed: Vec<ThreadId>,
        suspend_calls: usize,
        suspend_fails: bool,
        terminated: bool,
    }

    impl FakeControl {
        fn new() -> Self {
            Self {
                resumed: Vec::new(),
                suspend_calls: 0,
                suspend_fails: false,
                terminated: false,
            }
        }
    }

    impl ExecutionControl for FakeControl {
        fn resume_thread(&mut self, thread: ThreadId) -> Result<()> {
            self.resumed.push(thread);
            Ok(())
        }

        fn suspend_all(&mut self) -> Result<()> {
            self.suspend_calls += 1;
            if self.suspend_fails {
                anyhow::bail!("suspend failed");
            }
            Ok(())
        }

        fn terminate(&mut self) -> Result<()> {
            self.terminated = true;
            Ok(())
        }
    }

    fn fixture() -> (Arc<FakeTarget>, HelperExports) {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x10000, 0x80000);
        (fake, HelperExports::at_fixed(0x10000))
    }

    #[test]
    fn completed_evaluation_reads_result() {
        let (fake, helper) = fixture();
        let (local, remote) = pair();
        remote
            .send(&BusMessage::EvaluationComplete {
                thread_id: 7,
                result: 0xdead_0000,
            })
            .unwrap();

        let mut control = FakeControl::new();
        let engine = EvalEngine::with_timeouts(
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        let outcome = engine
            .evaluate(fake.as_ref(), &helper, &local, &mut control, 7, "1 + 1")
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Completed { result: 0xdead_0000 });
        assert_eq!(control.resumed, vec![7]);

        // リクエストが書かれている
        let len = fake.as_ref().read_typed::<u32>(helper.eval_request).unwrap();
        assert_eq!(len, 5);
        let body = fake.as_ref().read_bytes(helper.eval_request + 4, 5).unwrap();
        assert_eq!(&body, b"1 + 1");
    }

    #[test]
    fn timeout_requests_abort_then_suspends() {
        let (fake, helper) = fixture();
        let (local, remote) = pair();
        let mut control = FakeControl::new();
        let engine = EvalEngine::with_timeouts(
            Duration::from_millis(30),
            Duration::from_millis(30),
        );

        let err = engine
            .evaluate(fake.as_ref(), &helper, &local, &mut control, 3, "loop_forever()")
            .unwrap_err();
        let core = err.downcast_ref::<CoreError>();
        assert!(matches!(core, Some(CoreError::EvaluationTimeout { thread: 3, .. })));

        // 中断要求がバスに流れている
        let msg = remote.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(msg, BusMessage::AbortEvaluation);
        // 強制停止が成功したので終了はしていない
        assert_eq!(control.suspend_calls, 1);
        assert!(!control.terminated);

        // 完了ブレークポイントは残っていない
        let byte = fake.as_ref().read_typed::<u8>(helper.eval_complete).unwrap();
        assert_ne!(byte, 0xcc);
    }

    #[test]
    fn unresponsive_target_is_terminated() {
        let (fake, helper) = fixture();
        let (local, _remote) = pair();
        let mut control = FakeControl::new();
        control.suspend_fails = true;
        let engine = EvalEngine::with_timeouts(
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        let err = engine
            .evaluate(fake.as_ref(), &helper, &local, &mut control, 1, "x")
            .unwrap_err();
        assert!(err.downcast_ref::<CoreError>().is_some());
        assert!(control.terminated);
    }

    #[test]
    fn abort_acknowledged_within_grace() {
        let (fake, helper) = fixture();
        let (local, remote) = pair();
        let mut control = FakeControl::new();
        let engine = EvalEngine::with_timeouts(
            Duration::from_millis(50),
            Duration::from_millis(500),
        );

        // 中断要求を受けたら完了通知を返すリモート側
        let responder = std::thread::spawn(move || {
            if let Ok(BusMessage::AbortEvaluation) =
                remote.recv_timeout(Duration::from_millis(500))
            {
                let _ = remote.send(&BusMessage::EvaluationComplete {
                    thread_id: 2,
                    result: 0,
                });
            }
        });

        let outcome = engine
            .evaluate(fake.as_ref(), &helper, &local, &mut control, 2, "slow()")
            .unwrap();
        responder.join().unwrap();
        assert_eq!(outcome, EvalOutcome::Aborted);
        assert!(!control.terminated);
    }
}

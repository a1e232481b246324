//! コア固有のエラー型
//!
//! 呼び出し側が分岐する必要のある失敗だけを列挙します。その他の
//! オーケストレーション上の失敗は anyhow のエラーとして伝播します。

use tsubaki_target::ThreadId;

/// コア層のエラー
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// 式評価が制限時間内に完了しなかった
    #[error("evaluation timed out after {timeout_ms} ms on thread {thread}")]
    EvaluationTimeout { thread: ThreadId, timeout_ms: u64 },

    /// 記録にないブレークポイント・セッションに対する通知
    ///
    /// ログに残して無視します。ホスト境界を越えて投げてはいけません。
    #[error("message for unknown breakpoint or session: {what}")]
    ProtocolViolation { what: String },

    /// 既にステッピングセッションがアクティブ
    #[error("a stepping session is already active on thread {thread}")]
    SessionActive { thread: ThreadId },

    /// プロセスに接続されていない
    #[error("not attached to a process")]
    NotAttached,
}

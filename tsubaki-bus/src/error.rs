//! バスのエラー型

use thiserror::Error;

/// メッセージバスで発生するエラー
#[derive(Debug, Error)]
pub enum BusError {
    /// 待機がタイムアウトした
    #[error("timed out waiting for a bus message")]
    Timeout,

    /// 相手側エンドポイントが閉じられた
    #[error("bus endpoint disconnected")]
    Disconnected,

    /// ペイロードが短すぎる
    #[error("truncated payload for message code 0x{code:04x}: need {need} bytes, have {have}")]
    Truncated { code: u16, need: usize, have: usize },

    /// 未知のメッセージコード
    #[error("unknown message code 0x{0:04x}")]
    UnknownCode(u16),

    /// メッセージコードの重複登録
    #[error("duplicate message code 0x{0:04x} in registry")]
    DuplicateCode(u16),

    /// 文字列ペイロードが不正
    #[error("invalid string payload in message code 0x{0:04x}")]
    BadString(u16),
}

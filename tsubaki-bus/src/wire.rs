//! メッセージ定義とワイヤ形式
//!
//! 各メッセージには固定のコードが割り当てられ、対応表
//! （`MESSAGE_TABLE`）に列挙されます。コードを登録順で採番することは
//! せず、追加時は表に明示的な値を書きます。重複は`verify_registry`で
//! 検出されます。
//!
//! ワイヤ形式はリトルエンディアンで、フレームは
//! `[code: u16][payload_len: u32][payload]` です。

use crate::{BusError, Result};

// デバッガ側 → ターゲット側監視
pub const CODE_CREATE_RUNTIME: u16 = 0x0001;
pub const CODE_GET_FRAME_INFO: u16 = 0x0002;
pub const CODE_SET_OPTIONS: u16 = 0x0003;
pub const CODE_BEGIN_STEP_IN: u16 = 0x0010;
pub const CODE_BEGIN_STEP_OUT: u16 = 0x0011;
pub const CODE_ABORT_EVALUATION: u16 = 0x0020;

// ターゲット側監視 → デバッガ側
pub const CODE_FRAME_INFO: u16 = 0x0102;
pub const CODE_STEP_COMPLETE: u16 = 0x0110;
pub const CODE_BREAKPOINT_HIT: u16 = 0x0120;
pub const CODE_ASYNC_BREAK_DONE: u16 = 0x0121;
pub const CODE_EVALUATION_DONE: u16 = 0x0130;

/// コード → 名前 の対応表（検証とログ用）
pub const MESSAGE_TABLE: &[(u16, &str)] = &[
    (CODE_CREATE_RUNTIME, "CreateRuntime"),
    (CODE_GET_FRAME_INFO, "GetCurrentFrameInfo"),
    (CODE_SET_OPTIONS, "SetDisplayOptions"),
    (CODE_BEGIN_STEP_IN, "BeginStepIn"),
    (CODE_BEGIN_STEP_OUT, "BeginStepOut"),
    (CODE_ABORT_EVALUATION, "AbortEvaluation"),
    (CODE_FRAME_INFO, "CurrentFrameInfo"),
    (CODE_STEP_COMPLETE, "StepComplete"),
    (CODE_BREAKPOINT_HIT, "BreakpointHit"),
    (CODE_ASYNC_BREAK_DONE, "AsyncBreakComplete"),
    (CODE_EVALUATION_DONE, "EvaluationComplete"),
];

/// 対応表にコードの重複がないことを検証する
///
/// セッション開始時に一度呼ばれます。
pub fn verify_registry() -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for (code, _) in MESSAGE_TABLE {
        if !seen.insert(*code) {
            return Err(BusError::DuplicateCode(*code));
        }
    }
    Ok(())
}

/// バスを流れるメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// ランタイム検査の開始通知
    CreateRuntime { interpreter_base: u64 },
    /// 停止中スレッドの現在フレーム情報の問い合わせ
    GetCurrentFrameInfo { thread_id: i32 },
    /// 問い合わせへの応答
    CurrentFrameInfo {
        thread_id: i32,
        return_address: u64,
        frame_base: u64,
    },
    /// 表示オプションの変更通知
    SetDisplayOptions {
        hex_display: bool,
        hide_native_frames: bool,
    },
    /// ステップインの開始
    BeginStepIn { thread_id: i32 },
    /// ステップアウトの開始
    BeginStepOut { thread_id: i32 },
    /// トレース関数からのステップ完了通知
    StepComplete { thread_id: i32 },
    /// 実行中の評価の中断要求
    AbortEvaluation,
    /// ブレークポイントヒット通知
    BreakpointHit {
        breakpoint_id: u64,
        thread_id: i32,
        frame_base: u64,
        line: i32,
    },
    /// 非同期ブレーク処理の完了通知
    AsyncBreakComplete { thread_id: i32 },
    /// 評価完了通知（resultは結果オブジェクトのアドレス）
    EvaluationComplete { thread_id: i32, result: u64 },
}

impl BusMessage {
    /// メッセージコード
    pub fn code(&self) -> u16 {
        match self {
            Self::CreateRuntime { .. } => CODE_CREATE_RUNTIME,
            Self::GetCurrentFrameInfo { .. } => CODE_GET_FRAME_INFO,
            Self::CurrentFrameInfo { .. } => CODE_FRAME_INFO,
            Self::SetDisplayOptions { .. } => CODE_SET_OPTIONS,
            Self::BeginStepIn { .. } => CODE_BEGIN_STEP_IN,
            Self::BeginStepOut { .. } => CODE_BEGIN_STEP_OUT,
            Self::StepComplete { .. } => CODE_STEP_COMPLETE,
            Self::AbortEvaluation => CODE_ABORT_EVALUATION,
            Self::BreakpointHit { .. } => CODE_BREAKPOINT_HIT,
            Self::AsyncBreakComplete { .. } => CODE_ASYNC_BREAK_DONE,
            Self::EvaluationComplete { .. } => CODE_EVALUATION_DONE,
        }
    }

    /// メッセージ名（ログ用）
    pub fn name(&self) -> &'static str {
        let code = self.code();
        MESSAGE_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, n)| *n)
            .unwrap_or("Unknown")
    }

    /// フレームにエンコードする
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Self::CreateRuntime { interpreter_base } => {
                payload.extend_from_slice(&interpreter_base.to_le_bytes());
            }
            Self::GetCurrentFrameInfo { thread_id }
            | Self::BeginStepIn { thread_id }
            | Self::BeginStepOut { thread_id }
            | Self::StepComplete { thread_id }
            | Self::AsyncBreakComplete { thread_id } => {
                payload.extend_from_slice(&thread_id.to_le_bytes());
            }
            Self::CurrentFrameInfo {
                thread_id,
                return_address,
                frame_base,
            } => {
                payload.extend_from_slice(&thread_id.to_le_bytes());
                payload.extend_from_slice(&return_address.to_le_bytes());
                payload.extend_from_slice(&frame_base.to_le_bytes());
            }
            Self::SetDisplayOptions {
                hex_display,
                hide_native_frames,
            } => {
                payload.push(*hex_display as u8);
                payload.push(*hide_native_frames as u8);
            }
            Self::AbortEvaluation => {}
            Self::BreakpointHit {
                breakpoint_id,
                thread_id,
                frame_base,
                line,
            } => {
                payload.extend_from_slice(&breakpoint_id.to_le_bytes());
                payload.extend_from_slice(&thread_id.to_le_bytes());
                payload.extend_from_slice(&frame_base.to_le_bytes());
                payload.extend_from_slice(&line.to_le_bytes());
            }
            Self::EvaluationComplete { thread_id, result } => {
                payload.extend_from_slice(&thread_id.to_le_bytes());
                payload.extend_from_slice(&result.to_le_bytes());
            }
        }

        let mut frame = Vec::with_capacity(6 + payload.len());
        frame.extend_from_slice(&self.code().to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// フレームからデコードする
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 6 {
            return Err(BusError::Truncated {
                code: 0,
                need: 6,
                have: frame.len(),
            });
        }
        let code = u16::from_le_bytes([frame[0], frame[1]]);
        let len = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        let payload = &frame[6..];
        if payload.len() < len {
            return Err(BusError::Truncated {
                code,
                need: len,
                have: payload.len(),
            });
        }
        let mut r = Cursor::new(code, &payload[..len]);

        let msg = match code {
            CODE_CREATE_RUNTIME => Self::CreateRuntime {
                interpreter_base: r.u64()?,
            },
            CODE_GET_FRAME_INFO => Self::GetCurrentFrameInfo { thread_id: r.i32()? },
            CODE_FRAME_INFO => Self::CurrentFrameInfo {
                thread_id: r.i32()?,
                return_address: r.u64()?,
                frame_base: r.u64()?,
            },
            CODE_SET_OPTIONS => Self::SetDisplayOptions {
                hex_display: r.u8()? != 0,
                hide_native_frames: r.u8()? != 0,
            },
            CODE_BEGIN_STEP_IN => Self::BeginStepIn { thread_id: r.i32()? },
            CODE_BEGIN_STEP_OUT => Self::BeginStepOut { thread_id: r.i32()? },
            CODE_STEP_COMPLETE => Self::StepComplete { thread_id: r.i32()? },
            CODE_ABORT_EVALUATION => Self::AbortEvaluation,
            CODE_BREAKPOINT_HIT => Self::BreakpointHit {
                breakpoint_id: r.u64()?,
                thread_id: r.i32()?,
                frame_base: r.u64()?,
                line: r.i32()?,
            },
            CODE_ASYNC_BREAK_DONE => Self::AsyncBreakComplete { thread_id: r.i32()? },
            CODE_EVALUATION_DONE => Self::EvaluationComplete {
                thread_id: r.i32()?,
                result: r.u64()?,
            },
            other => return Err(BusError::UnknownCode(other)),
        };
        Ok(msg)
    }
}

/// ペイロード読み取りカーソル
pub(crate) struct Cursor<'a> {
    code: u16,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(code: u16, data: &'a [u8]) -> Self {
        Self { code, data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(BusError::Truncated {
                code: self.code,
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_no_duplicates() {
        verify_registry().unwrap();
    }

    #[test]
    fn messages_survive_encode_decode() {
        let samples = [
            BusMessage::CreateRuntime {
                interpreter_base: 0x40_0000,
            },
            BusMessage::BreakpointHit {
                breakpoint_id: 7,
                thread_id: 1234,
                frame_base: 0x7fff_0000,
                line: 42,
            },
            BusMessage::SetDisplayOptions {
                hex_display: true,
                hide_native_frames: false,
            },
            BusMessage::AbortEvaluation,
            BusMessage::EvaluationComplete {
                thread_id: 5,
                result: 0xdead,
            },
        ];
        for msg in samples {
            let decoded = BusMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = BusMessage::BreakpointHit {
            breakpoint_id: 1,
            thread_id: 2,
            frame_base: 3,
            line: 4,
        }
        .encode();
        let err = BusMessage::decode(&frame[..frame.len() - 2]).unwrap_err();
        assert!(matches!(err, BusError::Truncated { .. }));
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut frame = vec![0xff, 0xff];
        frame.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            BusMessage::decode(&frame),
            Err(BusError::UnknownCode(0xffff))
        ));
    }
}

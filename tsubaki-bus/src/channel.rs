//! エンドポイント間チャネル
//!
//! 同一プロセス内の2コンポーネントをつなぐ双方向チャネルです。
//! メッセージは送信時にワイヤ形式へエンコードされ、受信時に
//! デコードされます。コーデックを経由しない近道はありません。

use crate::{BusError, BusMessage, Result};
use std::sync::mpsc;
use std::time::Duration;

/// バスの片側エンドポイント
pub struct Endpoint {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// 接続済みのエンドポイント対を作る
pub fn pair() -> (Endpoint, Endpoint) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (
        Endpoint { tx: tx_a, rx: rx_a },
        Endpoint { tx: tx_b, rx: rx_b },
    )
}

impl Endpoint {
    /// メッセージを送信する
    pub fn send(&self, msg: &BusMessage) -> Result<()> {
        tracing::trace!(message = msg.name(), code = msg.code(), "bus send");
        self.tx
            .send(msg.encode())
            .map_err(|_| BusError::Disconnected)
    }

    /// メッセージを受信する（タイムアウトつき）
    pub fn recv_timeout(&self, timeout: Duration) -> Result<BusMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => BusMessage::decode(&frame),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(BusError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    /// 届いているメッセージを取り出す（ブロックしない）
    pub fn try_recv(&self) -> Result<Option<BusMessage>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(BusMessage::decode(&frame)?)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    /// 指定コードのメッセージが届くまで待つ
    ///
    /// 期限までに対象コードが届かなければ`Timeout`です。別コードの
    /// メッセージは読み捨てずにログを出して破棄します。
    pub fn wait_for(&self, code: u16, timeout: Duration) -> Result<BusMessage> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout);
            }
            let msg = self.recv_timeout(deadline - now)?;
            if msg.code() == code {
                return Ok(msg);
            }
            tracing::debug!(
                got = msg.name(),
                want = code,
                "discarding unexpected bus message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_in_both_directions() {
        let (a, b) = pair();
        a.send(&BusMessage::BeginStepIn { thread_id: 9 }).unwrap();
        let got = b.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got, BusMessage::BeginStepIn { thread_id: 9 });

        b.send(&BusMessage::StepComplete { thread_id: 9 }).unwrap();
        let got = a.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got, BusMessage::StepComplete { thread_id: 9 });
    }

    #[test]
    fn recv_times_out_when_nothing_arrives() {
        let (a, _b) = pair();
        assert!(matches!(
            a.recv_timeout(Duration::from_millis(10)),
            Err(BusError::Timeout)
        ));
    }

    #[test]
    fn dropped_peer_reports_disconnected() {
        let (a, b) = pair();
        drop(b);
        assert!(matches!(
            a.send(&BusMessage::AbortEvaluation),
            Err(BusError::Disconnected)
        ));
    }

    #[test]
    fn wait_for_skips_unrelated_messages() {
        let (a, b) = pair();
        b.send(&BusMessage::StepComplete { thread_id: 1 }).unwrap();
        b.send(&BusMessage::EvaluationComplete {
            thread_id: 1,
            result: 0x10,
        })
        .unwrap();
        let got = a
            .wait_for(crate::wire::CODE_EVALUATION_DONE, Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            got,
            BusMessage::EvaluationComplete {
                thread_id: 1,
                result: 0x10
            }
        );
    }
}

//! 検査オプション
//!
//! 表示や縫合の挙動を変えるフラグの置き場です。プロセス全体で共有する
//! 可変グローバルではなく、ハンドルを各コンポーネントへ明示的に渡し、
//! 変更は購読チャネルで通知します。

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// 検査オプション一式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorOptions {
    /// 整数を16進で表示する
    pub hex_display: bool,
    /// 縫合結果から外部ネイティブフレームを隠す
    pub hide_native_frames: bool,
    /// インタプリタ内部フレームも表示する（デバッグ用）
    pub show_interpreter_internals: bool,
    /// テキスト表現の最大長
    pub max_repr_length: usize,
}

impl Default for InspectorOptions {
    fn default() -> Self {
        Self {
            hex_display: false,
            hide_native_frames: false,
            show_interpreter_internals: false,
            max_repr_length: 1024,
        }
    }
}

/// 共有オプションハンドル
///
/// クローンはすべて同じオプションを指します。
#[derive(Clone)]
pub struct OptionsHandle {
    inner: Arc<Mutex<State>>,
}

struct State {
    options: InspectorOptions,
    observers: Vec<Sender<InspectorOptions>>,
}

impl OptionsHandle {
    pub fn new(options: InspectorOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                options,
                observers: Vec::new(),
            })),
        }
    }

    /// 現在値のコピーを取る
    pub fn get(&self) -> InspectorOptions {
        match self.inner.lock() {
            Ok(state) => state.options.clone(),
            Err(poisoned) => poisoned.into_inner().options.clone(),
        }
    }

    /// オプションを書き換え、変更があれば購読者へ通知する
    pub fn update(&self, f: impl FnOnce(&mut InspectorOptions)) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = state.options.clone();
        f(&mut state.options);
        if state.options == before {
            return;
        }
        let snapshot = state.options.clone();
        // 受信側が消えた購読者はここで刈る
        state.observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        tracing::debug!(?snapshot, "inspector options changed");
    }

    /// 変更通知の購読を開始する
    pub fn subscribe(&self) -> Receiver<InspectorOptions> {
        let (tx, rx) = channel();
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.observers.push(tx);
        rx
    }
}

impl Default for OptionsHandle {
    fn default() -> Self {
        Self::new(InspectorOptions::default())
    }
}

//! ターゲットアクセスのエラー型
//!
//! 上位レイヤが分岐するエラー（プロセス消滅、スクラッチ枯渇など）は
//! バリアントとして区別できるようにしています。

use thiserror::Error;

/// ターゲットプロセスへのアクセスで発生するエラー
#[derive(Debug, Error)]
pub enum TargetError {
    /// プロセスが終了済み、または接続が失われた
    #[error("target process is unavailable")]
    ProcessGone,

    /// メモリ読み取りの失敗
    #[error("failed to read {len} bytes at 0x{addr:x}: {source}")]
    ReadFailed {
        addr: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// メモリ書き込みの失敗
    #[error("failed to write {len} bytes at 0x{addr:x}: {source}")]
    WriteFailed {
        addr: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// バイト列から値への変換失敗
    #[error("cannot decode {type_name} from {got} bytes (expected {expected})")]
    DecodeFailed {
        type_name: &'static str,
        got: usize,
        expected: usize,
    },

    /// スクラッチ領域の空き不足
    #[error("scratch arena exhausted: requested {requested} bytes")]
    ScratchExhausted { requested: usize },

    /// スクラッチ領域外のアドレスを解放しようとした
    #[error("0x{addr:x} is not a live scratch allocation")]
    BadScratchFree { addr: u64 },

    /// シンボルが見つからない
    #[error("symbol `{name}` not found in {image}")]
    SymbolNotFound { name: String, image: String },

    /// 実行可能イメージの解析失敗
    #[error("failed to parse image {path}: {reason}")]
    BadImage { path: String, reason: String },

    /// ptrace呼び出しの失敗
    #[error("ptrace operation failed: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    /// その他のI/Oエラー
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

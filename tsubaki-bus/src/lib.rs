//! Tsubaki コンポーネント間メッセージバス
//!
//! デバッガ側コンポーネントとターゲット側監視コンポーネントの間の
//! メッセージ定義・ワイヤ形式・チャネルを提供します。メッセージコードは
//! 登録順ではなくコンパイル時の明示的な対応表で決まり、両端で
//! 一致していることを検証できます。

pub mod channel;
pub mod error;
pub mod source_loc;
pub mod wire;

pub use channel::{pair, Endpoint};
pub use error::BusError;
pub use source_loc::{NativeLocation, SourceLocation};
pub use wire::{verify_registry, BusMessage};

/// バスの結果型
pub type Result<T> = std::result::Result<T, BusError>;

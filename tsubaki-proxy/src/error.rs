//! プロキシ層のエラー型

use thiserror::Error;
use tsubaki_target::TargetError;

/// ランタイムオブジェクトの読み書きで発生するエラー
#[derive(Debug, Error)]
pub enum ProxyError {
    /// NULLポインタ越しの読み書き
    #[error("null pointer dereference while reading {what}")]
    NullPointer { what: &'static str },

    /// 構造体レイアウトにフィールドが存在しない
    #[error("struct `{struct_name}` has no resolved field `{field}`")]
    MissingField {
        struct_name: String,
        field: &'static str,
    },

    /// 構造体レイアウトが解決されていない
    #[error("no layout resolved for struct `{name}`")]
    UnknownLayout { name: String },

    /// 型オブジェクトがどの既知の型にも対応しない
    #[error("type object at 0x{type_addr:x} is not a known runtime type")]
    UnknownRuntimeType { type_addr: u64 },

    /// ターゲット内のデータが不正
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    /// サポートされないリテラル式
    #[error("Only boolean, numeric or string literals and None are supported.")]
    UnsupportedLiteral,

    /// ランタイムバージョンを特定できない
    #[error("cannot determine runtime version: {0}")]
    VersionUndetected(String),

    /// サポート外のランタイムバージョン
    #[error("runtime version {major}.{minor} is not supported")]
    UnsupportedVersion { major: u32, minor: u32 },

    /// ターゲットアクセスのエラー
    #[error(transparent)]
    Target(#[from] TargetError),
}

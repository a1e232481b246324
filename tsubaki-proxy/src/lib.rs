//! Tsubaki ランタイムオブジェクトプロキシ
//!
//! 検査対象プロセス内のインタプリタオブジェクトを、型付きプロキシとして
//! デバッガ側から読み書きするためのクレートです。構造体レイアウトは
//! DWARFから解決し、失敗した場合はバージョン別の既知オフセット表に
//! フォールバックします。
//!
//! プロキシは（ターゲット参照, アドレス）の軽量ハンドルであり、
//! オブジェクトの内容をキャッシュしません。すべての読み取りは
//! その場でターゲットメモリに当たります。

pub mod alloc;
pub mod children;
pub mod context;
pub mod dwarf;
pub mod error;
pub mod kind;
pub mod layout;
pub mod literal;
pub mod proxies;
pub mod repr;
pub mod structs;
pub mod version;

pub use alloc::{assign_slot, ObjectAllocator};
pub use children::children;
pub use context::{RuntimeContext, WellKnown};
pub use dwarf::DwarfLayoutReader;
pub use error::ProxyError;
pub use kind::{KindRegistry, PyKind};
pub use layout::{FieldDesc, LayoutSet, StructLayout};
pub use literal::{parse_literal, Literal};
pub use proxies::ScalarProxy;
pub use repr::{ReprBuilder, ReprOptions};
pub use structs::object::PyObject;
pub use version::RuntimeVersion;

/// プロキシ層の結果型
pub type Result<T> = std::result::Result<T, ProxyError>;

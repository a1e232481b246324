//! ランタイムコンテキスト
//!
//! ターゲットアクセス・バージョン・レイアウト・型対応表・既知アドレスを
//! 1つにまとめ、検査の呼び出し全体に明示的に引き回す構造体です。
//! グローバル状態は持ちません。

use crate::{KindRegistry, LayoutSet, ProxyError, Result, RuntimeVersion};
use std::sync::Arc;
use tsubaki_target::{ImageSymbols, TargetAccess, TargetAccessExt};

/// インタプリタ内の既知アドレス
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnown {
    /// Noneシングルトン
    pub none: u64,
    /// Trueシングルトン
    pub py_true: u64,
    /// Falseシングルトン
    pub py_false: u64,
    /// str型オブジェクト
    pub str_type: u64,
    /// bytes型オブジェクト
    pub bytes_type: u64,
    /// int型オブジェクト
    pub long_type: u64,
    /// float型オブジェクト
    pub float_type: u64,
    /// complex型オブジェクト
    pub complex_type: u64,
}

impl WellKnown {
    /// インタプリタのシンボルテーブルから既知アドレスを解決する
    pub fn from_symbols(symbols: &ImageSymbols) -> Result<Self> {
        Ok(Self {
            none: symbols.lookup("_Py_NoneStruct")?,
            py_true: symbols.lookup("_Py_TrueStruct")?,
            py_false: symbols.lookup("_Py_FalseStruct")?,
            str_type: symbols.lookup("PyUnicode_Type")?,
            bytes_type: symbols.lookup("PyBytes_Type")?,
            long_type: symbols.lookup("PyLong_Type")?,
            float_type: symbols.lookup("PyFloat_Type")?,
            complex_type: symbols.lookup("PyComplex_Type")?,
        })
    }
}

/// プロセス単位の検査コンテキスト
pub struct RuntimeContext {
    pub target: Arc<dyn TargetAccess>,
    pub version: RuntimeVersion,
    pub layouts: LayoutSet,
    pub kinds: KindRegistry,
    pub well_known: WellKnown,
}

impl RuntimeContext {
    /// アタッチ時にシンボルテーブルからコンテキストを構築する
    pub fn from_symbols(
        target: Arc<dyn TargetAccess>,
        version: RuntimeVersion,
        layouts: LayoutSet,
        symbols: &ImageSymbols,
    ) -> Result<Arc<Self>> {
        let mut kinds = KindRegistry::new();
        for (symbol, kind) in KindRegistry::builtin_symbols() {
            match symbols.try_lookup(symbol) {
                Some(addr) => kinds.register(addr, *kind),
                None => {
                    tracing::warn!(symbol, "builtin type symbol not found");
                }
            }
        }
        let well_known = WellKnown::from_symbols(symbols)?;
        Ok(Arc::new(Self {
            target,
            version,
            layouts,
            kinds,
            well_known,
        }))
    }

    /// テスト・合成ターゲット用のコンテキストを構築する
    pub fn assemble(
        target: Arc<dyn TargetAccess>,
        version: RuntimeVersion,
        layouts: LayoutSet,
        kinds: KindRegistry,
        well_known: WellKnown,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            version,
            layouts,
            kinds,
            well_known,
        })
    }

    /// 構造体フィールドのポインタ値を読む
    pub fn read_field_ptr(
        &self,
        base: u64,
        struct_name: &str,
        field: &'static str,
    ) -> Result<u64> {
        if base == 0 {
            return Err(ProxyError::NullPointer { what: field });
        }
        let desc = self.layouts.field(struct_name, field)?;
        Ok(self.target.read_pointer(base + desc.offset)?)
    }

    /// 構造体フィールドのi64値を読む
    pub fn read_field_i64(
        &self,
        base: u64,
        struct_name: &str,
        field: &'static str,
    ) -> Result<i64> {
        if base == 0 {
            return Err(ProxyError::NullPointer { what: field });
        }
        let desc = self.layouts.field(struct_name, field)?;
        Ok(self.target.read_typed::<i64>(base + desc.offset)?)
    }

    /// 構造体フィールドのi32値を読む
    pub fn read_field_i32(
        &self,
        base: u64,
        struct_name: &str,
        field: &'static str,
    ) -> Result<i32> {
        if base == 0 {
            return Err(ProxyError::NullPointer { what: field });
        }
        let desc = self.layouts.field(struct_name, field)?;
        Ok(self.target.read_typed::<i32>(base + desc.offset)?)
    }
}

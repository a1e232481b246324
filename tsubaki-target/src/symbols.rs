//! イメージのシンボル解決
//!
//! インタプリタ本体とヘルパーモジュールのエクスポートシンボル
//! （型オブジェクト、トレース用静的変数、ヘルパーのデータブロック等）の
//! アドレスをELFシンボルテーブルから引きます。

use crate::{Result, TargetError};
use object::{Object, ObjectSymbol};
use std::collections::HashMap;

/// ロード済みイメージのシンボルテーブル
pub struct ImageSymbols {
    path: String,
    base: u64,
    relocatable: bool,
    by_name: HashMap<String, u64>,
}

impl ImageSymbols {
    /// イメージファイルを解析してシンボルテーブルを構築する
    ///
    /// `base`はターゲット内でのロードベースアドレスです。
    /// PIE/共有ライブラリの場合、シンボル値にベースが加算されます。
    pub fn load(path: &str, base: u64) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| TargetError::BadImage {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let file = object::File::parse(&*data).map_err(|e| TargetError::BadImage {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        let relocatable = matches!(
            file.kind(),
            object::ObjectKind::Dynamic | object::ObjectKind::Relocatable
        );

        let mut by_name = HashMap::new();
        for sym in file.symbols().chain(file.dynamic_symbols()) {
            if let Ok(name) = sym.name() {
                if !name.is_empty() && sym.address() != 0 {
                    by_name.entry(name.to_string()).or_insert(sym.address());
                }
            }
        }

        tracing::debug!(path, symbols = by_name.len(), "loaded image symbols");

        Ok(Self {
            path: path.to_string(),
            base,
            relocatable,
            by_name,
        })
    }

    /// テスト用にシンボルテーブルを直接構築する
    pub fn from_entries(path: &str, entries: &[(&str, u64)]) -> Self {
        Self {
            path: path.to_string(),
            base: 0,
            relocatable: false,
            by_name: entries
                .iter()
                .map(|(name, addr)| (name.to_string(), *addr))
                .collect(),
        }
    }

    /// シンボルのターゲット内アドレスを返す
    pub fn lookup(&self, name: &str) -> Result<u64> {
        self.try_lookup(name)
            .ok_or_else(|| TargetError::SymbolNotFound {
                name: name.to_string(),
                image: self.path.clone(),
            })
    }

    /// シンボルのターゲット内アドレスを返す（存在しない場合はNone）
    pub fn try_lookup(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).map(|value| {
            if self.relocatable {
                self.base + value
            } else {
                *value
            }
        })
    }

    /// イメージのパス
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_reports_missing_symbols() {
        let syms = ImageSymbols::from_entries("/tmp/fake.so", &[("PyLong_Type", 0x1000)]);
        assert_eq!(syms.lookup("PyLong_Type").unwrap(), 0x1000);
        assert!(matches!(
            syms.lookup("PyFloat_Type"),
            Err(TargetError::SymbolNotFound { .. })
        ));
    }
}
